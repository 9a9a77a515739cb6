//! CLI module for aerolink
//!
//! Provides a command-line front-end for:
//! - subscribe: print channel messages as JSON lines
//! - publish: publish one message and wait for its ack
//! - presence: list (and optionally enter or watch) channel members
//! - ping: heartbeat round-trip times

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, ConnectionArgs};
pub use commands::{load_options, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_json_line, write_response};
