//! CLI argument definitions using clap
//!
//! Commands:
//! - aerolink subscribe <channel>
//! - aerolink publish <channel> <name> <data>
//! - aerolink presence <channel>
//! - aerolink ping

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// aerolink - realtime pub/sub client
#[derive(Parser, Debug)]
#[command(name = "aerolink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Where and how to connect. Flags override values from the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Path to a JSON client options file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// API key
    #[arg(long, global = true, env = "AEROLINK_KEY")]
    pub key: Option<String>,

    /// Access token
    #[arg(long, global = true, env = "AEROLINK_TOKEN")]
    pub token: Option<String>,

    /// Server host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Use wss://
    #[arg(long, global = true)]
    pub tls: bool,

    /// Client id to connect as
    #[arg(long, global = true)]
    pub client_id: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print messages published on a channel as JSON lines
    Subscribe {
        channel: String,

        /// Only print messages with this name
        #[arg(long)]
        event: Option<String>,
    },

    /// Publish one message and wait for its acknowledgement
    Publish {
        channel: String,

        /// Message name
        name: String,

        /// Message data as JSON
        data: String,
    },

    /// Print the members present on a channel
    Presence {
        channel: String,

        /// Enter with this JSON data before listing
        #[arg(long)]
        enter: Option<String>,

        /// Keep running and print presence events
        #[arg(long)]
        watch: bool,
    },

    /// Measure heartbeat round trips
    Ping {
        /// Number of pings
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
