//! aerolink CLI entry point
//!
//! Initializes logging, then delegates everything to the CLI module.
//! Errors are printed to stderr and exit non-zero.

use aerolink::cli;
use tracing_subscriber::EnvFilter;

/// Log filter from `AEROLINK_LOG`, then `RUST_LOG`, defaulting to warnings
fn init_logging() {
    let filter = std::env::var("AEROLINK_LOG")
        .ok()
        .and_then(|filter| EnvFilter::try_new(filter).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    if let Err(e) = cli::run() {
        let _ = cli::write_error(e.code_str(), e.message());
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
