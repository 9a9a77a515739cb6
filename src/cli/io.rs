//! JSON line output for the CLI
//!
//! Every record printed to stdout is one JSON object on its own line.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

use super::errors::CliResult;

/// Write one serializable record as a JSON line
pub fn write_json_line<T: Serialize>(record: &T) -> CliResult<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, record)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

/// Write a success response
pub fn write_response(data: Value) -> CliResult<()> {
    write_json_line(&serde_json::json!({
        "status": "ok",
        "data": data
    }))
}

/// Write an error response
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_json_line(&serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    }))
}
