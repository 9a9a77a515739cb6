//! CLI command implementations
//!
//! Each command builds a client from the config file and flags, runs on a
//! dedicated tokio runtime, and prints JSON lines to stdout.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::client::Realtime;
use crate::config::ClientOptions;
use crate::connection::ConnectionState;
use crate::protocol::Message;

use super::args::{Cli, Command, ConnectionArgs};
use super::errors::{CliError, CliResult};
use super::io::{write_json_line, write_response};

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(&cli.connection, cli.command)
}

/// Run one command to completion
pub fn run_command(args: &ConnectionArgs, command: Command) -> CliResult<()> {
    let options = load_options(args)?;
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::io_error(format!("Failed to create tokio runtime: {}", e)))?;

    runtime.block_on(async move {
        match command {
            Command::Subscribe { channel, event } => subscribe(options, &channel, event.as_deref()).await,
            Command::Publish { channel, name, data } => publish(options, &channel, &name, &data).await,
            Command::Presence { channel, enter, watch } => presence(options, &channel, enter.as_deref(), watch).await,
            Command::Ping { count } => ping(options, count).await,
        }
    })
}

/// Client options from the config file (if any) with flags applied on top
pub fn load_options(args: &ConnectionArgs) -> CliResult<ClientOptions> {
    let mut options = match &args.config {
        Some(path) => ClientOptions::from_json_file(path)?,
        None => ClientOptions::default(),
    };

    if let Some(key) = &args.key {
        options.key = Some(key.clone());
    }
    if let Some(token) = &args.token {
        options.token = Some(token.clone());
    }
    if let Some(host) = &args.host {
        options.host = host.clone();
    }
    if let Some(port) = args.port {
        options.port = port;
    }
    if args.tls {
        options.tls = true;
    }
    if let Some(client_id) = &args.client_id {
        options.client_id = Some(client_id.clone());
    }

    options.validate(false)?;
    Ok(options)
}

fn parse_json(raw: &str) -> CliResult<Value> {
    serde_json::from_str(raw).map_err(|e| CliError::invalid_argument(format!("Invalid JSON '{}': {}", raw, e)))
}

/// Build a client and wait until it is connected
async fn connect(options: ClientOptions) -> CliResult<Realtime> {
    let limit = options.realtime_request_timeout() * 2;
    let client = Realtime::new(options)?;
    let connection = client.connection().clone();

    let outcome = tokio::time::timeout(limit, async {
        tokio::select! {
            result = connection.wait_for_state(ConnectionState::Connected) => result.map(|_| true),
            result = connection.wait_for_state(ConnectionState::Failed) => result.map(|_| false),
        }
    })
    .await;

    match outcome {
        Ok(Ok(true)) => {
            tracing::info!(connection_id = ?connection.id(), "connected");
            Ok(client)
        }
        Ok(Ok(false)) => {
            let reason = connection
                .error_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "connection failed".to_string());
            Err(CliError::connection_failed(reason))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(CliError::connection_failed(format!(
            "Not connected after {} ms",
            limit.as_millis()
        ))),
    }
}

fn message_record(channel: &str, message: &Message) -> Value {
    json!({
        "channel": channel,
        "id": message.id,
        "name": message.name,
        "clientId": message.client_id,
        "timestamp": message.timestamp,
        "data": message.data,
    })
}

async fn subscribe(options: ClientOptions, channel_name: &str, event: Option<&str>) -> CliResult<()> {
    let client = connect(options).await?;
    let channel = client.channels().get(channel_name);
    let (_subscription, mut messages) = channel.subscribe_stream();
    channel.attach().await?;
    tracing::info!(channel = %channel_name, "attached");

    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else { break };
                if event.map_or(true, |e| message.name.as_deref() == Some(e)) {
                    write_json_line(&message_record(channel_name, &message))?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close();
    Ok(())
}

async fn publish(options: ClientOptions, channel_name: &str, name: &str, data: &str) -> CliResult<()> {
    let data = parse_json(data)?;
    let client = connect(options).await?;
    let channel = client.channels().get(channel_name);
    channel.publish(name, data).await?;
    write_response(json!({ "channel": channel_name, "name": name }))?;
    client.close();
    Ok(())
}

async fn presence(options: ClientOptions, channel_name: &str, enter: Option<&str>, watch: bool) -> CliResult<()> {
    let enter = enter.map(parse_json).transpose()?;
    let client = connect(options).await?;
    let channel = client.channels().get(channel_name);
    let presence = channel.presence();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    if watch {
        presence.subscribe(move |member| {
            let _ = events_tx.send(member.clone());
        });
    }

    channel.attach().await?;
    if let Some(data) = enter {
        presence.enter(Some(data)).await?;
    }

    let members = presence.get().await?;
    write_response(json!({
        "channel": channel_name,
        "syncComplete": presence.is_sync_complete(),
        "members": members,
    }))?;

    if watch {
        loop {
            tokio::select! {
                member = events.recv() => {
                    let Some(member) = member else { break };
                    write_json_line(&member)?;
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    client.close();
    Ok(())
}

async fn ping(options: ClientOptions, count: u32) -> CliResult<()> {
    let client = connect(options).await?;
    for sequence in 0..count.max(1) {
        let rtt: Duration = client.connection().ping().await?;
        write_json_line(&json!({
            "seq": sequence,
            "rttMs": rtt.as_secs_f64() * 1000.0,
        }))?;
    }
    client.close();
    Ok(())
}
