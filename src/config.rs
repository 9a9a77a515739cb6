//! Client Configuration
//!
//! Options recognized by the realtime client: endpoint, credentials, retry
//! timings and queuing behavior.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::RecoveryKey;
use crate::errors::{RealtimeError, RealtimeResult};

/// Realtime client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Primary realtime host (default: "localhost")
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to connect to (default: 4000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use `wss://` instead of `ws://`
    #[serde(default)]
    pub tls: bool,

    /// Alternate hosts tried when the primary is unreachable
    #[serde(default)]
    pub fallback_hosts: Vec<String>,

    /// API key used for basic authentication
    #[serde(default)]
    pub key: Option<String>,

    /// Static token, used when no auth provider is supplied
    #[serde(default)]
    pub token: Option<String>,

    /// Client identity; `*` allows publishing on behalf of any client id
    #[serde(default)]
    pub client_id: Option<String>,

    /// Recovery key (`{connection_key}:{serial}`) of a previous connection
    #[serde(default)]
    pub recover: Option<String>,

    /// Connect as soon as the client is created (default: true)
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Queue messages while the connection is not yet established (default: true)
    #[serde(default = "default_true")]
    pub queue_messages: bool,

    /// Receive our own published messages (default: true)
    #[serde(default = "default_true")]
    pub echo_messages: bool,

    /// Delay before reconnecting from `Disconnected` (default: 15000)
    #[serde(default = "default_disconnected_retry_timeout_ms")]
    pub disconnected_retry_timeout_ms: u64,

    /// Delay before reconnecting from `Suspended` (default: 30000)
    #[serde(default = "default_suspended_retry_timeout_ms")]
    pub suspended_retry_timeout_ms: u64,

    /// Timeout for connect, attach, detach, close and ping (default: 10000)
    #[serde(default = "default_realtime_request_timeout_ms")]
    pub realtime_request_timeout_ms: u64,

    /// How long `Disconnected` may last before escalating to `Suspended`
    /// (default: 120000)
    #[serde(default = "default_connection_state_ttl_ms")]
    pub connection_state_ttl_ms: u64,

    /// Fail ack-requiring messages not acknowledged within this window
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,

    /// Delay before a channel retries attaching after a failed attempt
    /// (default: 15000)
    #[serde(default = "default_channel_retry_timeout_ms")]
    pub channel_retry_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_true() -> bool {
    true
}

fn default_disconnected_retry_timeout_ms() -> u64 {
    15_000
}

fn default_suspended_retry_timeout_ms() -> u64 {
    30_000
}

fn default_realtime_request_timeout_ms() -> u64 {
    10_000
}

fn default_connection_state_ttl_ms() -> u64 {
    120_000
}

fn default_channel_retry_timeout_ms() -> u64 {
    15_000
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: false,
            fallback_hosts: Vec::new(),
            key: None,
            token: None,
            client_id: None,
            recover: None,
            auto_connect: default_true(),
            queue_messages: default_true(),
            echo_messages: default_true(),
            disconnected_retry_timeout_ms: default_disconnected_retry_timeout_ms(),
            suspended_retry_timeout_ms: default_suspended_retry_timeout_ms(),
            realtime_request_timeout_ms: default_realtime_request_timeout_ms(),
            connection_state_ttl_ms: default_connection_state_ttl_ms(),
            ack_timeout_ms: None,
            channel_retry_timeout_ms: default_channel_retry_timeout_ms(),
        }
    }
}

impl ClientOptions {
    /// Options authenticating with an API key
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Options authenticating with a static token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Load options from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> RealtimeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RealtimeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let options: ClientOptions = serde_json::from_str(&raw).map_err(|e| {
            RealtimeError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(options)
    }

    /// Reject option combinations the client cannot work with.
    ///
    /// `has_auth_provider` tells whether credentials come from an injected
    /// provider rather than from `key`/`token`.
    pub fn validate(&self, has_auth_provider: bool) -> RealtimeResult<()> {
        if self.key.is_none() && self.token.is_none() && !has_auth_provider {
            return Err(RealtimeError::ConfigError(
                "No key, token or auth provider configured".into(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(RealtimeError::ConfigError("Host must not be empty".into()));
        }
        if self.realtime_request_timeout_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "realtime_request_timeout_ms must be positive".into(),
            ));
        }
        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() {
                return Err(RealtimeError::ConfigError(
                    "client_id must not be empty".into(),
                ));
            }
        }
        if let Some(recover) = &self.recover {
            if RecoveryKey::parse(recover).is_none() {
                return Err(RealtimeError::ConfigError(format!(
                    "Malformed recovery key '{}'",
                    recover
                )));
            }
        }
        Ok(())
    }

    /// Endpoint URL for a host
    pub fn endpoint(&self, host: &str) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}/", scheme, host, self.port)
    }

    pub fn disconnected_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms)
    }

    pub fn suspended_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms)
    }

    pub fn realtime_request_timeout(&self) -> Duration {
        Duration::from_millis(self.realtime_request_timeout_ms)
    }

    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn channel_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_retry_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.host, "localhost");
        assert_eq!(options.port, 4000);
        assert!(options.queue_messages);
        assert!(options.echo_messages);
        assert_eq!(options.disconnected_retry_timeout(), Duration::from_secs(15));
        assert_eq!(options.realtime_request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_endpoint() {
        let mut options = ClientOptions::with_key("app.key:secret");
        assert_eq!(options.endpoint("localhost"), "ws://localhost:4000/");
        options.tls = true;
        options.port = 443;
        assert_eq!(options.endpoint("rt.example.com"), "wss://rt.example.com:443/");
    }

    #[test]
    fn test_validate_requires_credentials() {
        let options = ClientOptions::default();
        assert!(matches!(
            options.validate(false),
            Err(RealtimeError::ConfigError(_))
        ));
        assert!(options.validate(true).is_ok());
        assert!(ClientOptions::with_token("abc").validate(false).is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_recovery_key() {
        let mut options = ClientOptions::with_key("app.key:secret");
        options.recover = Some("key-1:7".into());
        assert!(options.validate(false).is_ok());

        for bad in ["key-1", ":7", "key-1:seven"] {
            options.recover = Some(bad.into());
            assert!(matches!(
                options.validate(false),
                Err(RealtimeError::ConfigError(_))
            ));
        }
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"key": "app.key:secret", "client_id": "alice", "queue_messages": false}}"#
        )
        .unwrap();

        let options = ClientOptions::from_json_file(file.path()).unwrap();
        assert_eq!(options.key.as_deref(), Some("app.key:secret"));
        assert_eq!(options.client_id.as_deref(), Some("alice"));
        assert!(!options.queue_messages);
        assert_eq!(options.port, 4000);
        assert_eq!(options.suspended_retry_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = ClientOptions::from_json_file("/nonexistent/aerolink.json");
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));
    }
}
