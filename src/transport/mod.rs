//! # Transport Layer
//!
//! Abstract duplex channel carrying encoded frames. A transport reports what
//! happens to it through [`TransportEvent`]s on the channel handed to its
//! factory; the connection owns the receiving end and drops it together
//! with the transport, so events from a replaced transport are never seen.

pub mod websocket;

use tokio::sync::mpsc;
use url::Url;

use crate::auth::Credentials;
use crate::errors::{ErrorInfo, RealtimeError, RealtimeResult};

pub use websocket::WebSocketTransportFactory;

/// Protocol version sent as the `v` connect parameter
pub const PROTOCOL_VERSION: &str = "2";

/// Sender half handed to a transport
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half owned by the connection
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Something that happened to a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The socket is open; the protocol handshake has not completed yet
    Opened,
    /// An encoded frame arrived
    Data(Vec<u8>),
    /// The socket is gone. `None` for an orderly close requested by us.
    Closed(Option<ErrorInfo>),
}

/// Parameters for one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub host: String,
    /// Full endpoint URL without query parameters
    pub endpoint: String,
    pub credentials: Credentials,
    pub client_id: Option<String>,
    pub format: &'static str,
    pub echo: bool,
    /// Connection key of the connection being resumed
    pub resume: Option<String>,
    /// Recovery key from a previous client instance
    pub recover: Option<String>,
}

impl TransportParams {
    /// Query parameters of the connect request
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("v", PROTOCOL_VERSION.to_string()),
            ("format", self.format.to_string()),
            ("echo", self.echo.to_string()),
        ];
        match &self.credentials {
            Credentials::Key(key) => pairs.push(("key", key.clone())),
            Credentials::Token(token) => pairs.push(("accessToken", token.clone())),
        }
        if let Some(client_id) = &self.client_id {
            pairs.push(("clientId", client_id.clone()));
        }
        if let Some(resume) = &self.resume {
            pairs.push(("resume", resume.clone()));
        } else if let Some(recover) = &self.recover {
            pairs.push(("recover", recover.clone()));
        }
        pairs
    }

    /// Endpoint URL with query parameters
    pub fn url(&self) -> RealtimeResult<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| RealtimeError::ConfigError(format!("Invalid endpoint '{}': {}", self.endpoint, e)))?;
        url.query_pairs_mut().extend_pairs(self.query_pairs());
        Ok(url)
    }
}

/// An open (or opening) transport
pub trait Transport: Send {
    /// Queue an encoded frame for sending
    fn send(&mut self, payload: Vec<u8>) -> RealtimeResult<()>;

    /// Close the socket. Idempotent.
    fn close(&mut self);
}

/// Creates transports; each call starts a new connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        params: TransportParams,
        binary: bool,
        events: TransportEventSender,
    ) -> RealtimeResult<Box<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TransportParams {
        TransportParams {
            host: "localhost".into(),
            endpoint: "ws://localhost:4000/".into(),
            credentials: Credentials::Key("app.key:se/cret".into()),
            client_id: Some("alice".into()),
            format: "json",
            echo: false,
            resume: None,
            recover: Some("key:5".into()),
        }
    }

    #[test]
    fn test_query_pairs() {
        let pairs = params().query_pairs();
        assert!(pairs.contains(&("format", "json".to_string())));
        assert!(pairs.contains(&("echo", "false".to_string())));
        assert!(pairs.contains(&("recover", "key:5".to_string())));
    }

    #[test]
    fn test_resume_wins_over_recover() {
        let mut p = params();
        p.resume = Some("conn-key".into());
        let pairs = p.query_pairs();
        assert!(pairs.contains(&("resume", "conn-key".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "recover"));
    }

    #[test]
    fn test_url_encodes_values() {
        let url = params().url().unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
        assert!(url.as_str().starts_with("ws://localhost:4000/?v=2"));
        assert!(url.as_str().contains("key=app.key%3Ase%2Fcret"));

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("key".to_string(), "app.key:se/cret".to_string())));
        assert!(pairs.contains(&("clientId".to_string(), "alice".to_string())));
    }

    #[test]
    fn test_url_rejects_malformed_endpoint() {
        let mut p = params();
        p.endpoint = "not a url".into();
        match p.url() {
            Err(RealtimeError::ConfigError(_)) => {}
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
