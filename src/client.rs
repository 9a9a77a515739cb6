//! # Realtime Client
//!
//! Entry point wiring options, credentials, codec and transport into a
//! running connection task. Collaborators are injected through
//! [`RealtimeBuilder`]; nothing is read from global state.

use std::sync::Arc;

use crate::auth::{AuthProvider, AuthSource};
use crate::channel::Channels;
use crate::config::ClientOptions;
use crate::connection::manager::{self, ConnectionSetup};
use crate::connection::Connection;
use crate::errors::{RealtimeError, RealtimeResult};
use crate::protocol::{Codec, JsonCodec};
use crate::transport::{TransportFactory, WebSocketTransportFactory};

/// Realtime client: one connection and its channels
#[derive(Debug, Clone)]
pub struct Realtime {
    options: Arc<ClientOptions>,
    connection: Connection,
    channels: Channels,
}

impl Realtime {
    /// Build a client with the WebSocket transport and JSON codec. Must be
    /// called within a tokio runtime.
    pub fn new(options: ClientOptions) -> RealtimeResult<Self> {
        Self::builder(options).build()
    }

    pub fn builder(options: ClientOptions) -> RealtimeBuilder {
        RealtimeBuilder::new(options)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Identity of this client, once known
    pub fn client_id(&self) -> Option<String> {
        self.connection.client_id()
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

/// Configures the collaborators of a [`Realtime`] client
pub struct RealtimeBuilder {
    options: ClientOptions,
    transport: Arc<dyn TransportFactory>,
    codec: Arc<dyn Codec>,
    auth_provider: Option<Arc<dyn AuthProvider>>,
}

impl RealtimeBuilder {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            transport: Arc::new(WebSocketTransportFactory),
            codec: Arc::new(JsonCodec),
            auth_provider: None,
        }
    }

    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = factory;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Obtain tokens from `provider` instead of the configured key/token
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    /// Validate the options and start the connection task. Connects right
    /// away when `auto_connect` is set.
    pub fn build(self) -> RealtimeResult<Realtime> {
        self.options.validate(self.auth_provider.is_some())?;
        let auth = AuthSource::from_options(&self.options, self.auth_provider)
            .ok_or_else(|| RealtimeError::ConfigError("No credentials configured".into()))?;

        let auto_connect = self.options.auto_connect;
        let options = Arc::new(self.options.clone());
        let connection = manager::spawn(ConnectionSetup {
            options: self.options,
            codec: self.codec,
            factory: self.transport,
            auth,
        });
        let channels = Channels::new(connection.clone());

        tracing::debug!(host = %options.host, auto_connect, "realtime client created");
        if auto_connect {
            connection.connect();
        }

        Ok(Realtime {
            options,
            connection,
            channels,
        })
    }
}
