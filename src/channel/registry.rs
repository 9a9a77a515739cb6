//! Channel registry
//!
//! Channels are created lazily on first [`Channels::get`] and live until
//! [`Channels::release`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use super::handle::RealtimeChannel;
use super::state::{ChannelOptions, ChannelShared};
use crate::connection::manager::Command;
use crate::connection::Connection;
use crate::errors::{RealtimeError, RealtimeResult};

/// The client's channels, keyed by name
#[derive(Debug, Clone)]
pub struct Channels {
    connection: Connection,
    channels: Arc<Mutex<HashMap<String, RealtimeChannel>>>,
}

impl Channels {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            connection,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RealtimeChannel>> {
        // Nothing user-supplied runs under this lock
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The channel called `name`, created with default options if needed
    pub fn get(&self, name: &str) -> RealtimeChannel {
        self.get_or_create(name, None)
    }

    /// The channel called `name`; `options` replace those of an existing
    /// channel
    pub fn get_with_options(&self, name: &str, options: ChannelOptions) -> RealtimeChannel {
        self.get_or_create(name, Some(options))
    }

    fn get_or_create(&self, name: &str, options: Option<ChannelOptions>) -> RealtimeChannel {
        let mut channels = self.lock();
        if let Some(channel) = channels.get(name) {
            if let Some(options) = options {
                channel.set_options(options);
            }
            return channel.clone();
        }

        let shared = Arc::new(ChannelShared::new(options.unwrap_or_default()));
        let command = Command::CreateChannel {
            name: name.to_string(),
            shared: Arc::clone(&shared),
        };
        if self.connection.send_command(command).is_err() {
            tracing::warn!(channel = %name, "channel created after the connection task stopped");
        }
        tracing::debug!(channel = %name, "channel created");

        let channel = RealtimeChannel::new(name, self.connection.clone(), shared);
        channels.insert(name.to_string(), channel.clone());
        channel
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Names of all live channels, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Detach the channel and forget it. Outstanding handles stop working.
    pub async fn release(&self, name: &str) -> RealtimeResult<()> {
        let (reply, rx) = oneshot::channel();
        {
            // The release must be queued before any CreateChannel for a
            // channel of the same name obtained after the removal
            let mut channels = self.lock();
            if channels.remove(name).is_none() {
                return Ok(());
            }
            self.connection.send_command(Command::ReleaseChannel {
                name: name.to_string(),
                reply,
            })?;
        }
        rx.await.map_err(|_| RealtimeError::ConnectionClosed)?
    }
}
