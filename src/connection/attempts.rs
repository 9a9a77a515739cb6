//! Reconnection bookkeeping
//!
//! Records failed connection attempts for the current failure cycle and
//! derives the retry policy from them: when to escalate from `Disconnected`
//! to `Suspended`, how long to wait, and whether to try a fallback host.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

use super::state::ConnectionState;
use crate::errors::ErrorInfo;

/// One failed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionAttempt {
    pub at: Instant,
    pub state: ConnectionState,
    pub error: Option<ErrorInfo>,
}

/// Failed attempts since the connection was last established. Only the
/// count and the latest attempt are kept, however long the cycle runs.
#[derive(Debug, Default)]
pub struct AttemptsInfo {
    count: usize,
    last: Option<ConnectionAttempt>,
    first_failure: Option<Instant>,
}

impl AttemptsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, at: Instant, state: ConnectionState, error: Option<ErrorInfo>) {
        if self.first_failure.is_none() {
            self.first_failure = Some(at);
        }
        self.count = self.count.saturating_add(1);
        self.last = Some(ConnectionAttempt { at, state, error });
    }

    /// Forget the cycle once a connection is established
    pub fn reset(&mut self) {
        self.count = 0;
        self.last = None;
        self.first_failure = None;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn last(&self) -> Option<&ConnectionAttempt> {
        self.last.as_ref()
    }

    /// The failure cycle has outlived the server's connection state
    pub fn should_suspend(&self, now: Instant, connection_state_ttl: Duration) -> bool {
        self.first_failure
            .map_or(false, |first| now.saturating_duration_since(first) >= connection_state_ttl)
    }

    /// Retry against a fallback host: only for retryable errors while
    /// disconnected or suspended
    pub fn should_use_fallback(state: ConnectionState, error: Option<&ErrorInfo>) -> bool {
        matches!(state, ConnectionState::Disconnected | ConnectionState::Suspended)
            && error.map_or(false, ErrorInfo::is_retryable)
    }

    /// Delay before the next attempt: `base * min((n + 2) / 3, 2)` scaled by
    /// a jitter factor in `[0.8, 1.0]`, where `n` counts failures so far
    pub fn retry_delay(&self, base: Duration, rng: &mut impl Rng) -> Duration {
        let n = self.count.max(1) as f64;
        let backoff = ((n + 2.0) / 3.0).min(2.0);
        let jitter = 1.0 - rng.gen_range(0.0..0.2);
        base.mul_f64(backoff * jitter)
    }
}

/// Picks the host for each connection attempt
#[derive(Debug, Clone)]
pub struct HostSelector {
    primary: String,
    fallbacks: Vec<String>,
    current: String,
}

impl HostSelector {
    pub fn new(primary: String, fallbacks: Vec<String>) -> Self {
        Self {
            current: primary.clone(),
            primary,
            fallbacks,
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    /// Host for the next attempt. Falls back to a random alternate other than
    /// the current host when asked to and alternates exist.
    pub fn next_host(&mut self, use_fallback: bool, rng: &mut impl Rng) -> &str {
        if !use_fallback || self.fallbacks.is_empty() {
            self.current = self.primary.clone();
            return &self.current;
        }
        let candidates: Vec<&String> = self
            .fallbacks
            .iter()
            .filter(|h| **h != self.current)
            .collect();
        if let Some(host) = candidates.choose(rng) {
            self.current = (*host).clone();
        }
        &self.current
    }
}
