//! # Acknowledgement Tracker
//!
//! Every outbound message that requests an acknowledgement is stamped with
//! the next message serial and held here until an `Ack`/`Nack` covering its
//! serial arrives, the connection fails, or its channel fails. Each callback
//! is resolved exactly once.
//!
//! The pending list is only mutated under the tracker lock. Callbacks are
//! collected under the lock and invoked after it is released, so a callback
//! may publish again without deadlocking.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::{codes, ErrorInfo};
use crate::protocol::{Action, ProtocolMessage};

/// Outcome delivered to an acknowledgement callback
pub type AckResult = Result<(), ErrorInfo>;

/// Completion for one outbound message
pub struct AckCallback(Box<dyn FnOnce(AckResult) + Send>);

impl AckCallback {
    /// Wrap a user callback
    pub fn new(f: impl FnOnce(AckResult) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Callback resolving a future
    pub fn channel() -> (Self, oneshot::Receiver<AckResult>) {
        let (tx, rx) = oneshot::channel();
        let callback = Self::new(move |result| {
            // The caller may have stopped waiting
            let _ = tx.send(result);
        });
        (callback, rx)
    }

    /// Run the callback, containing any panic it raises
    pub fn invoke(self, result: AckResult) {
        if catch_unwind(AssertUnwindSafe(|| (self.0)(result))).is_err() {
            tracing::error!("acknowledgement callback panicked");
        }
    }
}

impl fmt::Debug for AckCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckCallback")
    }
}

/// A sent message awaiting its acknowledgement
#[derive(Debug)]
pub struct PendingMessage {
    pub message: ProtocolMessage,
    callback: AckCallback,
    queued_at: Instant,
}

impl PendingMessage {
    fn serial(&self) -> i64 {
        self.message.msg_serial.unwrap_or(i64::MIN)
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_serial: i64,
    pending: VecDeque<PendingMessage>,
}

/// Tracks ack-requiring messages in serial order
#[derive(Debug, Default)]
pub struct AckTracker {
    inner: Mutex<Inner>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Callbacks never run under the lock, so a poisoned lock still
        // guards a consistent list.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// If `message` requires an acknowledgement, stamp it with the next
    /// serial and register `callback`. Otherwise hand the callback back.
    pub fn queue_if_necessary(
        &self,
        message: &mut ProtocolMessage,
        callback: AckCallback,
        now: Instant,
    ) -> Option<AckCallback> {
        if !message.ack_required() {
            return Some(callback);
        }

        let mut inner = self.lock();
        let serial = inner.next_serial;
        inner.next_serial += 1;
        message.msg_serial = Some(serial);
        inner.pending.push_back(PendingMessage {
            message: message.clone(),
            callback,
            queued_at: now,
        });
        tracing::debug!(serial, channel = ?message.channel, "registered message awaiting ack");
        None
    }

    /// Resolve pending messages covered by an `Ack` or `Nack`.
    ///
    /// Returns true when the frame was an `Ack`/`Nack` and has been consumed.
    pub fn on_message_received(&self, message: &ProtocolMessage) -> bool {
        let success = match message.action {
            Action::Ack => true,
            Action::Nack => false,
            _ => return false,
        };

        let Some(end_serial) = message.end_serial() else {
            tracing::warn!(action = %message.action, "acknowledgement without a usable serial range");
            return true;
        };

        let resolved: Vec<PendingMessage> = {
            let mut inner = self.lock();
            let mut resolved = Vec::new();
            while inner
                .pending
                .front()
                .map_or(false, |p| p.serial() <= end_serial)
            {
                if let Some(pending) = inner.pending.pop_front() {
                    resolved.push(pending);
                }
            }
            resolved
        };

        if resolved.is_empty() {
            tracing::debug!(end_serial, "acknowledgement matched no pending messages");
        }

        let error = message.error.clone().unwrap_or_else(|| {
            ErrorInfo::with_status(codes::INTERNAL, 500, "Message rejected by the server")
        });
        for pending in resolved {
            let result = if success { Ok(()) } else { Err(error.clone()) };
            pending.callback.invoke(result);
        }
        true
    }

    /// Fail and drop every pending message
    pub fn clear_queue_and_fail_messages(&self, error: &ErrorInfo) -> usize {
        let drained: Vec<PendingMessage> = self.lock().pending.drain(..).collect();
        let count = drained.len();
        for pending in drained {
            pending.callback.invoke(Err(error.clone()));
        }
        if count > 0 {
            tracing::info!(count, code = error.code, "failed pending messages");
        }
        count
    }

    /// Fail and drop only the pending messages of one channel
    pub fn fail_channel_messages(&self, channel: &str, error: &ErrorInfo) -> usize {
        let failed: Vec<PendingMessage> = {
            let mut inner = self.lock();
            let (failed, kept): (VecDeque<_>, VecDeque<_>) = inner
                .pending
                .drain(..)
                .partition(|p| p.message.channel.as_deref() == Some(channel));
            inner.pending = kept;
            failed.into_iter().collect()
        };
        let count = failed.len();
        for pending in failed {
            pending.callback.invoke(Err(error.clone()));
        }
        count
    }

    /// Fail one pending message, e.g. when it could not be encoded
    pub fn fail_serial(&self, serial: i64, error: &ErrorInfo) -> bool {
        let failed = {
            let mut inner = self.lock();
            let position = inner.pending.iter().position(|p| p.serial() == serial);
            position.and_then(|index| inner.pending.remove(index))
        };
        match failed {
            Some(pending) => {
                pending.callback.invoke(Err(error.clone()));
                true
            }
            None => false,
        }
    }

    /// Fail messages that have waited longer than `timeout`
    pub fn fail_timed_out(&self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<PendingMessage> = {
            let mut inner = self.lock();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = inner
                .pending
                .drain(..)
                .partition(|p| p.queued_at + timeout <= now);
            inner.pending = kept;
            expired.into_iter().collect()
        };
        let count = expired.len();
        for pending in expired {
            pending
                .callback
                .invoke(Err(ErrorInfo::timeout("Timed out waiting for acknowledgement")));
        }
        count
    }

    /// When the oldest pending message would time out
    pub fn next_timeout(&self, timeout: Duration) -> Option<Instant> {
        self.lock()
            .pending
            .iter()
            .map(|p| p.queued_at + timeout)
            .min()
    }

    /// Messages to send again after a reconnect, in serial order.
    ///
    /// After a successful resume the original serials stay valid. On a new
    /// connection serials restart at zero and pending messages are
    /// re-stamped in their original order.
    pub fn messages_for_resend(&self, resumed: bool) -> Vec<ProtocolMessage> {
        let mut inner = self.lock();
        if !resumed {
            let mut serial = 0;
            for pending in inner.pending.iter_mut() {
                pending.message.msg_serial = Some(serial);
                serial += 1;
            }
            inner.next_serial = serial;
        }
        inner.pending.iter().map(|p| p.message.clone()).collect()
    }

    /// Serial the next ack-requiring message will receive
    pub fn next_serial(&self) -> i64 {
        self.lock().next_serial
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Serials currently awaiting acknowledgement, in order
    pub fn pending_serials(&self) -> Vec<i64> {
        self.lock().pending.iter().map(PendingMessage::serial).collect()
    }
}
