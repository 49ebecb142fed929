//! Subscriber records for session message multiplexing
//!
//! A subscriber is a capability-set record of optional callbacks keyed by a
//! caller-chosen id. Messages addressed to an id are delivered only to that
//! subscriber; unaddressed messages are broadcast to every registered one.

use crate::session::protocol::Envelope;
use serde_json::Value;
use std::sync::Arc;

/// Connection status observed by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Transport handshake in progress
    Connecting,
    /// Transport open
    Connected,
    /// No transport (initial state, or between reconnects)
    Disconnected,
    /// Transport construction failed; a reconnect is scheduled
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Typed payload callback
pub type DataHandler = Arc<dyn Fn(Value) + Send + Sync>;
/// Whole-envelope catch-all callback
pub type EnvelopeHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
/// Connection status callback
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// A named consumer of session messages.
///
/// All callbacks are optional; a subscriber with none still counts toward
/// broadcast (its `on_message` catch-all may be added later by re-registering
/// under the same id, which replaces the record).
#[derive(Clone, Default)]
pub struct Subscriber {
    /// `Progress` payloads
    pub on_progress: Option<DataHandler>,
    /// `Result` payloads
    pub on_result: Option<DataHandler>,
    /// `Error` payloads
    pub on_error: Option<DataHandler>,
    /// `Notify` payloads
    pub on_notify: Option<DataHandler>,
    /// Legacy catch-all, invoked for every dispatched envelope
    pub on_message: Option<EnvelopeHandler>,
    /// Connection status transitions
    pub on_status_change: Option<StatusHandler>,
}

impl Subscriber {
    /// Empty subscriber
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `Progress` handler
    pub fn with_progress(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Set the `Result` handler
    pub fn with_result(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_result = Some(Arc::new(f));
        self
    }

    /// Set the `Error` handler
    pub fn with_error(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Set the `Notify` handler
    pub fn with_notify(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_notify = Some(Arc::new(f));
        self
    }

    /// Set the catch-all envelope handler
    pub fn with_message(mut self, f: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Set the status-change handler
    pub fn with_status_change(
        mut self,
        f: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_status_change = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_result", &self.on_result.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_notify", &self.on_notify.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_status_change", &self.on_status_change.is_some())
            .finish()
    }
}

/// Subscription request used by the subscribing connect overload
#[derive(Clone)]
pub struct SubscribeConfig {
    /// Subscriber key; re-using a key replaces the prior subscriber
    pub task_id: String,
    /// Callback record
    pub handlers: Subscriber,
}
