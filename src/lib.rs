//! AutoDeck client core - backend session and process log capture
//!
//! The two halves of the desktop client's plumbing:
//!
//! - [`session`]: a persistent WebSocket client to the local backend's
//!   realtime endpoint. One connection per process, kept alive with
//!   heartbeats and an unconditional exponential-backoff reconnect loop.
//!   Consumers register named subscribers and receive typed, optionally
//!   task-addressed messages.
//! - [`capture`]: attaches line buffers to a spawned child process's stdout
//!   and stderr and streams its output as complete lines, with overflow and
//!   over-long-line protection and timeout-based flushing of partial lines.
//!
//! ## Modules
//!
//! - [`session`]: session manager, wire protocol, subscribers, backoff
//! - [`capture`]: line buffer and capture controller
//! - [`config`]: configuration management
//! - [`error`]: crate error type

pub mod capture;
pub mod config;
pub mod error;
pub mod session;

pub use config::AutoDeckConfig;
pub use error::{Error, Result};
