//! Backend session layer
//!
//! One persistent WebSocket connection to the local backend, shared by any
//! number of logical subscribers. See [`SessionManager`] for the connection
//! lifecycle and [`protocol`] for the wire format.

pub mod backoff;
pub mod manager;
pub mod protocol;
pub mod subscriber;

pub use manager::{ConnectionInfo, SessionManager};
pub use protocol::{Envelope, MessageType};
pub use subscriber::{ConnectionStatus, SubscribeConfig, Subscriber};
