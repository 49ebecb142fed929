//! AutoDeck error types

use thiserror::Error;

/// AutoDeck error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session/connection error
    #[error("Session error: {0}")]
    Session(String),

    /// Log capture error
    #[error("Capture error: {0}")]
    Capture(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type alias for AutoDeck operations
pub type Result<T> = std::result::Result<T, Error>;
