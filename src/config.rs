//! AutoDeck configuration management

use serde::{Deserialize, Serialize};

/// Main AutoDeck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoDeckConfig {
    /// Backend session (WebSocket) configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Process log capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Backend session configuration
///
/// The session manager keeps a single long-lived WebSocket connection to the
/// local backend's realtime endpoint at `ws://<host>:<port>/api/core/ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Backend host
    pub host: String,

    /// Backend port
    pub port: u16,

    /// Realtime endpoint path
    pub path: String,

    /// Heartbeat ping interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// How long to wait for a pong before logging a warning, in milliseconds
    pub heartbeat_timeout_ms: u64,

    /// Base reconnect delay in milliseconds (doubled per attempt)
    pub reconnect_base_delay_ms: u64,

    /// Maximum reconnect delay in milliseconds
    pub reconnect_max_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18780,
            path: "/api/core/ws".to_string(),
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 5_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl SessionConfig {
    /// Full WebSocket endpoint URL
    pub fn endpoint_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Line buffer configuration
///
/// Chunks from a process stream are decoded as UTF-8 (lossily) and
/// reassembled into newline-delimited lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineBufferConfig {
    /// Maximum buffered bytes before overflow handling kicks in
    pub max_buffer_size: usize,

    /// Maximum line length in bytes; longer lines are truncated
    pub max_line_length: usize,

    /// Force-flush a trailing unterminated line after this many milliseconds
    pub flush_timeout_ms: u64,
}

impl Default for LineBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1024 * 1024,
            max_line_length: 64 * 1024,
            flush_timeout_ms: 1_000,
        }
    }
}

/// Capture controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Per-stream line buffer options
    #[serde(default)]
    pub buffer: LineBufferConfig,

    /// Schedule a reconnect attempt when the captured process exits
    pub auto_reconnect: bool,

    /// Delay before a reconnect attempt, in milliseconds
    pub reconnect_interval_ms: u64,

    /// Maximum reconnect attempts before capture stops
    pub max_reconnect_attempts: u32,

    /// Keep capturing after a stream error (errors become informational)
    pub enable_error_recovery: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer: LineBufferConfig::default(),
            auto_reconnect: true,
            reconnect_interval_ms: 2_000,
            max_reconnect_attempts: 5,
            enable_error_recovery: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint_url() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoint_url(), "ws://127.0.0.1:18780/api/core/ws");
    }

    #[test]
    fn test_defaults_match_protocol_constants() {
        let session = SessionConfig::default();
        assert_eq!(session.heartbeat_interval_ms, 15_000);
        assert_eq!(session.heartbeat_timeout_ms, 5_000);
        assert_eq!(session.reconnect_base_delay_ms, 1_000);
        assert_eq!(session.reconnect_max_delay_ms, 30_000);

        let buffer = LineBufferConfig::default();
        assert_eq!(buffer.max_buffer_size, 1024 * 1024);
        assert_eq!(buffer.max_line_length, 64 * 1024);
        assert_eq!(buffer.flush_timeout_ms, 1_000);

        let capture = CaptureConfig::default();
        assert!(capture.auto_reconnect);
        assert_eq!(capture.reconnect_interval_ms, 2_000);
        assert_eq!(capture.max_reconnect_attempts, 5);
        assert!(capture.enable_error_recovery);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AutoDeckConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: AutoDeckConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.session.port, config.session.port);
        assert_eq!(parsed.capture.buffer.max_buffer_size, config.capture.buffer.max_buffer_size);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autodeck.toml");
        std::fs::write(
            &path,
            toml::to_string_pretty(&AutoDeckConfig::default()).unwrap(),
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let config: AutoDeckConfig = toml::from_str(&content).unwrap();
        assert_eq!(config.session.port, 18780);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: AutoDeckConfig = toml::from_str(
            r#"
            [session]
            host = "127.0.0.1"
            port = 9001
            path = "/api/core/ws"
            heartbeat_interval_ms = 15000
            heartbeat_timeout_ms = 5000
            reconnect_base_delay_ms = 1000
            reconnect_max_delay_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(parsed.session.port, 9001);
        // Capture section absent entirely -> defaults
        assert_eq!(parsed.capture.max_reconnect_attempts, 5);
    }
}
