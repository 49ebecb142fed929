//! Line reassembly for chunked process output
//!
//! Child process streams deliver arbitrary chunks; this buffer accumulates
//! them and splits out complete newline-terminated lines, tolerating lines
//! split across chunks, over-long lines, and missing trailing newlines.
//!
//! Data loss is accepted by design in two places: buffer overflow discards
//! the oldest buffered content (surfaced through `overflow_count`), and
//! over-long lines are truncated rather than dropped. Neither is an error.

use crate::config::LineBufferConfig;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Cumulative line buffer counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LineBufferStats {
    /// Total bytes appended over the buffer's lifetime
    pub total_bytes_received: u64,
    /// Complete lines extracted (truncated lines included)
    pub total_lines_processed: u64,
    /// Byte length of the currently buffered tail
    pub current_buffer_size: usize,
    /// High-water mark of the buffered size
    pub max_buffer_size_reached: usize,
    /// Times overflow handling discarded buffered data
    pub overflow_count: u64,
    /// Unterminated tails flushed as pseudo-lines
    pub incomplete_lines_count: u64,
}

/// Health report for a line buffer
#[derive(Debug, Clone, Serialize)]
pub struct BufferHealth {
    /// False when any issue below is present
    pub healthy: bool,
    /// Detected problems
    pub issues: Vec<String>,
    /// Human-readable remediation hints, parallel to `issues`
    pub recommendations: Vec<String>,
}

/// Reassembles newline-delimited lines from arbitrary text chunks.
///
/// Synchronous by design: the owning capture controller drives the periodic
/// flush timer via [`is_stale`](Self::is_stale).
#[derive(Debug)]
pub struct LineBuffer {
    config: LineBufferConfig,
    buffer: String,
    last_append: Option<Instant>,
    stats: LineBufferStats,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new(config: LineBufferConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            last_append: None,
            stats: LineBufferStats::default(),
        }
    }

    /// Append a decoded chunk and return the complete lines it produced.
    ///
    /// When the append pushes the buffered size past `max_buffer_size`,
    /// overflow handling runs before extraction: buffered content up to and
    /// including the last newline is discarded (the whole buffer if no
    /// newline exists).
    pub fn add_data(&mut self, chunk: &str) -> Vec<String> {
        self.stats.total_bytes_received += chunk.len() as u64;
        self.buffer.push_str(chunk);
        self.last_append = Some(Instant::now());
        if self.buffer.len() > self.stats.max_buffer_size_reached {
            self.stats.max_buffer_size_reached = self.buffer.len();
        }

        if self.buffer.len() > self.config.max_buffer_size {
            self.handle_overflow();
        }

        let lines = self.extract_lines();
        self.stats.current_buffer_size = self.buffer.len();
        lines
    }

    /// Return and clear the trailing unterminated content as a pseudo-line
    pub fn flush_incomplete_line(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        self.last_append = None;
        self.stats.current_buffer_size = 0;
        self.stats.incomplete_lines_count += 1;
        let tail = tail.strip_suffix('\r').unwrap_or(&tail).to_string();
        Some(self.clamp_line(&tail))
    }

    /// Extract any remaining complete lines, then flush the incomplete tail
    pub fn flush_all(&mut self) -> Vec<String> {
        let mut lines = self.extract_lines();
        self.stats.current_buffer_size = self.buffer.len();
        if let Some(tail) = self.flush_incomplete_line() {
            lines.push(tail);
        }
        lines
    }

    /// Whether buffered data has sat unflushed for at least `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        !self.buffer.is_empty()
            && self
                .last_append
                .map(|at| at.elapsed() >= timeout)
                .unwrap_or(false)
    }

    /// Counter snapshot
    pub fn stats(&self) -> LineBufferStats {
        self.stats
    }

    /// Health report based on current counters
    pub fn health(&self) -> BufferHealth {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        let usage = self.buffer.len() as f64 / self.config.max_buffer_size as f64;
        if usage > 0.8 {
            issues.push(format!("buffer usage at {:.0}%", usage * 100.0));
            recommendations.push(
                "increase max_buffer_size or drain lines more frequently".to_string(),
            );
        }

        if self.stats.overflow_count > 0 {
            issues.push(format!(
                "{} overflow(s) discarded buffered output",
                self.stats.overflow_count
            ));
            recommendations.push(
                "increase max_buffer_size; the producing process may be flooding".to_string(),
            );
        }

        if self.stats.incomplete_lines_count > 0
            && self.stats.incomplete_lines_count * 10 > self.stats.total_lines_processed
        {
            issues.push(format!(
                "{} incomplete line(s) against {} complete",
                self.stats.incomplete_lines_count, self.stats.total_lines_processed
            ));
            recommendations.push(
                "output rarely ends with newlines; lower flush_timeout_ms or check the producer"
                    .to_string(),
            );
        }

        BufferHealth {
            healthy: issues.is_empty(),
            issues,
            recommendations,
        }
    }

    /// Discard the oldest buffered content through the last newline, or the
    /// whole buffer if no newline exists or the tail alone is still too big.
    fn handle_overflow(&mut self) {
        match self.buffer.rfind('\n') {
            Some(pos) => {
                self.buffer.drain(..=pos);
            }
            None => self.buffer.clear(),
        }
        if self.buffer.len() > self.config.max_buffer_size {
            self.buffer.clear();
        }
        self.stats.overflow_count += 1;
        tracing::warn!(
            discarded_down_to = self.buffer.len(),
            "Line buffer overflow; oldest buffered output discarded"
        );
    }

    /// Split out every complete line currently buffered
    fn extract_lines(&mut self) -> Vec<String> {
        let last_newline = match self.buffer.rfind('\n') {
            Some(pos) => pos,
            None => return Vec::new(),
        };
        let head: String = self.buffer.drain(..=last_newline).collect();

        let mut lines = Vec::new();
        for raw in head.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            lines.push(self.clamp_line(line));
            self.stats.total_lines_processed += 1;
        }
        lines
    }

    /// Truncate an over-long line to `max_line_length - 3` bytes plus an
    /// ellipsis marker. Truncated lines still count as processed.
    fn clamp_line(&self, line: &str) -> String {
        if line.len() <= self.config.max_line_length {
            return line.to_string();
        }
        let mut cut = self.config.max_line_length.saturating_sub(3);
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        tracing::warn!(
            length = line.len(),
            max = self.config.max_line_length,
            "Truncating over-long line"
        );
        format!("{}...", &line[..cut])
    }
}
