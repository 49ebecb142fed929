//! Capture controller
//!
//! Attaches per-stream line buffers to a spawned child process's stdout and
//! stderr, emits reassembled lines through a callback tagged with the source
//! stream, and does exit bookkeeping. The controller never respawns processes
//! itself; on exit it invokes the reconnect hook after a delay, and whoever
//! wired the hook decides whether to spawn a replacement and re-attach.

use crate::capture::line_buffer::{BufferHealth, LineBuffer, LineBufferStats};
use crate::config::CaptureConfig;
use bytes::BytesMut;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Which child stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured line callback
pub type LineCallback = Arc<dyn Fn(&str, StreamSource) + Send + Sync>;
/// Stream error callback
pub type CaptureErrorCallback = Arc<dyn Fn(&crate::Error) + Send + Sync>;
/// Capture active/inactive transitions
pub type CaptureStatusCallback = Arc<dyn Fn(bool) + Send + Sync>;
/// Invoked with the attempt number when a reconnect is due
pub type ReconnectHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Merged capture snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStats {
    pub is_capturing: bool,
    /// Unix ms of the last `start_capture`, 0 if never started
    pub started_at_ms: u64,
    pub pid: Option<u32>,
    pub reconnect_attempts: u32,
    /// Lines handed to the line callback, flushed partials included
    pub lines_emitted: u64,
    pub stdout: LineBufferStats,
    pub stderr: LineBufferStats,
}

/// Per-stream buffer health, merged
#[derive(Debug, Clone, Serialize)]
pub struct CaptureHealth {
    pub healthy: bool,
    pub stdout: BufferHealth,
    pub stderr: BufferHealth,
}

struct CaptureInner {
    config: CaptureConfig,
    is_capturing: AtomicBool,
    started_at_ms: AtomicU64,
    pid: AtomicU32,
    reconnect_attempts: AtomicU32,
    lines_emitted: AtomicU64,
    stdout_buffer: Mutex<LineBuffer>,
    stderr_buffer: Mutex<LineBuffer>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    line_callback: RwLock<Option<LineCallback>>,
    error_callback: RwLock<Option<CaptureErrorCallback>>,
    status_callback: RwLock<Option<CaptureStatusCallback>>,
    reconnect_hook: RwLock<Option<ReconnectHook>>,
}

impl CaptureInner {
    fn buffer_for(&self, source: StreamSource) -> &Mutex<LineBuffer> {
        match source {
            StreamSource::Stdout => &self.stdout_buffer,
            StreamSource::Stderr => &self.stderr_buffer,
        }
    }

    async fn emit_lines(&self, lines: &[String], source: StreamSource) {
        if lines.is_empty() {
            return;
        }
        self.lines_emitted
            .fetch_add(lines.len() as u64, Ordering::SeqCst);
        let callback = self.line_callback.read().await.clone();
        if let Some(callback) = callback {
            for line in lines {
                callback(line, source);
            }
        }
    }

    /// Drain both buffers, complete lines and trailing partials alike
    async fn flush_remaining(&self) {
        for source in [StreamSource::Stdout, StreamSource::Stderr] {
            let lines = self.buffer_for(source).lock().await.flush_all();
            self.emit_lines(&lines, source).await;
        }
    }
}

/// Attaches line buffers to a child process and streams its output as lines.
///
/// Cheap to clone; clones share the same capture state.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<CaptureInner>,
}

impl CaptureController {
    pub fn new(config: CaptureConfig) -> Self {
        let buffer_config = config.buffer.clone();
        Self {
            inner: Arc::new(CaptureInner {
                config,
                is_capturing: AtomicBool::new(false),
                started_at_ms: AtomicU64::new(0),
                pid: AtomicU32::new(0),
                reconnect_attempts: AtomicU32::new(0),
                lines_emitted: AtomicU64::new(0),
                stdout_buffer: Mutex::new(LineBuffer::new(buffer_config.clone())),
                stderr_buffer: Mutex::new(LineBuffer::new(buffer_config)),
                tasks: Mutex::new(Vec::new()),
                line_callback: RwLock::new(None),
                error_callback: RwLock::new(None),
                status_callback: RwLock::new(None),
                reconnect_hook: RwLock::new(None),
            }),
        }
    }

    /// Attach to a spawned child and start streaming its output.
    ///
    /// The child must have been spawned with piped stdout/stderr. Returns
    /// `false` (leaving the running capture untouched) if a capture is
    /// already active.
    pub async fn start_capture(&self, mut child: Child) -> bool {
        if self.inner.is_capturing.swap(true, Ordering::SeqCst) {
            tracing::warn!("Capture already running; ignoring start request");
            return false;
        }

        self.inner
            .started_at_ms
            .store(now_millis(), Ordering::SeqCst);
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.inner
            .pid
            .store(child.id().unwrap_or(0), Ordering::SeqCst);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if stdout.is_none() && stderr.is_none() {
            tracing::warn!("Captured process has no piped stdout or stderr");
        }

        {
            let mut tasks = self.inner.tasks.lock().await;
            if let Some(out) = stdout {
                tasks.push(spawn_stream_reader(
                    Arc::clone(&self.inner),
                    out,
                    StreamSource::Stdout,
                ));
            }
            if let Some(err) = stderr {
                tasks.push(spawn_stream_reader(
                    Arc::clone(&self.inner),
                    err,
                    StreamSource::Stderr,
                ));
            }
            tasks.push(spawn_flush_task(Arc::clone(&self.inner)));
            tasks.push(spawn_exit_monitor(Arc::clone(&self.inner), child));
        }

        tracing::info!(
            pid = self.inner.pid.load(Ordering::SeqCst),
            "Capture started"
        );
        let callback = self.inner.status_callback.read().await.clone();
        if let Some(callback) = callback {
            callback(true);
        }
        true
    }

    /// Stop capturing. Safe to call repeatedly; only the first call after a
    /// start does anything.
    pub async fn stop_capture(&self) {
        stop(&self.inner).await;
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.is_capturing.load(Ordering::SeqCst)
    }

    pub async fn set_line_callback(
        &self,
        f: impl Fn(&str, StreamSource) + Send + Sync + 'static,
    ) {
        *self.inner.line_callback.write().await = Some(Arc::new(f));
    }

    pub async fn set_error_callback(
        &self,
        f: impl Fn(&crate::Error) + Send + Sync + 'static,
    ) {
        *self.inner.error_callback.write().await = Some(Arc::new(f));
    }

    pub async fn set_status_callback(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        *self.inner.status_callback.write().await = Some(Arc::new(f));
    }

    /// Wire the external respawn extension point. The hook receives the
    /// attempt number; re-attaching a replacement process is its business.
    pub async fn set_reconnect_hook(&self, f: impl Fn(u32) + Send + Sync + 'static) {
        *self.inner.reconnect_hook.write().await = Some(Arc::new(f));
    }

    /// Merged read-only snapshot of capture state and buffer counters
    pub async fn stats(&self) -> CaptureStats {
        let pid = self.inner.pid.load(Ordering::SeqCst);
        CaptureStats {
            is_capturing: self.inner.is_capturing.load(Ordering::SeqCst),
            started_at_ms: self.inner.started_at_ms.load(Ordering::SeqCst),
            pid: (pid != 0).then_some(pid),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::SeqCst),
            lines_emitted: self.inner.lines_emitted.load(Ordering::SeqCst),
            stdout: self.inner.stdout_buffer.lock().await.stats(),
            stderr: self.inner.stderr_buffer.lock().await.stats(),
        }
    }

    pub async fn buffer_health(&self) -> CaptureHealth {
        let stdout = self.inner.stdout_buffer.lock().await.health();
        let stderr = self.inner.stderr_buffer.lock().await.health();
        CaptureHealth {
            healthy: stdout.healthy && stderr.healthy,
            stdout,
            stderr,
        }
    }
}

/// Read raw chunks from one child stream into its line buffer. On EOF the
/// stream can produce no more data, so its trailing partial is flushed right
/// away rather than waiting for the flush timer.
fn spawn_stream_reader<R>(
    inner: Arc<CaptureInner>,
    mut reader: R,
    source: StreamSource,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = BytesMut::with_capacity(8192);
        loop {
            chunk.clear();
            match reader.read_buf(&mut chunk).await {
                Ok(0) => {
                    let lines = inner.buffer_for(source).lock().await.flush_all();
                    inner.emit_lines(&lines, source).await;
                    tracing::debug!(stream = %source, "Stream closed");
                    break;
                }
                Ok(_) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    let lines = inner.buffer_for(source).lock().await.add_data(&text);
                    inner.emit_lines(&lines, source).await;
                }
                Err(err) => {
                    handle_stream_error(&inner, source, err).await;
                    break;
                }
            }
        }
    })
}

/// Periodically flush partial lines that have sat past the flush timeout
fn spawn_flush_task(inner: Arc<CaptureInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let timeout = Duration::from_millis(inner.config.buffer.flush_timeout_ms.max(1));
        let mut tick = tokio::time::interval(timeout);
        loop {
            tick.tick().await;
            for source in [StreamSource::Stdout, StreamSource::Stderr] {
                let flushed = {
                    let mut buffer = inner.buffer_for(source).lock().await;
                    if buffer.is_stale(timeout) {
                        buffer.flush_incomplete_line()
                    } else {
                        None
                    }
                };
                if let Some(line) = flushed {
                    tracing::debug!(stream = %source, "Flushing stale partial line");
                    inner.emit_lines(std::slice::from_ref(&line), source).await;
                }
            }
        }
    })
}

/// Own the child handle and wait for it to exit
fn spawn_exit_monitor(inner: Arc<CaptureInner>, mut child: Child) -> JoinHandle<()> {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                tracing::info!(code = status.code(), "Captured process exited");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to await captured process");
            }
        }
        inner.flush_remaining().await;
        handle_process_down(&inner).await;
    })
}

/// Exit bookkeeping: schedule the reconnect hook while attempts remain,
/// otherwise wind the capture down.
async fn handle_process_down(inner: &Arc<CaptureInner>) {
    if !inner.is_capturing.load(Ordering::SeqCst) {
        return;
    }
    let attempts = inner.reconnect_attempts.load(Ordering::SeqCst);
    if inner.config.auto_reconnect && attempts < inner.config.max_reconnect_attempts {
        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            attempt,
            delay_ms = inner.config.reconnect_interval_ms,
            "Scheduling capture reconnect"
        );
        let timer_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timer_inner.config.reconnect_interval_ms))
                .await;
            if !timer_inner.is_capturing.load(Ordering::SeqCst) {
                return;
            }
            let hook = timer_inner.reconnect_hook.read().await.clone();
            match hook {
                Some(hook) => hook(attempt),
                None => {
                    tracing::warn!(attempt, "No reconnect hook wired; capture stays idle")
                }
            }
        });
        inner.tasks.lock().await.push(handle);
    } else {
        tracing::info!(attempts, "Captured process exited; not reconnecting");
        stop(inner).await;
    }
}

async fn handle_stream_error(
    inner: &Arc<CaptureInner>,
    source: StreamSource,
    err: std::io::Error,
) {
    tracing::warn!(stream = %source, error = %err, "Stream read error");
    let callback = inner.error_callback.read().await.clone();
    if let Some(callback) = callback {
        callback(&crate::Error::Capture(format!(
            "{} read error: {}",
            source, err
        )));
    }
    if !inner.config.enable_error_recovery {
        stop(inner).await;
    }
}

/// Flush, notify, then cancel the capture tasks. The task abort comes last so
/// a task stopping the capture from the inside still completes the flush and
/// callbacks before its own cancellation lands.
async fn stop(inner: &Arc<CaptureInner>) {
    if !inner.is_capturing.swap(false, Ordering::SeqCst) {
        return;
    }
    tracing::info!("Stopping capture");

    inner.flush_remaining().await;
    inner.pid.store(0, Ordering::SeqCst);

    let callback = inner.status_callback.read().await.clone();
    if let Some(callback) = callback {
        callback(false);
    }

    let handles: Vec<JoinHandle<()>> = inner.tasks.lock().await.drain(..).collect();
    for handle in handles {
        handle.abort();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LineBufferConfig;
    use std::process::Stdio;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::process::Command;

    type LineLog = Arc<StdMutex<Vec<(String, StreamSource)>>>;

    fn fast_config(max_reconnect_attempts: u32) -> CaptureConfig {
        CaptureConfig {
            buffer: LineBufferConfig {
                max_buffer_size: 64 * 1024,
                max_line_length: 4 * 1024,
                flush_timeout_ms: 30,
            },
            auto_reconnect: true,
            reconnect_interval_ms: 20,
            max_reconnect_attempts,
            enable_error_recovery: true,
        }
    }

    fn spawn_sh(script: &str) -> Child {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn test child")
    }

    async fn recording(controller: &CaptureController) -> LineLog {
        let log: LineLog = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        controller
            .set_line_callback(move |line, source| {
                sink.lock().unwrap().push((line.to_string(), source));
            })
            .await;
        log
    }

    async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met within {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_lines() {
        let controller = CaptureController::new(fast_config(0));
        let log = recording(&controller).await;

        assert!(controller.start_capture(spawn_sh("printf 'alpha\\nbeta\\n'")).await);
        wait_for(
            || log.lock().unwrap().len() >= 2,
            Duration::from_secs(3),
        )
        .await;

        let lines = log.lock().unwrap().clone();
        assert_eq!(lines[0], ("alpha".to_string(), StreamSource::Stdout));
        assert_eq!(lines[1], ("beta".to_string(), StreamSource::Stdout));
        controller.stop_capture().await;
    }

    #[tokio::test]
    async fn test_stderr_lines_tagged() {
        let controller = CaptureController::new(fast_config(0));
        let log = recording(&controller).await;

        controller
            .start_capture(spawn_sh("printf 'oops\\n' >&2"))
            .await;
        wait_for(
            || {
                log.lock()
                    .unwrap()
                    .contains(&("oops".to_string(), StreamSource::Stderr))
            },
            Duration::from_secs(3),
        )
        .await;
        controller.stop_capture().await;
    }

    #[tokio::test]
    async fn test_exit_schedules_one_reconnect_then_stops() {
        let controller = CaptureController::new(fast_config(1));
        let log = recording(&controller).await;

        let hooks = Arc::new(AtomicUsize::new(0));
        let hook_count = hooks.clone();
        controller
            .set_reconnect_hook(move |_| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let statuses: Arc<StdMutex<Vec<bool>>> = Arc::new(StdMutex::new(Vec::new()));
        let status_log = statuses.clone();
        controller
            .set_status_callback(move |active| {
                status_log.lock().unwrap().push(active);
            })
            .await;

        controller
            .start_capture(spawn_sh("printf 'hello world\\n'"))
            .await;

        // First exit: output delivered, exactly one reconnect scheduled,
        // capture still considered active while a retry is pending.
        wait_for(
            || hooks.load(Ordering::SeqCst) == 1,
            Duration::from_secs(3),
        )
        .await;
        wait_for(
            || {
                log.lock()
                    .unwrap()
                    .contains(&("hello world".to_string(), StreamSource::Stdout))
            },
            Duration::from_secs(3),
        )
        .await;
        assert!(controller.is_capturing());

        // The attempt budget is spent, so another exit winds capture down.
        handle_process_down(&controller.inner).await;
        assert!(!controller.is_capturing());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(statuses.lock().unwrap().as_slice(), &[true, false]);
    }

    #[tokio::test]
    async fn test_exit_without_auto_reconnect_stops() {
        let mut config = fast_config(5);
        config.auto_reconnect = false;
        let controller = CaptureController::new(config);

        let hooks = Arc::new(AtomicUsize::new(0));
        let hook_count = hooks.clone();
        controller
            .set_reconnect_hook(move |_| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        controller.start_capture(spawn_sh("true")).await;
        wait_for(|| !controller.is_capturing(), Duration::from_secs(3)).await;
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_rejected_while_capturing() {
        let controller = CaptureController::new(fast_config(0));
        assert!(controller.start_capture(spawn_sh("sleep 5")).await);
        assert!(!controller.start_capture(spawn_sh("sleep 5")).await);
        assert!(controller.is_capturing());
        controller.stop_capture().await;
    }

    #[tokio::test]
    async fn test_stop_capture_idempotent() {
        let controller = CaptureController::new(fast_config(0));
        let statuses: Arc<StdMutex<Vec<bool>>> = Arc::new(StdMutex::new(Vec::new()));
        let status_log = statuses.clone();
        controller
            .set_status_callback(move |active| {
                status_log.lock().unwrap().push(active);
            })
            .await;

        controller.start_capture(spawn_sh("sleep 5")).await;
        controller.stop_capture().await;
        controller.stop_capture().await;

        assert!(!controller.is_capturing());
        assert_eq!(statuses.lock().unwrap().as_slice(), &[true, false]);
    }

    #[tokio::test]
    async fn test_unterminated_tail_flushed_on_eof() {
        let controller = CaptureController::new(fast_config(0));
        let log = recording(&controller).await;

        controller
            .start_capture(spawn_sh("printf 'no newline'"))
            .await;
        wait_for(
            || {
                log.lock()
                    .unwrap()
                    .contains(&("no newline".to_string(), StreamSource::Stdout))
            },
            Duration::from_secs(3),
        )
        .await;
    }

    #[tokio::test]
    async fn test_stale_partial_line_flushed_while_running() {
        let controller = CaptureController::new(fast_config(0));
        let log = recording(&controller).await;

        controller
            .start_capture(spawn_sh("printf 'partial'; sleep 5"))
            .await;
        // Flush timeout is 30ms; the partial should surface well before the
        // child exits.
        wait_for(
            || {
                log.lock()
                    .unwrap()
                    .contains(&("partial".to_string(), StreamSource::Stdout))
            },
            Duration::from_secs(3),
        )
        .await;
        assert!(controller.is_capturing());
        controller.stop_capture().await;
    }

    #[tokio::test]
    async fn test_stream_error_stops_when_recovery_disabled() {
        let mut config = fast_config(0);
        config.enable_error_recovery = false;
        let controller = CaptureController::new(config);

        let errors = Arc::new(AtomicUsize::new(0));
        let error_count = errors.clone();
        controller
            .set_error_callback(move |_| {
                error_count.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        controller.start_capture(spawn_sh("sleep 5")).await;
        handle_stream_error(
            &controller.inner,
            StreamSource::Stdout,
            std::io::Error::other("boom"),
        )
        .await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!controller.is_capturing());
    }

    #[tokio::test]
    async fn test_stream_error_informational_with_recovery() {
        let controller = CaptureController::new(fast_config(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let error_count = errors.clone();
        controller
            .set_error_callback(move |_| {
                error_count.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        controller.start_capture(spawn_sh("sleep 5")).await;
        handle_stream_error(
            &controller.inner,
            StreamSource::Stderr,
            std::io::Error::other("transient"),
        )
        .await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(controller.is_capturing());
        controller.stop_capture().await;
    }

    #[tokio::test]
    async fn test_stats_merge_both_streams() {
        let controller = CaptureController::new(fast_config(0));
        let log = recording(&controller).await;

        controller
            .start_capture(spawn_sh("printf 'out\\n'; printf 'err\\n' >&2"))
            .await;
        wait_for(
            || log.lock().unwrap().len() >= 2,
            Duration::from_secs(3),
        )
        .await;

        let stats = controller.stats().await;
        assert!(stats.started_at_ms > 0);
        assert_eq!(stats.stdout.total_lines_processed, 1);
        assert_eq!(stats.stderr.total_lines_processed, 1);
        assert_eq!(stats.lines_emitted, 2);

        let health = controller.buffer_health().await;
        assert!(health.healthy);
        controller.stop_capture().await;
    }
}
