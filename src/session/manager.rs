//! Persistent backend session manager
//!
//! Owns exactly one logical WebSocket connection to the backend's realtime
//! endpoint and multiplexes any number of named subscribers over it. The
//! connection heartbeats while open and reconnects with exponential backoff
//! on every close, clean or not; there is no terminal failure state.
//!
//! The manager is constructed once by the composition root and injected into
//! consumers. Its connection has no teardown path in normal operation: it is
//! a process-lifetime resource. [`SessionManager::shutdown`] exists so tests
//! can exercise the state machine in isolation.

use crate::config::SessionConfig;
use crate::session::backoff::reconnect_delay;
use crate::session::protocol::{Envelope, MessageType};
use crate::session::subscriber::{
    ConnectionStatus, DataHandler, SubscribeConfig, Subscriber,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Read-only snapshot of the session state
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Current connection status
    pub status: ConnectionStatus,
    /// Diagnostic correlation id, generated once per manager lifetime
    pub connection_id: String,
    /// Number of registered subscribers
    pub subscriber_count: usize,
    /// Reconnect attempts since the last successful open
    pub reconnect_attempts: u32,
    /// Timestamp of the outstanding heartbeat ping, if any
    pub pending_ping_ms: Option<u64>,
}

/// Shared session state
struct SessionInner {
    config: SessionConfig,
    /// Diagnostic id; carried in heartbeat pings, no protocol semantics
    connection_id: String,
    status: RwLock<ConnectionStatus>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    /// Writer handle for the current socket; replaced wholesale on reconnect
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    reconnect_attempts: AtomicU32,
    /// Millisecond timestamp of the pending ping; 0 = pong received / none sent
    last_ping: AtomicU64,
    /// Connection generation; a task whose generation is stale winds down
    generation: AtomicU64,
    /// Invoked for a dispatched `Error` no subscriber handled
    error_fallback: RwLock<Option<DataHandler>>,
    /// Invoked for a dispatched `Notify` no subscriber handled
    notify_fallback: RwLock<Option<DataHandler>>,
}

impl SessionInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Persistent WebSocket session to the local backend
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Create a new session manager. No connection is made until
    /// [`connect`](Self::connect) is called.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                connection_id: Uuid::new_v4().to_string(),
                status: RwLock::new(ConnectionStatus::Disconnected),
                subscribers: RwLock::new(HashMap::new()),
                outbound: RwLock::new(None),
                reconnect_attempts: AtomicU32::new(0),
                last_ping: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                error_fallback: RwLock::new(None),
                notify_fallback: RwLock::new(None),
            }),
        }
    }

    /// Ensure a connection exists.
    ///
    /// Idempotent: while the transport is open or connecting, repeated calls
    /// never create a second socket. Returns true when a connection is open
    /// or in progress after the call.
    pub async fn connect(&self) -> bool {
        {
            let status = self.inner.status.read().await;
            if matches!(
                *status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            ) {
                return true;
            }
        }
        start_connection(self.inner.clone()).await;
        true
    }

    /// Ensure a connection exists and register a subscriber keyed by
    /// `config.task_id`, replacing any prior subscriber with the same key.
    ///
    /// The new subscriber's `on_status_change` is immediately invoked with
    /// the current status. Returns the subscription key.
    pub async fn connect_with(&self, config: SubscribeConfig) -> String {
        self.connect().await;

        let SubscribeConfig { task_id, handlers } = config;
        let status_handler = handlers.on_status_change.clone();
        self.inner
            .subscribers
            .write()
            .await
            .insert(task_id.clone(), handlers);

        if let Some(handler) = status_handler {
            let status = *self.inner.status.read().await;
            handler(status);
        }

        task_id
    }

    /// Register a subscriber, replacing any prior one with the same id
    pub async fn subscribe(&self, id: impl Into<String>, subscriber: Subscriber) {
        self.inner
            .subscribers
            .write()
            .await
            .insert(id.into(), subscriber);
    }

    /// Remove a subscriber. Dispatch to that id stops immediately.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.inner.subscribers.write().await.remove(id).is_some()
    }

    /// Serialize `{id, type, data}` and transmit it over the open transport.
    ///
    /// Outbound messages are never queued: while the transport is not open
    /// the frame is dropped and `false` is returned.
    pub async fn send_raw(
        &self,
        kind: MessageType,
        data: Option<Value>,
        id: Option<String>,
    ) -> bool {
        if *self.inner.status.read().await != ConnectionStatus::Connected {
            tracing::debug!(kind = %kind, "Dropping outbound message: session not connected");
            return false;
        }

        let envelope = Envelope::new(kind, data, id);
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize outbound message: {}", e);
                return false;
            }
        };

        let outbound = self.inner.outbound.read().await;
        match outbound.as_ref() {
            Some(tx) => tx.send(Message::Text(text)).is_ok(),
            None => {
                tracing::debug!(kind = %envelope.kind, "Dropping outbound message: no transport");
                false
            }
        }
    }

    /// Start a new connection without explicitly closing the current one.
    ///
    /// The superseded connection task observes its stale generation and winds
    /// itself down, so at most one socket dispatches at any time.
    pub async fn force_reconnect(&self) {
        tracing::info!(
            connection_id = %self.inner.connection_id,
            "Forcing backend session reconnect"
        );
        start_connection(self.inner.clone()).await;
    }

    /// Read-only state snapshot; no side effects
    pub async fn connection_info(&self) -> ConnectionInfo {
        let pending = self.inner.last_ping.load(Ordering::SeqCst);
        ConnectionInfo {
            status: *self.inner.status.read().await,
            connection_id: self.inner.connection_id.clone(),
            subscriber_count: self.inner.subscribers.read().await.len(),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::SeqCst),
            pending_ping_ms: if pending == 0 { None } else { Some(pending) },
        }
    }

    /// Fallback handler for `Error` messages no subscriber handled
    pub async fn set_error_fallback(&self, f: impl Fn(Value) + Send + Sync + 'static) {
        *self.inner.error_fallback.write().await = Some(Arc::new(f));
    }

    /// Fallback handler for `Notify` messages no subscriber handled
    pub async fn set_notify_fallback(&self, f: impl Fn(Value) + Send + Sync + 'static) {
        *self.inner.notify_fallback.write().await = Some(Arc::new(f));
    }

    /// Tear the session down.
    ///
    /// Production code never calls this: the session is a process-lifetime
    /// resource. It exists so tests can exercise the state machine without
    /// leaking connection tasks across test cases.
    pub async fn shutdown(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.inner.outbound.write().await = None;
        set_status(&self.inner, ConnectionStatus::Disconnected).await;
    }

    /// Dispatch an inbound envelope to the subscriber registry.
    ///
    /// Exposed to the crate so the dispatch rules are testable without a
    /// live transport.
    pub(crate) async fn dispatch_envelope(&self, envelope: Envelope) {
        dispatch(&self.inner, envelope).await;
    }
}

// =============================================================================
// Connection task
// =============================================================================

/// Bump the generation, mark the session connecting, and spawn the task that
/// owns the new socket.
async fn start_connection(inner: Arc<SessionInner>) {
    set_status(&inner, ConnectionStatus::Connecting).await;
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::spawn(run_connection(inner, generation));
}

/// One connection lifetime: handshake, I/O loop, then reconnect scheduling.
///
/// Returns a boxed future to break the opaque-type cycle with
/// [`start_connection`], which otherwise prevents the future from being
/// `Send`.
fn run_connection(
    inner: Arc<SessionInner>,
    generation: u64,
) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        let url = inner.config.endpoint_url();

        let was_open = match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => {
                if !inner.is_current(generation) {
                    // Superseded while handshaking; drop the socket untouched
                    return;
                }
                inner.reconnect_attempts.store(0, Ordering::SeqCst);
                inner.last_ping.store(0, Ordering::SeqCst);

                let (tx, rx) = mpsc::unbounded_channel();
                *inner.outbound.write().await = Some(tx);
                set_status(&inner, ConnectionStatus::Connected).await;
                tracing::info!(
                    connection_id = %inner.connection_id,
                    url = %url,
                    "Backend session connected"
                );

                run_io_loop(&inner, generation, stream, rx).await;
                true
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %inner.connection_id,
                    url = %url,
                    "Backend session connect failed: {}",
                    e
                );
                if !inner.is_current(generation) {
                    return;
                }
                set_status(&inner, ConnectionStatus::Error).await;
                false
            }
        };

        if !inner.is_current(generation) {
            return;
        }

        if was_open {
            *inner.outbound.write().await = None;
            inner.last_ping.store(0, Ordering::SeqCst);
            set_status(&inner, ConnectionStatus::Disconnected).await;
        }

        // Every close schedules a retry, clean or not; the session never gives up.
        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = reconnect_delay(
            attempt,
            Duration::from_millis(inner.config.reconnect_base_delay_ms),
            Duration::from_millis(inner.config.reconnect_max_delay_ms),
        );
        tracing::info!(
            connection_id = %inner.connection_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling backend session reconnect"
        );
        tokio::time::sleep(delay).await;

        if !inner.is_current(generation) {
            return;
        }
        start_connection(inner).await;
    })
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Socket I/O loop: heartbeats, outbound writes, inbound dispatch.
///
/// Returns when the socket closes, errors, or this task's generation is
/// superseded by a forced reconnect.
async fn run_io_loop(
    inner: &Arc<SessionInner>,
    generation: u64,
    stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    let (mut sink, mut reader) = stream.split();

    let interval = Duration::from_millis(inner.config.heartbeat_interval_ms);
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        if !inner.is_current(generation) {
            // Superseded: stop dispatching and let the socket drop
            return;
        }

        tokio::select! {
            _ = heartbeat.tick() => {
                let now = now_millis();
                let pending = inner.last_ping.load(Ordering::SeqCst);
                if pending != 0
                    && now.saturating_sub(pending) > inner.config.heartbeat_timeout_ms
                {
                    // Diagnostic only; a missed pong never closes the connection
                    tracing::warn!(
                        connection_id = %inner.connection_id,
                        waited_ms = now.saturating_sub(pending),
                        "Heartbeat pong overdue; keeping connection open"
                    );
                    inner.last_ping.store(0, Ordering::SeqCst);
                }

                let ping = Envelope::ping(now, &inner.connection_id);
                match ping.to_text() {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                        inner.last_ping.store(now, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize heartbeat ping: {}", e);
                    }
                }
            }

            out = outbound_rx.recv() => {
                match out {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    // Writer handle replaced or dropped
                    None => break,
                }
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(inner, &text).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(
                            connection_id = %inner.connection_id,
                            frame = ?frame,
                            "Backend closed the session"
                        );
                        break;
                    }
                    // Binary and transport-level ping/pong frames are ignored
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(
                            connection_id = %inner.connection_id,
                            "Backend session transport error: {}",
                            e
                        );
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Parse and route one inbound text frame
async fn handle_text(inner: &Arc<SessionInner>, text: &str) {
    let envelope = match Envelope::from_text(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Protocol error: log and drop, connection state untouched
            tracing::warn!("Dropping malformed backend frame: {}", e);
            return;
        }
    };

    if envelope.kind == MessageType::Signal {
        if let Some(ts) = envelope.pong_timestamp() {
            tracing::trace!(pong = ts, "Heartbeat pong received");
            inner.last_ping.store(0, Ordering::SeqCst);
        }
        // Signal frames never reach subscriber callbacks
        return;
    }

    dispatch(inner, envelope).await;
}

/// Route an envelope to its addressee, or broadcast when unaddressed.
async fn dispatch(inner: &Arc<SessionInner>, envelope: Envelope) {
    let mut typed_handled = false;

    {
        let subscribers = inner.subscribers.read().await;
        match &envelope.id {
            Some(id) => {
                if let Some(subscriber) = subscribers.get(id) {
                    typed_handled = deliver(subscriber, &envelope);
                } else {
                    tracing::debug!(
                        id = %id,
                        kind = %envelope.kind,
                        "Message addressed to unknown subscriber"
                    );
                }
            }
            None => {
                for subscriber in subscribers.values() {
                    typed_handled |= deliver(subscriber, &envelope);
                }
            }
        }
    }

    if typed_handled {
        return;
    }

    // Unhandled Error/Notify fall back to the manager-level hooks so the
    // condition always surfaces somewhere.
    match envelope.kind {
        MessageType::Error => {
            let fallback = inner.error_fallback.read().await.clone();
            let data = envelope.data.unwrap_or(Value::Null);
            match fallback {
                Some(f) => f(data),
                None => tracing::warn!(data = %data, "Unhandled backend error"),
            }
        }
        MessageType::Notify => {
            let fallback = inner.notify_fallback.read().await.clone();
            let data = envelope.data.unwrap_or(Value::Null);
            match fallback {
                Some(f) => f(data),
                None => tracing::info!(data = %data, "Unhandled backend notification"),
            }
        }
        _ => {}
    }
}

/// Invoke the callback matching the envelope type, plus the catch-all.
///
/// Returns whether a typed handler ran.
fn deliver(subscriber: &Subscriber, envelope: &Envelope) -> bool {
    let typed = match &envelope.kind {
        MessageType::Progress => subscriber.on_progress.as_ref(),
        MessageType::Result => subscriber.on_result.as_ref(),
        MessageType::Error => subscriber.on_error.as_ref(),
        MessageType::Notify => subscriber.on_notify.as_ref(),
        // Signal is consumed before dispatch; unknown types only hit on_message
        MessageType::Signal | MessageType::Other(_) => None,
    };

    let handled = match typed {
        Some(handler) => {
            handler(envelope.data.clone().unwrap_or(Value::Null));
            true
        }
        None => false,
    };

    if let Some(handler) = &subscriber.on_message {
        handler(envelope);
    }

    handled
}

/// Update the status and notify every subscriber's `on_status_change`
async fn set_status(inner: &Arc<SessionInner>, status: ConnectionStatus) {
    {
        let mut current = inner.status.write().await;
        if *current == status {
            return;
        }
        *current = status;
    }

    let handlers: Vec<_> = inner
        .subscribers
        .read()
        .await
        .values()
        .filter_map(|s| s.on_status_change.clone())
        .collect();
    for handler in handlers {
        handler(status);
    }
}

/// Current time in milliseconds since UNIX epoch
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
