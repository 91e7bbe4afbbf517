//! WebSocket fan-out server (C4, SPEC_FULL.md §4.2).
//!
//! Accepts connections via axum's WebSocket upgrade (`api::ws::handler`'s
//! `ws_handler`/`BroadcastState` pairing is the shape this generalizes:
//! an upgrade handler plus a shared broadcast channel, here replaced by
//! direct subscription to the [`crate::message::MessageBus`] so the
//! server needs no second fan-out mechanism of its own). Authenticates on
//! first frame, fans out bus messages to authenticated clients only,
//! enforces a per-client fixed-window rate limit (`rate_limit`), batches
//! under load (`batching`), queues for disconnected clients
//! (`registry::ConnectionRegistry`'s resume-token-keyed offline queue),
//! and disconnects clients that miss heartbeats (`heartbeat`).

pub mod batching;
pub mod heartbeat;
pub mod rate_limit;
pub mod registry;

use crate::error::{AppError, ErrorCategory, Result};
use crate::message::{Message, MessageBus, MessageContent, MessageKind, MessageQueue};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use batching::BatchingManager;
use futures_util::{SinkExt, StreamExt};
use heartbeat::{HeartbeatConfig, HeartbeatManager};
use rate_limit::RateLimiter;
use registry::{ConnectionDescriptor, ConnectionRegistry};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use uuid::Uuid;

/// Message kinds the server fans out to clients. Client-originated kinds
/// (`authenticate`, `command`, `progress_response`, `workflow_control`)
/// are read off the socket directly rather than subscribed to, since they
/// flow client-to-server, not server-to-client.
const SERVER_TO_CLIENT_KINDS: &[MessageKind] = &[
    MessageKind::TerminalOutput,
    MessageKind::ApprovalRequest,
    MessageKind::DiffDisplay,
    MessageKind::InteractiveDiff,
    MessageKind::InteractiveApproval,
    MessageKind::ProgressIndicator,
    MessageKind::WorkflowStatus,
    MessageKind::CommandResult,
    MessageKind::StreamStart,
    MessageKind::StreamContent,
    MessageKind::StreamEnd,
    MessageKind::StreamInteractive,
    MessageKind::LogOutput,
    MessageKind::ErrorNotification,
    MessageKind::ConnectionEstablished,
    MessageKind::Batch,
    MessageKind::Heartbeat,
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub auth_token: String,
    pub messages_per_second: u32,
    pub heartbeat_interval: Duration,
    pub max_queue_size: usize,
    pub max_frame_bytes: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub descriptor_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            auth_token: String::new(),
            messages_per_second: 5,
            heartbeat_interval: Duration::from_secs(15),
            max_queue_size: 50,
            max_frame_bytes: 1_048_576,
            batch_size: 20,
            batch_interval: Duration::from_millis(250),
            descriptor_path: PathBuf::from("server.json"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ServerMetrics {
    pub delivered: u64,
    pub dropped_rate_limited: u64,
    pub queued_offline: u64,
    pub auth_failures: u64,
}

/// Accepted-but-not-yet-decided outcome of the first frame a client sends.
/// Pulled out of the socket-handling loop so it is testable without a
/// real socket.
fn check_authenticate(content: &MessageContent, expected_token: &str) -> Option<Option<String>> {
    match content {
        MessageContent::Authenticate { token, resume_token } if token == expected_token => {
            Some(resume_token.clone())
        }
        _ => None,
    }
}

pub struct StreamingServer {
    bus: Arc<MessageBus>,
    registry: ConnectionRegistry,
    rate_limiter: RateLimiter,
    heartbeat: HeartbeatManager,
    batching: BatchingManager,
    disconnect_signals: dashmap::DashMap<String, Arc<Notify>>,
    handler_ids: parking_lot::Mutex<Vec<(MessageKind, u64)>>,
    delivered: AtomicU64,
    dropped_rate_limited: AtomicU64,
    queued_offline: AtomicU64,
    auth_failures: AtomicU64,
    config: ServerConfig,
}

impl StreamingServer {
    pub fn new(bus: Arc<MessageBus>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: ConnectionRegistry::new(config.max_queue_size),
            rate_limiter: RateLimiter::new(config.messages_per_second),
            heartbeat: HeartbeatManager::new(HeartbeatConfig {
                interval: config.heartbeat_interval,
            }),
            batching: BatchingManager::new(config.batch_size, config.batch_interval),
            disconnect_signals: dashmap::DashMap::new(),
            handler_ids: parking_lot::Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
            dropped_rate_limited: AtomicU64::new(0),
            queued_offline: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            bus,
            config,
        })
    }

    pub fn metrics(&self) -> ServerMetrics {
        ServerMetrics {
            delivered: self.delivered.load(Ordering::SeqCst),
            dropped_rate_limited: self.dropped_rate_limited.load(Ordering::SeqCst),
            queued_offline: self.queued_offline.load(Ordering::SeqCst),
            auth_failures: self.auth_failures.load(Ordering::SeqCst),
        }
    }

    /// Persist the connection descriptor and subscribe the bus's
    /// server-to-client kinds to this server's fan-out path. Call once,
    /// before accepting connections.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let descriptor = ConnectionDescriptor::new(
            self.config.host.clone(),
            self.config.port,
            self.config.auth_token.clone(),
        );
        descriptor
            .write(&self.config.descriptor_path)
            .map_err(|e| AppError::new(ErrorCategory::Permission, "server", e.to_string()))?;

        let mut ids = self.handler_ids.lock();
        for kind in SERVER_TO_CLIENT_KINDS {
            let this = self.clone();
            let id = self.bus.register_handler(*kind, move |msg| {
                this.broadcast(msg.clone());
            });
            ids.push((*kind, id));
        }
        info!(host = %self.config.host, port = self.config.port, "streaming server started");
        Ok(())
    }

    /// Unregister bus handlers and delete the connection descriptor. Does
    /// not forcibly close live sockets; callers drop their
    /// `JoinHandle`s/listener separately.
    pub fn stop(&self) -> Result<()> {
        let mut ids = self.handler_ids.lock();
        for (kind, id) in ids.drain(..) {
            self.bus.unregister_handler(kind, id);
        }
        info!("streaming server stopped");
        ConnectionDescriptor::delete(&self.config.descriptor_path)
            .map_err(|e| AppError::new(ErrorCategory::Permission, "server", e.to_string()))
    }

    fn broadcast(&self, message: Message) {
        for client_id in self.registry.authenticated_client_ids() {
            self.send_message(&client_id, message.clone());
        }
    }

    /// Attempt direct delivery to `client_id`, subject to its rate limit.
    /// Over-budget sends are dropped (not queued), per SPEC_FULL.md §4.2.
    fn send_message(&self, client_id: &str, message: Message) -> bool {
        if !self.rate_limiter.try_consume(client_id) {
            self.dropped_rate_limited.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        let delivered = self.registry.deliver(client_id, message);
        if delivered {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        } else {
            self.queued_offline.fetch_add(1, Ordering::SeqCst);
        }
        delivered
    }

    /// Background activity: disconnect clients that have missed two
    /// heartbeat intervals. Intended to be spawned as a periodic task
    /// alongside `start()`.
    fn evict_missing_heartbeats(&self) {
        for client_id in self.heartbeat.missing_clients() {
            self.force_disconnect(&client_id);
        }
    }

    /// Coalesce a message into `client_id`'s batch instead of sending it
    /// directly; flushes (and sends, subject to the rate limiter like any
    /// other send) once the batcher reaches its size trigger.
    pub fn send_batched(&self, client_id: &str, message: Message) -> bool {
        match self.batching.add(client_id, message) {
            Some(batch) => self.send_message(client_id, batch),
            None => false,
        }
    }

    /// Flush any client batcher whose time trigger has fired. Invoked
    /// from the background task alongside heartbeat eviction.
    fn flush_due_batches(&self) {
        for client_id in self.batching.clients_needing_flush() {
            if let Some(batch) = self.batching.flush(&client_id) {
                self.send_message(&client_id, batch);
            }
        }
    }

    fn force_disconnect(&self, client_id: &str) {
        self.registry.mark_disconnected(client_id);
        self.registry.remove(client_id);
        self.heartbeat.remove(client_id);
        self.rate_limiter.remove(client_id);
        self.batching.remove(client_id);
        if let Some((_, signal)) = self.disconnect_signals.remove(client_id) {
            signal.notify_waiters();
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.clone())
    }

    /// Spawn the background heartbeat-eviction loop. Returns its join
    /// handle so callers can cancel it on shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let tick = (self.config.heartbeat_interval / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                this.evict_missing_heartbeats();
                this.flush_due_batches();
            }
        })
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();

        let first = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => Message::from_wire(&text).ok(),
            _ => None,
        };

        let auth = first.as_ref().and_then(|m| {
            if m.content.len_bytes_hint() > self.config.max_frame_bytes {
                None
            } else {
                check_authenticate(&m.content, &self.config.auth_token)
            }
        });

        let Some(resume_token_override) = auth else {
            self.auth_failures.fetch_add(1, Ordering::SeqCst);
            warn!("websocket connection rejected: authentication failed");
            let _ = sink
                .send(WsMessage::Close(Some(CloseFrame {
                    code: 1008,
                    reason: "Authentication failed".into(),
                })))
                .await;
            return;
        };

        let client_id = Uuid::new_v4().to_string();
        let resume_token = resume_token_override.unwrap_or_else(|| client_id.clone());
        let resumed = self.registry.offline_queue_for(&resume_token).is_some();
        info!(client_id = %client_id, resumed, "websocket client connected");

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let offline_queue = self.registry.register(&client_id, &resume_token, tx);
        self.heartbeat.register(&client_id);
        let close_signal = Arc::new(Notify::new());
        self.disconnect_signals
            .insert(client_id.clone(), close_signal.clone());

        let Ok(established) = Message::construct(MessageContent::ConnectionEstablished {
            client_id: client_id.clone(),
            resumed,
        }) else {
            return;
        };
        if send_frame(&mut sink, &established).await.is_err() {
            self.force_disconnect(&client_id);
            return;
        }

        replay_offline_queue(&offline_queue, &mut sink).await;

        let mut heartbeat_ticker = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_ticker.tick().await;

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if text.len() > self.config.max_frame_bytes {
                                let notice = Message::construct(MessageContent::ErrorNotification {
                                    message: "frame exceeds maximum size".to_string(),
                                });
                                if let Ok(notice) = notice {
                                    let _ = send_frame(&mut sink, &notice).await;
                                }
                                continue;
                            }
                            self.heartbeat.record_activity(&client_id);
                            if let Ok(msg) = Message::from_wire(&text) {
                                if !matches!(msg.content, MessageContent::Authenticate { .. }) {
                                    self.bus.publish(&msg);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => self.heartbeat.record_activity(&client_id),
                        Some(Err(_)) => break,
                    }
                }
                Some(outgoing) = rx.recv() => {
                    if send_frame(&mut sink, &outgoing).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat_ticker.tick() => {
                    let ping = Message::construct(MessageContent::Heartbeat {
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    });
                    if let Ok(ping) = ping {
                        if send_frame(&mut sink, &ping).await.is_err() {
                            break;
                        }
                    }
                }
                _ = close_signal.notified() => break,
            }
        }

        info!(client_id = %client_id, "websocket client disconnected");
        self.registry.mark_disconnected(&client_id);
        self.registry.remove(&client_id);
        self.heartbeat.remove(&client_id);
        self.rate_limiter.remove(&client_id);
        self.disconnect_signals.remove(&client_id);
    }
}

trait ContentSizeHint {
    fn len_bytes_hint(&self) -> usize;
}

impl ContentSizeHint for MessageContent {
    fn len_bytes_hint(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    message: &Message,
) -> std::result::Result<(), axum::Error> {
    let wire = message
        .to_wire()
        .unwrap_or_else(|_| "{}".to_string());
    sink.send(WsMessage::Text(wire)).await
}

async fn replay_offline_queue(
    queue: &Arc<MessageQueue>,
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
) {
    for message in queue.clear() {
        let _ = send_frame(sink, &message).await;
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<StreamingServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { server.handle_socket(socket).await })
}
