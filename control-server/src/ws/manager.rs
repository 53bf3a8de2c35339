// control-server/src/ws/manager.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::{ConnectionGreeting, MessagePayload, WebSocketMessage};

use crate::error::ServerError;
use crate::ws::connection::ConnectionSink;
use crate::ws::frame::Opcode;

/// Probe cadence for connection liveness
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Inactivity budget before a connection is considered gone
pub const CONNECTION_TIMEOUT_SECS: u64 = 60;
/// Unanswered re-probes tolerated after a missed pong
const MAX_PING_RETRIES: u32 = 3;
/// Messages retained for clients that connect later
const QUEUE_CAPACITY: usize = 100;
/// Most recent queued messages replayed to a joining client
const REPLAY_COUNT: usize = 10;
/// Delay between the shutdown notice and the close frames
const SHUTDOWN_GRACE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Inactive,
    Active,
    ShuttingDown,
}

/// One registered connection. The sink is the only handle to the peer.
struct WsConnection {
    id: String,
    sink: Arc<dyn ConnectionSink>,
    is_alive: bool,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
    ping_retries: u32,
}

/// Counter snapshot for logging and the status page.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub queued_messages: usize,
}

/// Registry and lifecycle owner for every control-channel connection.
///
/// Holds the heartbeat task, the replay queue for broadcasts that found
/// nobody listening, and the session counters. No lock is ever held
/// across an await; send phases run on snapshots.
pub struct WebSocketManager {
    lifecycle: Mutex<Lifecycle>,
    connections: DashMap<String, WsConnection>,
    queue: Mutex<VecDeque<WebSocketMessage>>,
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    heartbeat_interval: Duration,
    connection_timeout: Duration,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for WebSocketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketManager {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Inactive),
            connections: DashMap::new(),
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            total_connections: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            connection_timeout: Duration::from_secs(CONNECTION_TIMEOUT_SECS),
            heartbeat_handle: Mutex::new(None),
        }
    }

    /// Override the probe cadence (tests run with short timings).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Override the inactivity budget.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn is_active(&self) -> bool {
        *self.lifecycle.lock().unwrap() == Lifecycle::Active
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.lifecycle.lock().unwrap() == Lifecycle::ShuttingDown
    }

    /// Move to Active and start the heartbeat. Calling it while already
    /// Active is a no-op; calling it mid-shutdown is an error.
    pub fn initialize(self: &Arc<Self>) -> Result<(), ServerError> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            match *lifecycle {
                Lifecycle::Active => {
                    debug!("WebSocket manager already initialized");
                    return Ok(());
                }
                Lifecycle::ShuttingDown => return Err(ServerError::ManagerInactive),
                Lifecycle::Inactive => *lifecycle = Lifecycle::Active,
            }
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                sleep(manager.heartbeat_interval).await;
                manager.heartbeat_pass().await;
            }
        });
        *self.heartbeat_handle.lock().unwrap() = Some(handle);

        info!(
            "WebSocket manager initialized (heartbeat every {:?}, timeout {:?})",
            self.heartbeat_interval, self.connection_timeout
        );
        Ok(())
    }

    /// Register a connection and bring it up to date: greeting first,
    /// then a replay of the most recent queued messages.
    pub async fn handle_connection(
        &self,
        sink: Arc<dyn ConnectionSink>,
        client_id: Option<String>,
    ) -> Result<String, ServerError> {
        if !self.is_active() {
            return Err(ServerError::ManagerInactive);
        }

        let connection_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection = WsConnection {
            id: connection_id.clone(),
            sink,
            is_alive: true,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            ping_retries: 0,
        };

        let previous = self.connections.insert(connection_id.clone(), connection);
        if let Some(previous) = previous {
            info!(
                "Client {} reconnected; superseding its previous connection",
                previous.id
            );
            let _ = previous.sink.close(1000, "superseded by reconnect").await;
        }
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        info!(
            "WebSocket connection established: {} ({} active)",
            connection_id,
            self.connections.len()
        );

        let greeting = WebSocketMessage::new(MessagePayload::ConnectionEstablished(
            ConnectionGreeting {
                connection_id: connection_id.clone(),
                server_time: Utc::now(),
            },
        ));
        self.send_to_client(&connection_id, greeting).await;

        let replay: Vec<WebSocketMessage> = {
            let queue = self.queue.lock().unwrap();
            let skip = queue.len().saturating_sub(REPLAY_COUNT);
            queue.iter().skip(skip).cloned().collect()
        };
        if !replay.is_empty() {
            debug!(
                "Replaying {} queued messages to {}",
                replay.len(),
                connection_id
            );
            for message in replay {
                self.send_to_client(&connection_id, message).await;
            }
        }

        Ok(connection_id)
    }

    /// Drop a connection from the registry, but only if `sink` still owns
    /// the entry. A reconnect replaces the record under the same id; when
    /// the superseded reader finally exits it must not evict its
    /// replacement.
    pub fn remove_connection(&self, connection_id: &str, sink: &Arc<dyn ConnectionSink>, reason: &str) {
        let removed = self
            .connections
            .remove_if(connection_id, |_, conn| Arc::ptr_eq(&conn.sink, sink));
        if let Some((_, conn)) = removed {
            let connected_for = Utc::now().signed_duration_since(conn.connected_at);
            info!(
                "Connection {} removed after {}s ({}); {} active",
                connection_id,
                connected_for.num_seconds(),
                reason,
                self.connections.len()
            );
        }
    }

    /// Any inbound frame proves the socket is still moving.
    pub fn record_activity(&self, connection_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.last_activity = Instant::now();
        }
    }

    pub fn record_message_received(&self, _connection_id: &str) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A pong settles the open probe for this connection.
    pub fn handle_pong(&self, connection_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.is_alive = true;
            conn.ping_retries = 0;
            conn.last_activity = Instant::now();
            debug!("Pong from {}", connection_id);
        }
    }

    /// Send one message to one connection. False means the connection is
    /// unknown, already marked dead, or the send failed.
    pub async fn send_to_client(&self, connection_id: &str, message: WebSocketMessage) -> bool {
        let sink = match self.connections.get(connection_id) {
            Some(conn) if conn.is_alive => conn.sink.clone(),
            _ => return false,
        };

        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize message for {}: {}", connection_id, e);
                return false;
            }
        };

        match sink.send_frame(Opcode::Text, payload.into_bytes()).await {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!("Send to {} failed: {}", connection_id, e);
                self.mark_not_alive(connection_id);
                false
            }
        }
    }

    /// Deliver a message to every connection alive right now. With nobody
    /// listening the message is queued for later replay instead.
    pub async fn broadcast(&self, message: WebSocketMessage) -> usize {
        let targets: Vec<(String, Arc<dyn ConnectionSink>)> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_alive)
            .map(|entry| (entry.key().clone(), entry.value().sink.clone()))
            .collect();

        if targets.is_empty() {
            self.enqueue(message);
            return 0;
        }

        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize broadcast: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for (connection_id, sink) in targets {
            match sink
                .send_frame(Opcode::Text, payload.clone().into_bytes())
                .await
            {
                Ok(()) => {
                    delivered += 1;
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", connection_id, e);
                    self.mark_not_alive(&connection_id);
                }
            }
        }
        delivered
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.connections.len(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            queued_messages: self.queue.lock().unwrap().len(),
        }
    }

    /// Notify every connection, give the notices a moment to flush, close
    /// everything, and reset to a cold state.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle != Lifecycle::Active {
                return;
            }
            *lifecycle = Lifecycle::ShuttingDown;
        }
        info!("WebSocket manager shutting down");

        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }

        let targets: Vec<(String, Arc<dyn ConnectionSink>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().sink.clone()))
            .collect();

        if let Ok(notice) = serde_json::to_string(&WebSocketMessage::server_shutdown()) {
            for (connection_id, sink) in &targets {
                if sink
                    .send_frame(Opcode::Text, notice.clone().into_bytes())
                    .await
                    .is_ok()
                {
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!("Shutdown notice to {} failed", connection_id);
                }
            }
        }

        sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;

        for (_, sink) in &targets {
            let _ = sink.close(1000, "server shutdown").await;
        }

        let stats = self.stats();
        info!(
            "Final connection stats: total={} active={} sent={} received={} queued={}",
            stats.total_connections,
            stats.active_connections,
            stats.messages_sent,
            stats.messages_received,
            stats.queued_messages
        );

        self.connections.clear();
        self.queue.lock().unwrap().clear();
        self.total_connections.store(0, Ordering::Relaxed);
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);

        *self.lifecycle.lock().unwrap() = Lifecycle::Inactive;
        info!("WebSocket manager shut down");
    }

    fn mark_not_alive(&self, connection_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.is_alive = false;
        }
    }

    fn enqueue(&self, message: WebSocketMessage) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() == QUEUE_CAPACITY {
            queue.pop_front();
            warn!("Message queue full; dropped the oldest queued message");
        }
        queue.push_back(message);
        debug!("Queued message for replay ({} queued)", queue.len());
    }

    /// One heartbeat round: time out silent connections, retire the ones
    /// that ignored too many probes, ping the rest. Removals happen after
    /// classification so the pass sees one consistent picture.
    async fn heartbeat_pass(&self) {
        let mut stale: Vec<String> = Vec::new();
        let mut probes: Vec<(String, Arc<dyn ConnectionSink>)> = Vec::new();

        for mut entry in self.connections.iter_mut() {
            let conn = entry.value_mut();
            if conn.last_activity.elapsed() > self.connection_timeout
                || conn.ping_retries >= MAX_PING_RETRIES
            {
                stale.push(conn.id.clone());
                continue;
            }
            if conn.is_alive {
                conn.is_alive = false;
                conn.ping_retries = 0;
            } else {
                conn.ping_retries += 1;
                debug!(
                    "Connection {} missed a pong (retry {})",
                    conn.id, conn.ping_retries
                );
            }
            probes.push((conn.id.clone(), conn.sink.clone()));
        }

        for (connection_id, sink) in probes {
            if sink.send_frame(Opcode::Ping, b"hb".to_vec()).await.is_err() {
                debug!("Heartbeat ping to {} failed", connection_id);
            }
        }

        for connection_id in stale {
            if let Some((_, conn)) = self.connections.remove(&connection_id) {
                info!(
                    "Connection {} unresponsive; closing ({} active)",
                    connection_id,
                    self.connections.len()
                );
                let _ = conn.sink.close(1000, "heartbeat timeout").await;
            }
        }
    }
}
