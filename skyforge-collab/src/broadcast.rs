//! Per-room fan-out for the relay.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames. A connection that falls further behind lags; the relay
//! closes it so the client reconnects and re-runs the state exchange.
//!
//! Reference: Patterson & Hennessy, section 6.4 (interconnection networks)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// One socket attached to a room.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub addr: SocketAddr,
    pub connected_at: Instant,
}

impl ConnectionInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            addr,
            connected_at: Instant::now(),
        }
    }
}

/// Lock-free counters updated on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single room.
///
/// Every frame goes to every subscriber, the sender included. Peers filter
/// their own echoes.
pub struct BroadcastGroup {
    /// Broadcast channel sender
    sender: broadcast::Sender<Message>,

    /// Connections in this room
    connections: RwLock<HashMap<Uuid, ConnectionInfo>>,

    /// Frames buffered per receiver
    capacity: usize,

    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Attach a connection and return its receiver.
    pub async fn join(&self, info: ConnectionInfo) -> broadcast::Receiver<Message> {
        let mut connections = self.connections.write().await;
        connections.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    /// Detach a connection. Returns the number still attached.
    pub async fn leave(&self, connection_id: &Uuid) -> usize {
        let mut connections = self.connections.write().await;
        connections.remove(connection_id);
        connections.len()
    }

    /// Fan a frame out to every connection in the room.
    ///
    /// Returns the number of receivers that got it.
    pub fn broadcast(&self, frame: Message) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps room names to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Join `room`, creating it on first use.
    pub async fn join(
        &self,
        room: &str,
        info: ConnectionInfo,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Message>) {
        // Room creation and membership change happen under one write lock
        // so a concurrent `leave` cannot remove the room in between.
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let rx = group.join(info).await;
        (group, rx)
    }

    /// Leave `room`; the room is removed once its last connection leaves.
    ///
    /// Returns the number of connections still in the room.
    pub async fn leave(&self, room: &str, connection_id: &Uuid) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room).cloned() else {
            return 0;
        };
        let remaining = group.leave(connection_id).await;
        if remaining == 0 {
            rooms.remove(room);
        }
        remaining
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
