//! WebSocket transport binding one [`SharedDocument`] to a relay room.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with backoff, destroy)
//! - Peer-to-peer state exchange through the relay (step 1 / step 2)
//! - Streaming of local document updates to the room
//! - The awareness sub-channel carrying presence
//!
//! ```text
//!  SharedDocument ──observe_local_updates──► outgoing_tx ─┐
//!                                                         ▼
//!                       ┌──────────────── connection task ────────────────┐
//!   relay ◄── sink ◄────┤ select! { shutdown, outgoing, socket, sweep }   │
//!   relay ──► stream ──►│   step1/step2/update ─► apply_remote_update     │
//!                       │   awareness/query    ─► Awareness               │
//!                       └──────────────────────────┬──────────────────────┘
//!                                                  ▼
//!                                         TransportEvent stream
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use yrs::Subscription;

use crate::document::SharedDocument;
use crate::error::CollabError;
use crate::presence::{Awareness, AwarenessChange, AwarenessUpdate};
use crate::protocol::{MessageType, SyncMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay endpoint without the room segment
    pub endpoint_base: String,
    /// Capacity of the event channel handed to the owner
    pub channel_capacity: usize,
    /// First reconnect delay; doubles per failed attempt
    pub reconnect_base: Duration,
    /// Upper bound for the reconnect delay
    pub reconnect_max: Duration,
    /// Remote presence not refreshed within this window is dropped
    pub awareness_timeout: Duration,
    /// How long `destroy` waits for the connection task to wind down
    pub close_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint_base: "ws://127.0.0.1:8080/ws/collaboration".to_string(),
            channel_capacity: 256,
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(2500),
            awareness_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(2),
        }
    }
}

impl TransportConfig {
    pub fn with_endpoint(mut self, endpoint_base: impl Into<String>) -> Self {
        self.endpoint_base = endpoint_base.into();
        self
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.reconnect_max)
    }

    fn sweep_interval(&self) -> Duration {
        (self.awareness_timeout / 10).max(Duration::from_millis(50))
    }
}

/// Socket state as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(TransportStatus),
    /// Connecting failed or the socket errored
    ConnectionError(String),
    /// The relay closed the socket
    ConnectionClose(Option<String>),
    /// First state exchange with a peer completed on this connection
    Synced,
    AwarenessChanged(AwarenessChange),
}

/// Outcome of one connected session.
enum SessionEnd {
    Shutdown,
    Closed(Option<String>),
    Failed(String),
}

/// Everything the connection task needs, owned by that task.
struct Connection {
    peer_id: Uuid,
    url: String,
    config: TransportConfig,
    doc: SharedDocument,
    awareness: Arc<Mutex<Awareness>>,
    events: mpsc::Sender<TransportEvent>,
    status: watch::Sender<TransportStatus>,
}

/// Handle to a live room connection.
///
/// Created with [`TransportProvider::connect`], which returns immediately;
/// the socket is opened and kept open by a background task until
/// [`destroy`](Self::destroy).
pub struct TransportProvider {
    peer_id: Uuid,
    room: String,
    awareness: Arc<Mutex<Awareness>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    status_rx: watch::Receiver<TransportStatus>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    close_timeout: Duration,
    _updates: Subscription,
}

impl TransportProvider {
    /// Bind `doc` to `room` on the configured relay.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(
        config: TransportConfig,
        room: impl Into<String>,
        doc: SharedDocument,
    ) -> Result<Self, CollabError> {
        let room = room.into();
        let peer_id = Uuid::new_v4();
        let url = format!("{}/{}", config.endpoint_base.trim_end_matches('/'), room);

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let (status_tx, status_rx) = watch::channel(TransportStatus::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let awareness = Arc::new(Mutex::new(Awareness::new(doc.client_id())));

        let updates = {
            let outgoing = outgoing.clone();
            let clock = AtomicU64::new(0);
            doc.observe_local_updates(move |update| {
                let clock = clock.fetch_add(1, Ordering::Relaxed) + 1;
                match SyncMessage::update(peer_id, clock, update).encode() {
                    Ok(frame) => {
                        let _ = outgoing.send(frame);
                    }
                    Err(e) => log::error!("Failed to encode document update: {e}"),
                }
            })?
        };

        let connection = Connection {
            peer_id,
            url,
            config: config.clone(),
            doc,
            awareness: awareness.clone(),
            events: event_tx,
            status: status_tx,
        };
        let task = tokio::spawn(connection.run(outgoing_rx, shutdown_rx));

        log::info!("Transport {peer_id} bound to room {room}");

        Ok(Self {
            peer_id,
            room,
            awareness,
            outgoing,
            event_rx: Some(event_rx),
            status_rx,
            shutdown,
            task: Some(task),
            close_timeout: config.close_timeout,
            _updates: updates,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn status(&self) -> TransportStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TransportStatus> {
        self.status_rx.clone()
    }

    fn awareness(&self) -> MutexGuard<'_, Awareness> {
        lock_awareness(&self.awareness)
    }

    // ── Awareness ────────────────────────────────────────────────

    /// Replace the local awareness state; `None` announces departure.
    pub fn set_local_state(&self, state: Option<Map<String, Value>>) {
        let update = self.awareness().set_local_state(state);
        self.broadcast_awareness(&update);
    }

    pub fn set_local_state_field(&self, field: &str, value: Value) {
        let update = self.awareness().set_local_state_field(field, value);
        self.broadcast_awareness(&update);
    }

    /// Re-announce the local state so peers keep it alive.
    pub fn renew_local_state(&self) {
        let update = self.awareness().renew_local_state();
        if let Some(update) = update {
            self.broadcast_awareness(&update);
        }
    }

    pub fn local_state(&self) -> Option<Map<String, Value>> {
        self.awareness().local_state().cloned()
    }

    /// Every known awareness state, the local one included.
    pub fn awareness_states(&self) -> Vec<Value> {
        self.awareness()
            .states()
            .into_iter()
            .map(|(_, state)| state)
            .collect()
    }

    fn broadcast_awareness(&self, update: &AwarenessUpdate) {
        let frame = update
            .encode()
            .and_then(|payload| SyncMessage::awareness(self.peer_id, None, payload).encode());
        match frame {
            Ok(frame) => {
                let _ = self.outgoing.send(frame);
            }
            Err(e) => log::error!("Failed to encode awareness update: {e}"),
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Flush queued frames, close the socket and stop the connection task.
    pub async fn destroy(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.close_timeout, &mut task).await.is_err() {
                log::warn!("Transport {} did not close in time; aborting", self.peer_id);
                task.abort();
            }
        }
        log::info!("Transport {} left room {}", self.peer_id, self.room);
    }
}

impl Drop for TransportProvider {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown.send(true);
            task.abort();
        }
    }
}

fn lock_awareness(awareness: &Mutex<Awareness>) -> MutexGuard<'_, Awareness> {
    awareness.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the provider is gone.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl Connection {
    async fn run(
        self,
        mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            self.set_status(TransportStatus::Connecting).await;

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
                _ = wait_shutdown(&mut shutdown) => break,
            };

            match connected {
                Ok((socket, _)) => {
                    attempt = 0;
                    log::info!("Transport {} connected to {}", self.peer_id, self.url);

                    // The handshake ships the full missing state, so anything
                    // queued while offline is redundant. Drained before the
                    // status change so frames queued in response to it survive.
                    let mut stale = 0usize;
                    while outgoing.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        log::debug!("Discarded {stale} frames queued while offline");
                    }
                    self.set_status(TransportStatus::Connected).await;

                    let end = self.session(socket, &mut outgoing, &mut shutdown).await;
                    self.clear_remote_awareness().await;

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed(reason) => {
                            log::info!("Relay closed connection for {}: {reason:?}", self.peer_id);
                            self.emit(TransportEvent::ConnectionClose(reason)).await;
                        }
                        SessionEnd::Failed(reason) => {
                            log::warn!("Connection for {} failed: {reason}", self.peer_id);
                            self.emit(TransportEvent::ConnectionError(reason)).await;
                        }
                    }
                }
                Err(e) => {
                    let error = CollabError::TransportConnect(e.to_string());
                    log::debug!("{error} ({})", self.url);
                    self.emit(TransportEvent::ConnectionError(error.to_string())).await;
                }
            }

            self.set_status(TransportStatus::Disconnected).await;

            let delay = self.config.reconnect_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_shutdown(&mut shutdown) => break,
            }
        }

        let _ = self.status.send(TransportStatus::Disconnected);
        log::debug!("Transport {} task finished", self.peer_id);
    }

    async fn session(
        &self,
        socket: Socket,
        outgoing: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        for frame in self.handshake() {
            if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                return SessionEnd::Failed(e.to_string());
            }
        }

        let mut synced = false;
        let mut sweep = tokio::time::interval(self.config.sweep_interval());

        loop {
            tokio::select! {
                _ = wait_shutdown(shutdown) => {
                    while let Ok(frame) = outgoing.try_recv() {
                        if sink.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                Some(frame) = outgoing.recv() => {
                    log::trace!("Sending {} bytes", frame.len());
                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let replies = self.handle_frame(&data, &mut synced).await;
                            for reply in replies {
                                if let Err(e) = sink.send(Message::Binary(reply.into())).await {
                                    return SessionEnd::Failed(e.to_string());
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| {
                                if f.reason.is_empty() {
                                    format!("code {}", u16::from(f.code))
                                } else {
                                    format!("code {}: {}", u16::from(f.code), f.reason.as_str())
                                }
                            });
                            return SessionEnd::Closed(reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                        None => return SessionEnd::Closed(None),
                    }
                }

                _ = sweep.tick() => {
                    let removed = lock_awareness(&self.awareness)
                        .remove_outdated(Instant::now(), self.config.awareness_timeout);
                    if !removed.is_empty() {
                        log::debug!("Expired presence of {} silent clients", removed.len());
                        self.emit(TransportEvent::AwarenessChanged(AwarenessChange {
                            removed,
                            ..AwarenessChange::default()
                        }))
                        .await;
                    }
                }
            }
        }
    }

    /// Frames sent right after the socket opens.
    fn handshake(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::with_capacity(3);
        let step1 = SyncMessage::sync_step1(self.peer_id, None, self.doc.state_vector());
        frames.extend(self.encode(step1));

        // Fresh clock, so peers that dropped us accept the state again.
        let local = lock_awareness(&self.awareness).renew_local_state();
        if let Some(update) = local {
            frames.extend(self.encode_awareness(&update, None));
        }

        frames.extend(self.encode(SyncMessage::query_awareness(self.peer_id)));
        frames
    }

    /// Process one inbound frame; returns the frames to send back.
    async fn handle_frame(&self, data: &[u8], synced: &mut bool) -> Vec<Vec<u8>> {
        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame ({} bytes): {e}", data.len());
                return Vec::new();
            }
        };
        if !msg.is_addressed_to(self.peer_id) {
            return Vec::new();
        }

        let mut replies = Vec::new();
        match msg.msg_type {
            MessageType::SyncStep1 => {
                log::debug!("Step 1 from {} (targeted: {})", msg.sender, msg.target.is_some());
                match self.doc.diff_since(&msg.payload) {
                    Ok(diff) => {
                        replies.extend(self.encode(SyncMessage::sync_step2(self.peer_id, msg.sender, diff)));
                    }
                    Err(e) => log::warn!("Bad state vector from {}: {e}", msg.sender),
                }
                if msg.target.is_none() {
                    let step1 = SyncMessage::sync_step1(
                        self.peer_id,
                        Some(msg.sender),
                        self.doc.state_vector(),
                    );
                    replies.extend(self.encode(step1));
                }
            }
            MessageType::SyncStep2 => {
                if let Err(e) = self.doc.apply_remote_update(&msg.payload) {
                    log::warn!("Rejected step 2 from {}: {e}", msg.sender);
                } else if !*synced {
                    *synced = true;
                    log::debug!("Transport {} synced with {}", self.peer_id, msg.sender);
                    self.emit(TransportEvent::Synced).await;
                }
            }
            MessageType::Update => {
                log::trace!("Update #{} from {}", msg.clock, msg.sender);
                if let Err(e) = self.doc.apply_remote_update(&msg.payload) {
                    log::warn!("Rejected update from {}: {e}", msg.sender);
                }
            }
            MessageType::Awareness => {
                let applied = AwarenessUpdate::decode(&msg.payload).and_then(|update| {
                    lock_awareness(&self.awareness).apply_update(&update, Instant::now())
                });
                match applied {
                    Ok(applied) => {
                        if applied.reassert_local {
                            let renewed = lock_awareness(&self.awareness).renew_local_state();
                            if let Some(update) = renewed {
                                replies.extend(self.encode_awareness(&update, None));
                            }
                        }
                        if !applied.change.is_empty() {
                            self.emit(TransportEvent::AwarenessChanged(applied.change)).await;
                        }
                    }
                    Err(e) => log::warn!("Dropping awareness from {}: {e}", msg.sender),
                }
            }
            MessageType::QueryAwareness => {
                let local = {
                    let awareness = lock_awareness(&self.awareness);
                    awareness.local_state().map(|_| awareness.local_update())
                };
                if let Some(update) = local {
                    replies.extend(self.encode_awareness(&update, Some(msg.sender)));
                }
            }
        }
        replies
    }

    fn encode(&self, msg: SyncMessage) -> Option<Vec<u8>> {
        match msg.encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.msg_type);
                None
            }
        }
    }

    fn encode_awareness(&self, update: &AwarenessUpdate, target: Option<Uuid>) -> Option<Vec<u8>> {
        let payload = match update.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode awareness update: {e}");
                return None;
            }
        };
        self.encode(SyncMessage::awareness(self.peer_id, target, payload))
    }

    async fn clear_remote_awareness(&self) {
        let removed = lock_awareness(&self.awareness).clear_remote();
        if !removed.is_empty() {
            self.emit(TransportEvent::AwarenessChanged(AwarenessChange {
                removed,
                ..AwarenessChange::default()
            }))
            .await;
        }
    }

    async fn set_status(&self, status: TransportStatus) {
        let _ = self.status.send(status);
        self.emit(TransportEvent::Status(status)).await;
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }
}
