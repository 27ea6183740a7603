//! Room relay: a dumb WebSocket fan-out the collaboration peers meet on.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                ┌──► Client A (echo)
//!             ├── /ws/collaboration/{room} ───┼──► Client B
//! Client B ──┘          BroadcastGroup        └──► Client C
//! ```
//!
//! The relay never decodes frames and keeps no document state. Peers do the
//! state exchange among themselves, so a restarted relay loses nothing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ConnectionInfo, RoomManager};
use crate::error::CollabError;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path prefix in front of the room segment
    pub path_prefix: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between server pings
    pub ping_interval: Duration,
    /// A connection silent for longer than this is dropped
    pub pong_timeout: Duration,
    /// Upper bound for a single write
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path_prefix: "/ws/collaboration/".to_string(),
            broadcast_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Defaults, overridden by `SKYFORGE_RELAY_ADDR` and `SKYFORGE_RELAY_PATH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("SKYFORGE_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("SKYFORGE_RELAY_PATH") {
            config = config.with_path_prefix(path);
        }
        config
    }

    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    /// Set the path prefix, normalised to start and end with `/`.
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let trimmed = prefix.into().trim_matches('/').to_string();
        self.path_prefix = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        self
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Connections closed because they fell behind the room's buffer
    pub lagged_disconnects: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    lagged_disconnects: AtomicU64,
}

/// Shared state handed to every connection task.
struct RelayContext {
    config: RelayConfig,
    rooms: RoomManager,
    stats: AtomicRelayStats,
}

/// The relay server.
pub struct RelayServer {
    context: Arc<RelayContext>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            context: Arc::new(RelayContext {
                rooms: RoomManager::new(config.broadcast_capacity),
                config,
                stats: AtomicRelayStats::default(),
            }),
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.context.config
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.context.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        log::info!(
            "Relay listening on {} (rooms under {})",
            listener.local_addr()?,
            self.context.config.path_prefix
        );
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        continue;
                    }
                },
                _ = wait_shutdown(&mut shutdown) => break,
            };
            log::debug!("New TCP connection from {addr}");

            let context = self.context.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, context, shutdown).await {
                    log::debug!("Connection from {addr} ended: {e}");
                }
            });
        }

        log::info!("Relay stopped");
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn stats(&self) -> RelayStats {
        let stats = &self.context.stats;
        RelayStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            lagged_disconnects: stats.lagged_disconnects.load(Ordering::Relaxed),
            active_rooms: self.context.rooms.room_count().await,
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Room segment of `path`, if it sits under `prefix`.
pub fn room_from_path(prefix: &str, path: &str) -> Option<String> {
    let room = path.strip_prefix(prefix)?.trim_end_matches('/');
    if room.is_empty() || room.contains('/') {
        return None;
    }
    Some(room.to_string())
}

fn room_required() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Room key required".to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Decrements the active-connection gauge however the task ends.
struct ActiveConnection<'a>(&'a AtomicU64);

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<RelayContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), CollabError> {
    let config = &context.config;

    let mut room: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match room_from_path(&config.path_prefix, request.uri().path()) {
            Some(key) => {
                room = Some(key);
                Ok(response)
            }
            None => Err(room_required()),
        }
    };
    let socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!("Rejected upgrade from {addr}: {e}");
            return Ok(());
        }
    };
    let Some(room) = room else {
        return Ok(());
    };

    context.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    context.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    let _active = ActiveConnection(&context.stats.active_connections);

    let info = ConnectionInfo::new(addr);
    let connection_id = info.connection_id;
    let (group, mut frames) = context.rooms.join(&room, info).await;
    log::info!(
        "Client {addr} joined room {room} (clients: {})",
        group.connection_count().await
    );

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    let mut last_seen = Instant::now();

    let result: Result<(), CollabError> = loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => {
                let _ = tokio::time::timeout(config.write_timeout, sink.send(Message::Close(None))).await;
                break Ok(());
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(msg @ (Message::Binary(_) | Message::Text(_)))) => {
                        last_seen = Instant::now();
                        context.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        context.stats.total_bytes.fetch_add(msg.len() as u64, Ordering::Relaxed);
                        let receivers = group.broadcast(msg);
                        log::trace!("Relayed frame in {room} to {receivers} clients");
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => break Err(CollabError::TransportClose(e.to_string())),
                }
            }

            outgoing = frames.recv() => {
                match outgoing {
                    Ok(frame) => {
                        match tokio::time::timeout(config.write_timeout, sink.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break Err(CollabError::TransportClose(e.to_string())),
                            Err(_) => break Err(CollabError::TransportClose(format!("write to {addr} timed out"))),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The skipped frames are gone; a reconnect re-runs the state exchange.
                        log::warn!("Client {addr} in {room} lagged, skipped {skipped} frames; closing");
                        group.record_dropped(skipped);
                        context.stats.lagged_disconnects.fetch_add(1, Ordering::Relaxed);
                        let close = Message::Close(Some(CloseFrame {
                            code: CloseCode::Again,
                            reason: "lagged behind room".into(),
                        }));
                        let _ = tokio::time::timeout(config.write_timeout, sink.send(close)).await;
                        break Err(CollabError::TransportClose(format!("{addr} lagged by {skipped} frames")));
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() > config.pong_timeout {
                    break Err(CollabError::TransportClose(format!("{addr} stopped responding")));
                }
                match tokio::time::timeout(config.write_timeout, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(CollabError::TransportClose(e.to_string())),
                    Err(_) => break Err(CollabError::TransportClose(format!("ping to {addr} timed out"))),
                }
            }
        }
    };

    let remaining = context.rooms.leave(&room, &connection_id).await;
    if remaining == 0 {
        log::info!("Room {room} removed (no clients)");
    } else {
        log::info!("Client {addr} left room {room} (remaining clients: {remaining})");
    }
    result
}
