//! Lifecycle manager: owns one room session at a time.
//!
//! ```text
//!            enabled && room key
//!   Idle ─────────────────────────► Connecting ──connected──► Connected
//!    ▲                                  │                         │
//!    │         error / close            │                         │
//!    ├──────────────────────────────────┴─────────────────────────┤
//!    │   disable / room change / user change / shutdown (teardown)│
//!    └────────────────────────────────────────────────────────────┘
//! ```
//!
//! A session is a single tokio task that selects over transport events,
//! local dirty notifications, the debounce deadline, presence follow-ups,
//! the presence heartbeat and engine commands. Nothing in it blocks on the
//! network; the transport task does the socket work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bridge::ReconciliationBridge;
use crate::document::{Collection, SharedDocument};
use crate::error::CollabError;
use crate::presence::{LocalPeer, PresenceRecord, PresenceResolver, PRESENCE_FIELD};
use crate::scheduler::{sleep_until_opt, CoalescingScheduler};
use crate::store::CanvasStore;
use crate::transport::{TransportConfig, TransportEvent, TransportProvider, TransportStatus};

/// Collaboration status reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    /// Application prefix of every room name
    pub room_prefix: String,
    /// Quiet period before local changes are written to the document
    pub debounce: Duration,
    /// Extra presence re-broadcasts after connecting
    pub presence_followups: Vec<Duration>,
    /// Presence re-broadcast period while connected
    pub presence_heartbeat: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            room_prefix: "skyforge".to_string(),
            debounce: Duration::from_millis(40),
            presence_followups: vec![
                Duration::from_millis(50),
                Duration::from_millis(200),
                Duration::from_millis(600),
            ],
            presence_heartbeat: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    pub fn with_endpoint(mut self, endpoint_base: impl Into<String>) -> Self {
        self.transport.endpoint_base = endpoint_base.into();
        self
    }
}

/// What the host wants the engine to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaborationOptions {
    pub room_key: Option<String>,
    pub enabled: bool,
    pub user: Option<LocalPeer>,
}

impl CollaborationOptions {
    pub fn new(room_key: impl Into<String>) -> Self {
        Self {
            room_key: Some(room_key.into()),
            enabled: true,
            user: None,
        }
    }

    pub fn with_user(mut self, user: LocalPeer) -> Self {
        self.user = Some(user);
        self
    }

    fn active_room_key(&self) -> Option<&str> {
        match self.room_key.as_deref() {
            Some(key) if self.enabled && !key.is_empty() => Some(key),
            _ => None,
        }
    }
}

/// Transport room name for a room key.
pub fn room_name(prefix: &str, room_key: &str) -> String {
    format!("{prefix}-{room_key}")
}

type SessionParts = (
    Session,
    mpsc::Receiver<TransportEvent>,
    mpsc::UnboundedReceiver<Collection>,
);

fn take_events(
    provider: &mut TransportProvider,
) -> Result<mpsc::Receiver<TransportEvent>, CollabError> {
    provider.take_event_rx().ok_or_else(|| {
        CollabError::TransportConnect("transport event stream already taken".to_string())
    })
}

enum SessionCommand {
    ClearPresence,
    Shutdown,
}

struct RoomSession {
    room: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

/// Keeps the injected canvas store in sync with a shared room.
pub struct CollaborationEngine {
    config: EngineConfig,
    store: Arc<dyn CanvasStore>,
    options: CollaborationOptions,
    status: Arc<watch::Sender<ConnectionStatus>>,
    peers: Arc<watch::Sender<Vec<PresenceRecord>>>,
    session: Option<RoomSession>,
}

impl CollaborationEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn CanvasStore>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        let (peers, _) = watch::channel(Vec::new());
        Self {
            config,
            store,
            options: CollaborationOptions::default(),
            status: Arc::new(status),
            peers: Arc::new(peers),
            session: None,
        }
    }

    /// Apply new options. Any change tears the current session down and, if
    /// the new options call for it, starts a fresh one.
    pub async fn configure(&mut self, options: CollaborationOptions) {
        if options == self.options {
            return;
        }
        self.teardown().await;
        self.options = options;

        let Some(room_key) = self.options.active_room_key() else {
            return;
        };
        let room = room_name(&self.config.room_prefix, room_key);
        if let Err(e) = self.start(room.clone()) {
            log::error!("Failed to start collaboration in {room}: {e}");
            self.reset_outputs();
        }
    }

    fn start(&mut self, room: String) -> Result<(), CollabError> {
        self.status.send_replace(ConnectionStatus::Connecting);

        let (mut session, events, dirty_rx) = self.open_session(room.clone())?;
        session.resolve();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(session.run(command_rx, events, dirty_rx));
        log::info!("Collaboration session started in {room}");

        self.session = Some(RoomSession {
            room,
            commands,
            task,
        });
        Ok(())
    }

    /// Bind a fresh document to `room` and the store. Local presence is
    /// published later, once the transport reports connected.
    fn open_session(&self, room: String) -> Result<SessionParts, CollabError> {
        let doc = SharedDocument::new();
        let mut provider =
            TransportProvider::connect(self.config.transport.clone(), room.clone(), doc.clone())?;
        let events = take_events(&mut provider)?;

        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let bridge = ReconciliationBridge::attach(doc, self.store.clone(), dirty_tx)?;

        let user = self.options.user.clone();
        let session = Session {
            room,
            config: self.config.clone(),
            provider: Some(provider),
            bridge,
            resolver: PresenceResolver::new(user.clone()),
            user,
            scheduler: CoalescingScheduler::new(self.config.debounce),
            followups: Vec::new(),
            status: self.status.clone(),
            peers: self.peers.clone(),
        };
        Ok((session, events, dirty_rx))
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(SessionCommand::Shutdown);
            if let Err(e) = session.task.await {
                log::error!("Session task for {} failed: {e}", session.room);
            }
            log::info!("Collaboration session in {} torn down", session.room);
        }
        self.reset_outputs();
    }

    fn reset_outputs(&self) {
        self.peers.send_replace(Vec::new());
        self.status.send_replace(ConnectionStatus::Idle);
    }

    /// Drop the local presence right away (tab closing).
    pub fn clear_presence(&self) {
        if let Some(session) = &self.session {
            let _ = session.commands.send(SessionCommand::ClearPresence);
        }
    }

    /// Tear everything down and go idle.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
        self.options = CollaborationOptions::default();
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn peers(&self) -> Vec<PresenceRecord> {
        self.peers.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.peers.subscribe()
    }

    /// Room name of the active session.
    pub fn room(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.room.as_str())
    }

    pub fn options(&self) -> &CollaborationOptions {
        &self.options
    }
}

impl Drop for CollaborationEngine {
    fn drop(&mut self) {
        // The session task finishes its own teardown.
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(SessionCommand::Shutdown);
        }
    }
}

/// Build an engine and apply `options` in one step.
pub async fn use_collaboration(
    config: EngineConfig,
    store: Arc<dyn CanvasStore>,
    options: CollaborationOptions,
) -> CollaborationEngine {
    let mut engine = CollaborationEngine::new(config, store);
    engine.configure(options).await;
    engine
}

// ───────────────────────────────────────────────────────────────────
// Session task
// ───────────────────────────────────────────────────────────────────

struct Session {
    room: String,
    config: EngineConfig,
    provider: Option<TransportProvider>,
    bridge: ReconciliationBridge,
    resolver: PresenceResolver,
    user: Option<LocalPeer>,
    scheduler: CoalescingScheduler<Collection>,
    /// Pending presence re-broadcasts, earliest first
    followups: Vec<Instant>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    peers: Arc<watch::Sender<Vec<PresenceRecord>>>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut dirty: mpsc::UnboundedReceiver<Collection>,
    ) {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.presence_heartbeat,
            self.config.presence_heartbeat,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let connected = *self.status.borrow() == ConnectionStatus::Connected;
            let next_followup = self.followups.first().copied();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::ClearPresence) => self.clear_presence(),
                    Some(SessionCommand::Shutdown) | None => break,
                },

                Some(event) = events.recv() => self.on_transport_event(event),

                Some(collection) = dirty.recv() => {
                    self.scheduler.schedule(collection);
                    while let Ok(collection) = dirty.try_recv() {
                        self.scheduler.schedule(collection);
                    }
                }

                _ = sleep_until_opt(self.scheduler.deadline()) => {
                    let collections = self.scheduler.flush_now();
                    if let Err(e) = self.bridge.flush(&collections) {
                        log::warn!("Failed to write local changes to {}: {e}", self.room);
                    }
                }

                _ = sleep_until_opt(next_followup) => {
                    self.followups.remove(0);
                    self.renew_presence();
                }

                _ = heartbeat.tick(), if connected => self.renew_presence(),
            }
        }

        self.teardown().await;
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(TransportStatus::Connected) => {
                self.status.send_replace(ConnectionStatus::Connected);
                self.publish_presence();
                self.resolve();
                let now = Instant::now();
                self.followups = self.config.presence_followups.iter().map(|d| now + *d).collect();
                self.followups.sort();
            }
            TransportEvent::Status(TransportStatus::Connecting) => {
                self.status.send_replace(ConnectionStatus::Connecting);
            }
            TransportEvent::Status(TransportStatus::Disconnected) => {
                self.status.send_replace(ConnectionStatus::Idle);
                self.followups.clear();
            }
            TransportEvent::ConnectionError(reason) => {
                log::debug!("Connection error in {}: {reason}", self.room);
                self.status.send_replace(ConnectionStatus::Idle);
            }
            TransportEvent::ConnectionClose(reason) => {
                log::debug!("Connection closed in {}: {reason:?}", self.room);
                self.status.send_replace(ConnectionStatus::Idle);
            }
            TransportEvent::Synced => log::debug!("Room {} synced", self.room),
            TransportEvent::AwarenessChanged(_) => self.resolve(),
        }
    }

    /// Set (or re-set) the local presence field.
    fn publish_presence(&self) {
        if let (Some(provider), Some(user)) = (&self.provider, &self.user) {
            provider.set_local_state_field(PRESENCE_FIELD, user.presence().to_value());
        }
    }

    fn renew_presence(&self) {
        if let Some(provider) = &self.provider {
            provider.renew_local_state();
        }
    }

    fn clear_presence(&mut self) {
        self.followups.clear();
        if let Some(provider) = &self.provider {
            provider.set_local_state(None);
        }
        self.resolve();
    }

    /// Recompute the collaborator list and publish it if it changed.
    fn resolve(&mut self) {
        let Some(provider) = &self.provider else {
            return;
        };
        let states = provider.awareness_states();
        if let Some(peers) = self.resolver.resolve(&states) {
            log::debug!("Room {} now has {} collaborators", self.room, peers.len());
            self.peers.send_replace(peers.to_vec());
        }
    }

    async fn teardown(&mut self) {
        self.bridge.detach();
        self.scheduler.cancel_all();
        self.followups.clear();

        if let Some(provider) = self.provider.take() {
            provider.set_local_state(None);
            provider.destroy().await;
        }

        self.resolver.reset();
        self.peers.send_replace(Vec::new());
        self.status.send_replace(ConnectionStatus::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn unreachable_config() -> EngineConfig {
        EngineConfig::default().with_endpoint("ws://127.0.0.1:9/ws/collaboration")
    }

    #[test]
    fn test_room_name() {
        assert_eq!(room_name("skyforge", "abc123"), "skyforge-abc123");
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(40));
        assert_eq!(config.presence_heartbeat, Duration::from_secs(3));
        assert_eq!(config.presence_followups.len(), 3);
        assert_eq!(config.transport.endpoint_base, "ws://127.0.0.1:8080/ws/collaboration");
    }

    #[test]
    fn test_active_room_key() {
        assert_eq!(CollaborationOptions::new("abc").active_room_key(), Some("abc"));
        assert_eq!(CollaborationOptions::new("").active_room_key(), None);

        let disabled = CollaborationOptions {
            enabled: false,
            ..CollaborationOptions::new("abc")
        };
        assert_eq!(disabled.active_room_key(), None);
        assert_eq!(CollaborationOptions::default().active_room_key(), None);
    }

    #[tokio::test]
    async fn test_disabled_stays_idle() {
        let store = Arc::new(MemoryStore::new());
        let options = CollaborationOptions {
            enabled: false,
            ..CollaborationOptions::new("abc123")
        };
        let engine = use_collaboration(unreachable_config(), store.clone(), options).await;

        assert_eq!(engine.status(), ConnectionStatus::Idle);
        assert!(engine.peers().is_empty());
        assert!(engine.room().is_none());
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_enable_then_disable_releases_store() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = CollaborationEngine::new(unreachable_config(), store.clone());

        engine.configure(CollaborationOptions::new("abc123")).await;
        assert_eq!(engine.room(), Some("skyforge-abc123"));
        assert_ne!(engine.status(), ConnectionStatus::Connected);
        assert_eq!(store.listener_count(), 1);

        engine.configure(CollaborationOptions::default()).await;
        assert_eq!(engine.status(), ConnectionStatus::Idle);
        assert!(engine.room().is_none());
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_same_options_keep_session() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = CollaborationEngine::new(unreachable_config(), store.clone());
        let options = CollaborationOptions::new("abc123").with_user(LocalPeer::new("u1", "Alice"));

        engine.configure(options.clone()).await;
        let mut status = engine.subscribe_status();
        status.mark_unchanged();
        engine.configure(options).await;
        assert!(!status.has_changed().unwrap());

        engine.shutdown().await;
        assert_eq!(engine.status(), ConnectionStatus::Idle);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_presence_published_only_once_connected() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = CollaborationEngine::new(unreachable_config(), store);
        engine.options = CollaborationOptions::new("abc123").with_user(LocalPeer::new("u1", "Alice"));

        let (mut session, _events, _dirty) = engine.open_session("skyforge-abc123".to_string()).unwrap();
        let local = |session: &Session| session.provider.as_ref().unwrap().local_state();
        assert!(local(&session).is_none());

        session.on_transport_event(TransportEvent::Status(TransportStatus::Connected));
        let state = local(&session).unwrap();
        assert_eq!(state[PRESENCE_FIELD]["id"], "u1");
        assert_eq!(state[PRESENCE_FIELD]["name"], "Alice");
        assert_eq!(engine.status(), ConnectionStatus::Connected);
        assert_eq!(session.followups.len(), 3);

        session.teardown().await;
        assert_eq!(engine.status(), ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn test_missing_event_stream_is_a_transport_error() {
        let mut provider = TransportProvider::connect(
            unreachable_config().transport,
            "skyforge-abc123",
            SharedDocument::new(),
        )
        .unwrap();

        assert!(take_events(&mut provider).is_ok());
        assert!(matches!(
            take_events(&mut provider),
            Err(CollabError::TransportConnect(_))
        ));
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_local_user_listed_while_offline() {
        let store = Arc::new(MemoryStore::new());
        let options = CollaborationOptions::new("abc123").with_user(LocalPeer::new("u1", "Alice"));
        let mut engine = use_collaboration(unreachable_config(), store, options).await;

        let peers = engine.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "u1");

        engine.shutdown().await;
        assert!(engine.peers().is_empty());
    }
}
