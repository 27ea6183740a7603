//! # skyforge-collab - Real-time collaboration for the Skyforge schema designer
//!
//! Keeps each participant's canvas (tables as nodes, relationships as edges)
//! converged through a shared CRDT document, and tells every participant who
//! else is in the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  set_* / listener   ┌──────────────────────┐
//! │ CanvasStore  │ ◄─────────────────► │ ReconciliationBridge │
//! │ (host owned) │                     └──────────┬───────────┘
//! └──────────────┘                                │ replace / observe
//!                                                 ▼
//! ┌─────────────────────┐  events     ┌──────────────────────┐
//! │ CollaborationEngine │ ◄────────── │ SharedDocument (Yrs) │
//! │ (session task)      │             └──────────┬───────────┘
//! └─────────┬───────────┘                        │ updates
//!           │ presence                           ▼
//!           │                         ┌──────────────────────┐   WebSocket
//!           └───────────────────────► │ TransportProvider    │ ◄──────────► RelayServer
//!                                     │ (+ Awareness)        │  Binary Proto  (fan-out)
//!                                     └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - Node / edge records and the canvas snapshot
//! - [`document`] - Shared document with two replicated collections
//! - [`protocol`] - Binary wire protocol (bincode-encoded SyncMessage)
//! - [`presence`] - Awareness channel and collaborator resolution
//! - [`transport`] - WebSocket provider with reconnect and awareness
//! - [`store`] - Local state container contract and in-memory store
//! - [`scheduler`] - Debounce for local write-backs
//! - [`bridge`] - Two-way store ⇄ document reconciliation
//! - [`engine`] - Lifecycle manager (the public entry point)
//! - [`broadcast`] - Room-based fan-out with backpressure
//! - [`relay`] - WebSocket relay peers meet on

pub mod error;
pub mod record;
pub mod document;
pub mod protocol;
pub mod presence;
pub mod transport;
pub mod store;
pub mod scheduler;
pub mod bridge;
pub mod engine;
pub mod broadcast;
pub mod relay;

// Re-exports for convenience
pub use error::CollabError;
pub use record::{CanvasSnapshot, EdgeRecord, NodeRecord, Position, Record};
pub use document::{Collection, Seeded, SharedDocument};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use presence::{
    color_for_peer, Awareness, AwarenessChange, AwarenessUpdate, LocalPeer, PresenceRecord,
    PresenceResolver, PALETTE, PRESENCE_FIELD,
};
pub use transport::{TransportConfig, TransportEvent, TransportProvider, TransportStatus};
pub use store::{CanvasState, CanvasStore, MemoryStore, StoreListener, StoreSubscription};
pub use scheduler::CoalescingScheduler;
pub use bridge::ReconciliationBridge;
pub use engine::{
    room_name, use_collaboration, CollaborationEngine, CollaborationOptions, ConnectionStatus,
    EngineConfig,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionInfo, RoomManager};
pub use relay::{RelayConfig, RelayServer, RelayStats};
