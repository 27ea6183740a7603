//! Binary envelope for document and awareness traffic between peers.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ sender    │ target       │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 0/16 bytes   │ varint   │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! The relay is a dumb fan-out that echoes every frame to every connection in
//! the room, the sender included. Peers therefore drop frames they sent
//! themselves and frames addressed to somebody else.
//!
//! Handshake between a newcomer `A` and an existing peer `B`:
//! ```text
//! A ── SyncStep1(svA)            ──► everyone
//! B ── SyncStep2(diff A lacks)   ──► A
//! B ── SyncStep1(svB, target A)  ──► A
//! A ── SyncStep2(diff B lacks)   ──► B      (targeted step 1: no reply step 1)
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector; receivers answer with the diff the sender lacks
    SyncStep1 = 1,
    /// Yrs state diff response
    SyncStep2 = 2,
    /// Incremental update from a local transaction
    Update = 3,
    /// Encoded awareness update
    Awareness = 4,
    /// Ask every peer to re-send its local awareness state
    QueryAwareness = 5,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Connection identity of the sending transport
    pub sender: Uuid,
    /// Recipient, or `None` for every peer in the room
    pub target: Option<Uuid>,
    /// Per-sender sequence number, useful for tracing only
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a sync step 1. `target` is `None` for the broadcast hello.
    pub fn sync_step1(sender: Uuid, target: Option<Uuid>, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            sender,
            target,
            clock: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 addressed to the peer that asked for it.
    pub fn sync_step2(sender: Uuid, target: Uuid, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            sender,
            target: Some(target),
            clock: 0,
            payload: state_diff,
        }
    }

    /// Create an incremental update message.
    pub fn update(sender: Uuid, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            sender,
            target: None,
            clock,
            payload: yrs_update,
        }
    }

    /// Create an awareness message around an encoded awareness update.
    pub fn awareness(sender: Uuid, target: Option<Uuid>, awareness_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            sender,
            target,
            clock: 0,
            payload: awareness_update,
        }
    }

    /// Create an awareness query.
    pub fn query_awareness(sender: Uuid) -> Self {
        Self {
            msg_type: MessageType::QueryAwareness,
            sender,
            target: None,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Whether `peer` should process this message.
    pub fn is_addressed_to(&self, peer: Uuid) -> bool {
        self.sender != peer && self.target.map_or(true, |target| target == peer)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidPayload(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
