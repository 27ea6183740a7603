//! Crate-level error type.
//!
//! Transport failures never reach the engine's caller: they are reported as
//! [`TransportEvent`](crate::transport::TransportEvent)s and reflected in the
//! connection status. The variants here surface from the lower-level building
//! blocks (document, codec, relay) that callers may drive directly.

use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Failed to connect to relay: {0}")]
    TransportConnect(String),

    #[error("Relay connection closed: {0}")]
    TransportClose(String),

    /// A remote record that does not decode into a node or edge.
    #[error("Malformed remote snapshot entry: {0}")]
    MalformedRemoteSnapshot(String),

    #[error("Malformed document update: {0}")]
    MalformedUpdate(String),

    #[error("Document error: {0}")]
    Document(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::MalformedRemoteSnapshot(e.to_string())
    }
}
