//! Presence: who is in the room, and how to draw them.
//!
//! Provides the ephemeral awareness channel (one clocked key/value state per
//! client, never part of document history) and the resolver that turns raw
//! awareness states into the collaborator list the UI renders.
//!
//! ## Architecture
//!
//! ```text
//! set_local_state_field("user", …)
//!       │
//!       ▼
//! AwarenessUpdate { client_id, clock, state }
//!       │
//!       ▼   (SyncMessage::Awareness via relay)
//! Remote Awareness::apply_update()     ── clock-ordered, last write wins
//!       │
//!       ▼
//! PresenceResolver::resolve()           ── validate, dedup, colour, diff
//!       │
//!       ▼
//! Vec<PresenceRecord>  (only when the signature changed)
//! ```
//!
//! Reference: Kleppmann, Chapter 8 - Broadcast Protocols

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::ProtocolError;

/// Awareness field every client publishes its profile under.
pub const PRESENCE_FIELD: &str = "user";

/// Display colours handed out by [`color_for_peer`].
pub const PALETTE: [&str; 7] = [
    "#cba6f7", "#89b4fa", "#f5c2e7", "#a6e3a1", "#f9e2af", "#89dceb", "#fab387",
];

/// Awareness client identifier (the Yrs client id of the replica).
pub type ClientId = u64;

// ───────────────────────────────────────────────────────────────────
// Presence records
// ───────────────────────────────────────────────────────────────────

/// Pick a stable palette colour for a peer id.
///
/// Sums the leading UTF-16 unit of every character, which is what browser
/// clients hashing with `charCodeAt(0)` over a code-point iterator compute,
/// so every replica derives the same colour.
pub fn color_for_peer(id: &str) -> &'static str {
    let hash: u64 = id
        .chars()
        .map(|c| {
            let mut units = [0u16; 2];
            u64::from(c.encode_utf16(&mut units)[0])
        })
        .sum();
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

/// One collaborator as shown in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl PresenceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, avatar_url: Option<String>) -> Self {
        let id = id.into();
        let color = color_for_peer(&id).to_string();
        Self {
            id,
            name: name.into(),
            color,
            avatar_url,
        }
    }

    /// Extract a record from a full awareness state, if it carries a
    /// complete `user` field.
    pub fn from_state(state: &Value) -> Option<Self> {
        let user = state.get(PRESENCE_FIELD)?;
        let id = non_empty(user.get("id"))?;
        let name = non_empty(user.get("name"))?;
        let color =
            non_empty(user.get("color")).unwrap_or_else(|| color_for_peer(&id).to_string());
        let avatar_url = non_empty(user.get("avatarUrl"));
        Some(Self {
            id,
            name,
            color,
            avatar_url,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// The signed-in user of this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl LocalPeer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    pub fn presence(&self) -> PresenceRecord {
        PresenceRecord::new(self.id.clone(), self.name.clone(), self.avatar_url.clone())
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire format
// ───────────────────────────────────────────────────────────────────

/// One client's awareness state at a given clock. `state == None` means the
/// client left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: ClientId,
    pub clock: u32,
    /// JSON text of the state map. Bincode cannot carry `serde_json::Value`
    /// directly.
    pub state: Option<String>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }

    fn state_value(&self) -> Result<Option<Value>, ProtocolError> {
        match &self.state {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(raw) {
                Ok(Value::Object(map)) => Ok(Some(Value::Object(map))),
                Ok(_) => Err(ProtocolError::InvalidPayload(
                    "awareness state must be a JSON object".into(),
                )),
                Err(e) => Err(ProtocolError::InvalidPayload(e.to_string())),
            },
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness
// ───────────────────────────────────────────────────────────────────

/// Client ids touched by an awareness operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Result of applying a remote awareness update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub change: AwarenessChange,
    /// A peer announced us as gone while we are still here; re-broadcast.
    pub reassert_local: bool,
}

#[derive(Debug, Clone)]
struct RemoteState {
    state: Value,
    last_updated: Instant,
}

/// Per-client awareness map for one room.
///
/// Each client owns exactly one slot and is the only writer of it. Updates
/// carry a per-client clock; an update is accepted if its clock is newer, or
/// equal with a null state (an explicit leave for that clock).
#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    local_clock: u32,
    local: Option<Map<String, Value>>,
    remote: HashMap<ClientId, RemoteState>,
    /// Highest clock seen per remote client, kept after removal so stale
    /// updates cannot resurrect a departed peer.
    clocks: HashMap<ClientId, u32>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            local_clock: 0,
            local: None,
            remote: HashMap::new(),
            clocks: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&Map<String, Value>> {
        self.local.as_ref()
    }

    /// Replace the local state (`None` announces departure) and return the
    /// update to broadcast.
    pub fn set_local_state(&mut self, state: Option<Map<String, Value>>) -> AwarenessUpdate {
        self.local = state;
        self.local_clock += 1;
        self.local_update()
    }

    /// Set one field of the local state, creating the state if needed.
    pub fn set_local_state_field(&mut self, field: &str, value: Value) -> AwarenessUpdate {
        let mut state = self.local.take().unwrap_or_default();
        state.insert(field.to_string(), value);
        self.set_local_state(Some(state))
    }

    /// Re-announce the current local state under a fresh clock so peers
    /// refresh its expiry. `None` when there is nothing to announce.
    pub fn renew_local_state(&mut self) -> Option<AwarenessUpdate> {
        self.local.as_ref()?;
        self.local_clock += 1;
        Some(self.local_update())
    }

    /// The local state at its current clock, without bumping it.
    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            client_id: self.client_id,
            clock: self.local_clock,
            state: self
                .local
                .as_ref()
                .map(|state| Value::Object(state.clone()).to_string()),
        }
    }

    /// Integrate an update received from the network.
    pub fn apply_update(
        &mut self,
        update: &AwarenessUpdate,
        now: Instant,
    ) -> Result<Applied, ProtocolError> {
        let mut applied = Applied::default();

        if update.client_id == self.client_id {
            // Only we write our slot. A peer telling everyone we left (after
            // timing us out) must be contradicted.
            if update.state.is_none() && self.local.is_some() {
                if update.clock >= self.local_clock {
                    self.local_clock = update.clock;
                }
                applied.reassert_local = true;
            }
            return Ok(applied);
        }

        let state = update.state_value()?;
        let known_clock = self.clocks.get(&update.client_id).copied();
        let present = self.remote.contains_key(&update.client_id);

        let accept = match known_clock {
            None => true,
            Some(clock) => clock < update.clock || (clock == update.clock && state.is_none() && present),
        };
        if !accept {
            return Ok(applied);
        }

        self.clocks.insert(update.client_id, update.clock);
        match state {
            Some(state) => {
                let previous = self.remote.insert(
                    update.client_id,
                    RemoteState {
                        state: state.clone(),
                        last_updated: now,
                    },
                );
                match previous {
                    None => applied.change.added.push(update.client_id),
                    Some(prev) if prev.state != state => applied.change.updated.push(update.client_id),
                    Some(_) => {}
                }
            }
            None => {
                if self.remote.remove(&update.client_id).is_some() {
                    applied.change.removed.push(update.client_id);
                }
            }
        }
        Ok(applied)
    }

    /// Drop remote states that were not refreshed within `timeout`.
    pub fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .remote
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_updated) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.remote.remove(id);
        }
        stale
    }

    /// Forget every remote peer (connection lost).
    pub fn clear_remote(&mut self) -> Vec<ClientId> {
        self.remote.drain().map(|(id, _)| id).collect()
    }

    /// All known states, the local one included.
    pub fn states(&self) -> Vec<(ClientId, Value)> {
        let mut states: Vec<(ClientId, Value)> = self
            .remote
            .iter()
            .map(|(id, entry)| (*id, entry.state.clone()))
            .collect();
        if let Some(local) = &self.local {
            states.push((self.client_id, Value::Object(local.clone())));
        }
        states.sort_by_key(|(id, _)| *id);
        states
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Resolver
// ───────────────────────────────────────────────────────────────────

/// Turns raw awareness states into the published collaborator list.
#[derive(Debug, Default)]
pub struct PresenceResolver {
    local: Option<LocalPeer>,
    signature: Option<String>,
    peers: Vec<PresenceRecord>,
}

impl PresenceResolver {
    pub fn new(local: Option<LocalPeer>) -> Self {
        Self {
            local,
            signature: None,
            peers: Vec::new(),
        }
    }

    /// Recompute the collaborator list from `states`.
    ///
    /// Returns the new list only when it differs from the last published one.
    pub fn resolve<'a, I>(&mut self, states: I) -> Option<&[PresenceRecord]>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut peers: Vec<PresenceRecord> = Vec::new();
        for record in states.into_iter().filter_map(PresenceRecord::from_state) {
            match peers.iter_mut().find(|p| p.id == record.id) {
                Some(existing) => {
                    if existing.avatar_url.is_none() && record.avatar_url.is_some() {
                        *existing = record;
                    }
                }
                None => peers.push(record),
            }
        }

        if let Some(local) = &self.local {
            if !peers.iter().any(|p| p.id == local.id) {
                peers.push(local.presence());
            }
        }

        peers.sort_by(|a, b| a.id.cmp(&b.id));
        let signature = signature_of(&peers);
        if self.signature.as_deref() == Some(signature.as_str()) {
            return None;
        }

        self.signature = Some(signature);
        self.peers = peers;
        Some(&self.peers)
    }

    pub fn peers(&self) -> &[PresenceRecord] {
        &self.peers
    }

    pub fn reset(&mut self) {
        self.signature = None;
        self.peers.clear();
    }
}

/// Stable fingerprint of a sorted peer list.
fn signature_of(peers: &[PresenceRecord]) -> String {
    peers
        .iter()
        .map(|p| {
            format!(
                "{}:{}:{}:{}",
                p.id,
                p.name,
                p.color,
                p.avatar_url.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("|")
}

// ===================================================================
// Tests
// ===================================================================
