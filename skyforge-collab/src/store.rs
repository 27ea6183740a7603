//! Local state container the canvas renders from.
//!
//! The engine never owns the canvas state. It talks to whatever container the
//! host injects through [`CanvasStore`]: read the current arrays, replace one
//! of them, and get told whenever either changes. Changes are detected by
//! identity: every write installs a fresh `Arc`, and `set_nodes` / `set_edges`
//! install exactly the `Arc` they are given.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::CollabError;
use crate::record::{CanvasSnapshot, EdgeRecord, NodeRecord, Position};

/// Immutable view of the canvas at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CanvasState {
    pub nodes: Arc<Vec<NodeRecord>>,
    pub edges: Arc<Vec<EdgeRecord>>,
}

impl CanvasState {
    pub fn new(nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>) -> Self {
        Self {
            nodes: Arc::new(nodes),
            edges: Arc::new(edges),
        }
    }

    pub fn snapshot(&self) -> CanvasSnapshot {
        CanvasSnapshot::new(self.nodes.to_vec(), self.edges.to_vec())
    }
}

/// Called with `(state, previous)` after every change.
pub type StoreListener = Arc<dyn Fn(&CanvasState, &CanvasState) + Send + Sync>;

/// Contract between the engine and the host's state container.
pub trait CanvasStore: Send + Sync {
    fn get_state(&self) -> CanvasState;

    /// Register a listener. It stays registered until the returned handle is
    /// dropped.
    fn subscribe(&self, listener: StoreListener) -> StoreSubscription;

    /// Install `nodes` as the current node array, keeping its identity.
    fn set_nodes(&self, nodes: Arc<Vec<NodeRecord>>);

    fn set_edges(&self, edges: Arc<Vec<EdgeRecord>>);
}

/// Unsubscribes its listener when dropped.
pub struct StoreSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StoreSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// MemoryStore
// ───────────────────────────────────────────────────────────────────

struct Inner {
    state: CanvasState,
    listeners: HashMap<u64, StoreListener>,
}

/// In-process [`CanvasStore`] with the designer's canvas operations.
///
/// Listeners are invoked after the lock is released, so they may read or
/// write the store again.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_listener: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_state(CanvasState::default())
    }

    pub fn with_state(state: CanvasState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state,
                listeners: HashMap::new(),
            })),
            next_listener: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `change` to the current state and notify listeners if it
    /// produced a new state.
    fn update<F>(&self, change: F)
    where
        F: FnOnce(&CanvasState) -> Option<CanvasState>,
    {
        let (state, previous, listeners) = {
            let mut inner = self.lock();
            let Some(next) = change(&inner.state) else {
                return;
            };
            let previous = std::mem::replace(&mut inner.state, next);
            let listeners: Vec<StoreListener> = inner.listeners.values().cloned().collect();
            (inner.state.clone(), previous, listeners)
        };

        for listener in listeners {
            listener(&state, &previous);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    // ── Canvas operations ────────────────────────────────────────

    pub fn add_node(&self, node: NodeRecord) {
        self.update(|state| {
            let mut nodes = state.nodes.to_vec();
            nodes.push(node);
            Some(CanvasState {
                nodes: Arc::new(nodes),
                edges: state.edges.clone(),
            })
        });
    }

    /// Move a node. Unknown ids are ignored.
    pub fn update_node_position(&self, id: &str, position: Position) {
        self.update(|state| {
            let index = state.nodes.iter().position(|n| n.id == id)?;
            let mut nodes = state.nodes.to_vec();
            nodes[index].position = position;
            Some(CanvasState {
                nodes: Arc::new(nodes),
                edges: state.edges.clone(),
            })
        });
    }

    /// Remove a node together with every edge attached to it.
    pub fn delete_node(&self, id: &str) {
        self.update(|state| {
            if !state.nodes.iter().any(|n| n.id == id) {
                return None;
            }
            let nodes: Vec<NodeRecord> = state.nodes.iter().filter(|n| n.id != id).cloned().collect();
            let attached = state.edges.iter().any(|e| e.source == id || e.target == id);
            let edges = if attached {
                Arc::new(
                    state
                        .edges
                        .iter()
                        .filter(|e| e.source != id && e.target != id)
                        .cloned()
                        .collect(),
                )
            } else {
                state.edges.clone()
            };
            Some(CanvasState {
                nodes: Arc::new(nodes),
                edges,
            })
        });
    }

    pub fn add_edge(&self, edge: EdgeRecord) {
        self.update(|state| {
            let mut edges = state.edges.to_vec();
            edges.push(edge);
            Some(CanvasState {
                nodes: state.nodes.clone(),
                edges: Arc::new(edges),
            })
        });
    }

    /// Replace the whole canvas with a `{nodes, edges}` JSON document.
    pub fn load_from_data(&self, data: &str) -> Result<(), CollabError> {
        let snapshot: CanvasSnapshot = serde_json::from_str(data)?;
        self.update(|_| Some(CanvasState::new(snapshot.nodes, snapshot.edges)));
        Ok(())
    }

    /// The canvas as the `{nodes, edges}` JSON document the designer saves.
    pub fn export_to_data(&self) -> Result<String, CollabError> {
        serde_json::to_string(&self.get_state().snapshot())
            .map_err(|e| CollabError::Document(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasStore for MemoryStore {
    fn get_state(&self) -> CanvasState {
        self.lock().state.clone()
    }

    fn subscribe(&self, listener: StoreListener) -> StoreSubscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.lock().listeners.insert(id, listener);

        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        StoreSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                inner.listeners.remove(&id);
            }
        })
    }

    fn set_nodes(&self, nodes: Arc<Vec<NodeRecord>>) {
        self.update(|state| {
            Some(CanvasState {
                nodes,
                edges: state.edges.clone(),
            })
        });
    }

    fn set_edges(&self, edges: Arc<Vec<EdgeRecord>>) {
        self.update(|state| {
            Some(CanvasState {
                nodes: state.nodes.clone(),
                edges,
            })
        });
    }
}
