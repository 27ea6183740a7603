//! Two-way reconciliation between the shared document and the local store.
//!
//! ```text
//!            observe_nodes / observe_edges
//!  SharedDocument ─────────────────────────────► CanvasStore::set_*
//!        ▲              (installed Arc recorded)       │
//!        │                                             │ listener(state, prev)
//!        │  replace_* (one txn per collection)         ▼
//!        └──────────── flush() ◄── scheduler ◄── dirty_tx (identity changed,
//!                                                        not the recorded Arc)
//! ```
//!
//! Echo is broken by identity: the bridge remembers the exact `Arc` it
//! installed in the store, and the store listener ignores a change whose
//! array is that `Arc`. Host edits always install a different `Arc`, so they
//! are marked dirty even when they race a remote apply on another thread.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use yrs::Subscription;

use crate::document::{Collection, SharedDocument};
use crate::error::CollabError;
use crate::record::{EdgeRecord, NodeRecord};
use crate::store::{CanvasState, CanvasStore, StoreSubscription};

/// Arrays most recently written into the store on behalf of the document.
#[derive(Default)]
struct Applied {
    nodes: Mutex<Option<Arc<Vec<NodeRecord>>>>,
    edges: Mutex<Option<Arc<Vec<EdgeRecord>>>>,
}

fn is_same<T>(slot: &Mutex<Option<Arc<T>>>, current: &Arc<T>) -> bool {
    let slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.as_ref().is_some_and(|applied| Arc::ptr_eq(applied, current))
}

fn remember<T>(slot: &Mutex<Option<Arc<T>>>, applied: Arc<T>) {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(applied);
}

impl Applied {
    /// Whether `state` differs from `previous` in `collection` because of a
    /// host edit rather than a document write.
    fn is_local_change(&self, collection: Collection, state: &CanvasState, previous: &CanvasState) -> bool {
        match collection {
            Collection::Nodes => {
                !Arc::ptr_eq(&state.nodes, &previous.nodes) && !is_same(&self.nodes, &state.nodes)
            }
            Collection::Edges => {
                !Arc::ptr_eq(&state.edges, &previous.edges) && !is_same(&self.edges, &state.edges)
            }
        }
    }
}

fn apply_nodes(store: &dyn CanvasStore, applied: &Applied, nodes: Vec<NodeRecord>) {
    if store.get_state().nodes.as_slice() == nodes.as_slice() {
        return;
    }
    let nodes = Arc::new(nodes);
    // Recorded before the write: the listener runs inside `set_nodes`.
    remember(&applied.nodes, nodes.clone());
    store.set_nodes(nodes);
}

fn apply_edges(store: &dyn CanvasStore, applied: &Applied, edges: Vec<EdgeRecord>) {
    if store.get_state().edges.as_slice() == edges.as_slice() {
        return;
    }
    let edges = Arc::new(edges);
    remember(&applied.edges, edges.clone());
    store.set_edges(edges);
}

struct Subscriptions {
    _store: StoreSubscription,
    _nodes: Subscription,
    _edges: Subscription,
}

pub struct ReconciliationBridge {
    doc: SharedDocument,
    store: Arc<dyn CanvasStore>,
    subscriptions: Option<Subscriptions>,
}

impl ReconciliationBridge {
    /// Wire `doc` and `store` together.
    ///
    /// Registers the document observers, seeds empty document collections
    /// from the store, pulls a non-empty document into the store, and finally
    /// starts watching the store. Local changes are reported on `dirty_tx`;
    /// the owner debounces them and calls [`flush`](Self::flush).
    pub fn attach(
        doc: SharedDocument,
        store: Arc<dyn CanvasStore>,
        dirty_tx: mpsc::UnboundedSender<Collection>,
    ) -> Result<Self, CollabError> {
        let applied = Arc::new(Applied::default());

        let nodes_sub = {
            let store = store.clone();
            let applied = applied.clone();
            doc.observe_nodes(move |nodes| apply_nodes(store.as_ref(), &applied, nodes))
        };
        let edges_sub = {
            let store = store.clone();
            let applied = applied.clone();
            doc.observe_edges(move |edges| apply_edges(store.as_ref(), &applied, edges))
        };

        let seeded = doc.seed_if_empty(&store.get_state().snapshot())?;
        if seeded.nodes || seeded.edges {
            log::info!(
                "Seeded shared document from local canvas (nodes: {}, edges: {})",
                seeded.nodes,
                seeded.edges
            );
        }

        if doc.len(Collection::Nodes) > 0 {
            apply_nodes(store.as_ref(), &applied, doc.nodes());
        }
        if doc.len(Collection::Edges) > 0 {
            apply_edges(store.as_ref(), &applied, doc.edges());
        }

        let store_sub = store.subscribe(Arc::new(move |state: &CanvasState, previous: &CanvasState| {
            for collection in [Collection::Nodes, Collection::Edges] {
                if applied.is_local_change(collection, state, previous) {
                    let _ = dirty_tx.send(collection);
                }
            }
        }));

        Ok(Self {
            doc,
            store,
            subscriptions: Some(Subscriptions {
                _store: store_sub,
                _nodes: nodes_sub,
                _edges: edges_sub,
            }),
        })
    }

    /// Write the store's current arrays into the document, one transaction
    /// per dirty collection.
    pub fn flush(&self, dirty: &[Collection]) -> Result<(), CollabError> {
        if self.subscriptions.is_none() || dirty.is_empty() {
            return Ok(());
        }
        let state = self.store.get_state();
        for collection in dirty {
            match collection {
                Collection::Nodes => self.doc.replace_nodes(&state.nodes)?,
                Collection::Edges => self.doc.replace_edges(&state.edges)?,
            }
            log::trace!("Flushed local {} into shared document", collection.name());
        }
        Ok(())
    }

    /// Release the store listener and the document observers. Idempotent.
    pub fn detach(&mut self) {
        if self.subscriptions.take().is_some() {
            log::debug!("Reconciliation bridge detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscriptions.is_some()
    }
}

impl Drop for ReconciliationBridge {
    fn drop(&mut self) {
        self.detach();
    }
}
