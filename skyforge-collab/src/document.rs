//! Shared replicated document: two ordered collections backed by Yrs arrays.
//!
//! ```text
//! Doc
//!  ├── "nodes": YArray<String>   (JSON-encoded NodeRecord)
//!  └── "edges": YArray<String>   (JSON-encoded EdgeRecord)
//! ```
//!
//! Merge semantics belong entirely to Yrs: inserts and deletes commute, and
//! re-applying an update that was already integrated is a no-op. This module
//! only encodes records, wraps transactions and exposes the update stream the
//! transport ships to other replicas.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, chapter 5

use std::sync::{Arc, Mutex, MutexGuard};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, DeepObservable, Doc, Origin, Out, ReadTxn, StateVector, Subscription,
    Transact, Update,
};

use crate::error::CollabError;
use crate::record::{CanvasSnapshot, EdgeRecord, NodeRecord, Record};

/// Origin tag for transactions that integrate updates from other replicas.
const REMOTE_ORIGIN: &str = "skyforge-remote";

/// The two replicated collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Nodes,
    Edges,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Nodes => NodeRecord::COLLECTION,
            Collection::Edges => EdgeRecord::COLLECTION,
        }
    }
}

/// Which collections a [`SharedDocument::seed_if_empty`] call populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Seeded {
    pub nodes: bool,
    pub edges: bool,
}

/// Handle to one room's replicated document.
///
/// Cloning is cheap and every clone refers to the same replica. Yrs
/// transactions on one document must not overlap, so every entry point takes
/// `gate` for the lifetime of its transaction. Observer callbacks run inside
/// that window and must not call back into the document.
#[derive(Clone)]
pub struct SharedDocument {
    doc: Doc,
    nodes: ArrayRef,
    edges: ArrayRef,
    gate: Arc<Mutex<()>>,
}

impl SharedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let nodes = doc.get_or_insert_array(NodeRecord::COLLECTION);
        let edges = doc.get_or_insert_array(EdgeRecord::COLLECTION);
        Self {
            doc,
            nodes,
            edges,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Yrs client id of this replica, also used as its awareness id.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // A panicking observer poisons the gate; the document itself is still
        // consistent because Yrs commits or discards whole transactions.
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn array(&self, collection: Collection) -> &ArrayRef {
        match collection {
            Collection::Nodes => &self.nodes,
            Collection::Edges => &self.edges,
        }
    }

    // ── Collection operations ────────────────────────────────────

    pub fn insert_nodes(&self, index: u32, records: &[NodeRecord]) -> Result<(), CollabError> {
        self.insert(Collection::Nodes, index, records)
    }

    pub fn delete_nodes(&self, start: u32, count: u32) -> Result<(), CollabError> {
        self.delete(Collection::Nodes, start, count)
    }

    pub fn insert_edges(&self, index: u32, records: &[EdgeRecord]) -> Result<(), CollabError> {
        self.insert(Collection::Edges, index, records)
    }

    pub fn delete_edges(&self, start: u32, count: u32) -> Result<(), CollabError> {
        self.delete(Collection::Edges, start, count)
    }

    /// Current node sequence (malformed entries are skipped).
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let _gate = self.lock();
        let txn = self.doc.transact();
        read_records(&self.nodes, &txn)
    }

    /// Current edge sequence (malformed entries are skipped).
    pub fn edges(&self) -> Vec<EdgeRecord> {
        let _gate = self.lock();
        let txn = self.doc.transact();
        read_records(&self.edges, &txn)
    }

    pub fn len(&self, collection: Collection) -> u32 {
        let _gate = self.lock();
        let txn = self.doc.transact();
        self.array(collection).len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len(Collection::Nodes) == 0 && self.len(Collection::Edges) == 0
    }

    /// Replace the whole node sequence in a single transaction.
    pub fn replace_nodes(&self, records: &[NodeRecord]) -> Result<(), CollabError> {
        self.replace(Collection::Nodes, records)
    }

    /// Replace the whole edge sequence in a single transaction.
    pub fn replace_edges(&self, records: &[EdgeRecord]) -> Result<(), CollabError> {
        self.replace(Collection::Edges, records)
    }

    /// Push the local snapshot into collections that are still empty.
    ///
    /// Collections that already hold content are left alone, so a late
    /// joiner cannot clobber what other peers wrote.
    pub fn seed_if_empty(&self, snapshot: &CanvasSnapshot) -> Result<Seeded, CollabError> {
        let nodes = encode_records(&snapshot.nodes)?;
        let edges = encode_records(&snapshot.edges)?;

        let _gate = self.lock();
        let mut txn = self.doc.transact_mut();
        let mut seeded = Seeded::default();
        if self.nodes.len(&txn) == 0 && !nodes.is_empty() {
            self.nodes.insert_range(&mut txn, 0, nodes);
            seeded.nodes = true;
        }
        if self.edges.len(&txn) == 0 && !edges.is_empty() {
            self.edges.insert_range(&mut txn, 0, edges);
            seeded.edges = true;
        }
        Ok(seeded)
    }

    fn insert<R: Record>(
        &self,
        collection: Collection,
        index: u32,
        records: &[R],
    ) -> Result<(), CollabError> {
        let encoded = encode_records(records)?;
        let array = self.array(collection);

        let _gate = self.lock();
        let mut txn = self.doc.transact_mut();
        let len = array.len(&txn);
        if index > len {
            return Err(CollabError::Document(format!(
                "insert at {index} past end of {} (len {len})",
                collection.name()
            )));
        }
        array.insert_range(&mut txn, index, encoded);
        Ok(())
    }

    fn delete(&self, collection: Collection, start: u32, count: u32) -> Result<(), CollabError> {
        let array = self.array(collection);

        let _gate = self.lock();
        let mut txn = self.doc.transact_mut();
        let len = array.len(&txn);
        if start.saturating_add(count) > len {
            return Err(CollabError::Document(format!(
                "delete {start}..{} out of range for {} (len {len})",
                start.saturating_add(count),
                collection.name()
            )));
        }
        if count > 0 {
            array.remove_range(&mut txn, start, count);
        }
        Ok(())
    }

    fn replace<R: Record>(&self, collection: Collection, records: &[R]) -> Result<(), CollabError> {
        let encoded = encode_records(records)?;
        let array = self.array(collection);

        let _gate = self.lock();
        let mut txn = self.doc.transact_mut();
        let len = array.len(&txn);
        if len > 0 {
            array.remove_range(&mut txn, 0, len);
        }
        array.insert_range(&mut txn, 0, encoded);
        Ok(())
    }

    // ── Observation ──────────────────────────────────────────────

    /// Fires after every local or remote transaction touching the nodes.
    pub fn observe_nodes<F>(&self, f: F) -> Subscription
    where
        F: Fn(Vec<NodeRecord>) + Send + Sync + 'static,
    {
        let array = self.nodes.clone();
        self.nodes
            .observe_deep(move |txn, _events| f(read_records(&array, txn)))
    }

    /// Fires after every local or remote transaction touching the edges.
    pub fn observe_edges<F>(&self, f: F) -> Subscription
    where
        F: Fn(Vec<EdgeRecord>) + Send + Sync + 'static,
    {
        let array = self.edges.clone();
        self.edges
            .observe_deep(move |txn, _events| f(read_records(&array, txn)))
    }

    /// Encoded v1 update of every transaction that did not come from a peer.
    pub fn observe_local_updates<F>(&self, f: F) -> Result<Subscription, CollabError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                f(event.update.clone());
            })
            .map_err(|e| CollabError::Document(e.to_string()))
    }

    // ── Replication ──────────────────────────────────────────────

    pub fn state_vector(&self) -> Vec<u8> {
        let _gate = self.lock();
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the owner of `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let remote_sv = StateVector::decode_v1(state_vector)
            .map_err(|e| CollabError::MalformedUpdate(e.to_string()))?;
        let _gate = self.lock();
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    pub fn full_state(&self) -> Vec<u8> {
        let _gate = self.lock();
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Integrate an update received from another replica.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), CollabError> {
        let update =
            Update::decode_v1(update).map_err(|e| CollabError::MalformedUpdate(e.to_string()))?;
        let _gate = self.lock();
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| CollabError::MalformedUpdate(e.to_string()))?;
        Ok(())
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_records<R: Record>(records: &[R]) -> Result<Vec<String>, CollabError> {
    records.iter().map(Record::to_json).collect()
}

fn read_records<R: Record, T: ReadTxn>(array: &ArrayRef, txn: &T) -> Vec<R> {
    array
        .iter(txn)
        .enumerate()
        .filter_map(|(index, value)| match decode_entry::<R>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping {} entry {index}: {e}", R::COLLECTION);
                None
            }
        })
        .collect()
}

fn decode_entry<R: Record>(value: Out) -> Result<R, CollabError> {
    match value {
        Out::Any(Any::String(raw)) => R::from_json(&raw),
        _ => Err(CollabError::MalformedRemoteSnapshot(
            "expected a JSON string element".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(id: &str) -> NodeRecord {
        NodeRecord::new(id, 0.0, 0.0)
    }

    fn ids(nodes: &[NodeRecord]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_insert_and_read_back() {
        let doc = SharedDocument::new();
        doc.insert_nodes(0, &[node("n1"), node("n3")]).unwrap();
        doc.insert_nodes(1, &[node("n2")]).unwrap();

        assert_eq!(ids(&doc.nodes()), vec!["n1", "n2", "n3"]);
        assert_eq!(doc.len(Collection::Nodes), 3);
        assert!(doc.edges().is_empty());
    }

    #[test]
    fn test_delete_range() {
        let doc = SharedDocument::new();
        doc.insert_nodes(0, &[node("a"), node("b"), node("c"), node("d")]).unwrap();
        doc.delete_nodes(1, 2).unwrap();
        assert_eq!(ids(&doc.nodes()), vec!["a", "d"]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let doc = SharedDocument::new();
        doc.insert_edges(0, &[EdgeRecord::new("e1", "a", "b")]).unwrap();
        assert!(doc.insert_edges(5, &[EdgeRecord::new("e2", "a", "b")]).is_err());
        assert!(doc.delete_edges(0, 2).is_err());
        assert_eq!(doc.edges().len(), 1);
    }

    #[test]
    fn test_replace_is_single_transaction() {
        let doc = SharedDocument::new();
        doc.insert_nodes(0, &[node("old1"), node("old2")]).unwrap();

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let _sub = doc
            .observe_local_updates(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        doc.replace_nodes(&[node("new1"), node("new2"), node("new3")]).unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(ids(&doc.nodes()), vec!["new1", "new2", "new3"]);
    }

    #[test]
    fn test_seed_only_fills_empty_collections() {
        let doc = SharedDocument::new();
        doc.insert_nodes(0, &[node("existing")]).unwrap();

        let snapshot = CanvasSnapshot::new(
            vec![node("stale")],
            vec![EdgeRecord::new("e1", "existing", "stale")],
        );
        let seeded = doc.seed_if_empty(&snapshot).unwrap();

        assert_eq!(seeded, Seeded { nodes: false, edges: true });
        assert_eq!(ids(&doc.nodes()), vec!["existing"]);
        assert_eq!(doc.edges().len(), 1);

        // A second seed attempt is a no-op.
        assert_eq!(doc.seed_if_empty(&snapshot).unwrap(), Seeded::default());
        assert_eq!(doc.edges().len(), 1);
    }

    #[test]
    fn test_observer_sees_remote_changes() {
        let a = SharedDocument::new();
        let b = SharedDocument::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = b.observe_nodes(move |nodes| {
            sink.lock().unwrap().push(nodes.len());
        });

        a.insert_nodes(0, &[node("n1"), node("n2")]).unwrap();
        b.apply_remote_update(&a.full_state()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2]);
        assert_eq!(ids(&b.nodes()), vec!["n1", "n2"]);
    }

    #[test]
    fn test_remote_updates_not_reported_as_local() {
        let a = SharedDocument::new();
        let b = SharedDocument::new();

        let local = Arc::new(AtomicUsize::new(0));
        let counter = local.clone();
        let _sub = b
            .observe_local_updates(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        a.insert_nodes(0, &[node("n1")]).unwrap();
        b.apply_remote_update(&a.full_state()).unwrap();
        assert_eq!(local.load(Ordering::SeqCst), 0);

        b.insert_nodes(1, &[node("n2")]).unwrap();
        assert_eq!(local.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_diff_since_carries_missing_state() {
        let a = SharedDocument::new();
        let b = SharedDocument::new();
        a.insert_nodes(0, &[node("n1")]).unwrap();
        b.apply_remote_update(&a.full_state()).unwrap();

        a.insert_nodes(1, &[node("n2")]).unwrap();
        let diff = a.diff_since(&b.state_vector()).unwrap();
        b.apply_remote_update(&diff).unwrap();

        assert_eq!(ids(&b.nodes()), vec!["n1", "n2"]);
    }

    #[test]
    fn test_duplicate_update_is_noop() {
        let a = SharedDocument::new();
        let b = SharedDocument::new();
        a.insert_nodes(0, &[node("n1"), node("n2")]).unwrap();
        let update = a.full_state();

        b.apply_remote_update(&update).unwrap();
        b.apply_remote_update(&update).unwrap();
        assert_eq!(ids(&b.nodes()), vec!["n1", "n2"]);
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = SharedDocument::new();
        assert!(matches!(
            doc.apply_remote_update(&[0xFF, 0xFE, 0xFD, 0xFC]),
            Err(CollabError::MalformedUpdate(_))
        ));
        assert!(doc.diff_since(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let doc = SharedDocument::new();
        doc.insert_nodes(0, &[node("good")]).unwrap();
        {
            let mut txn = doc.doc.transact_mut();
            doc.nodes.insert(&mut txn, 1, "{\"not\": \"a node\"}");
            doc.nodes.insert(&mut txn, 2, 42.0);
        }
        assert_eq!(doc.len(Collection::Nodes), 3);
        assert_eq!(ids(&doc.nodes()), vec!["good"]);
    }
}
