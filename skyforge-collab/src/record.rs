//! Node and edge records exchanged between the canvas and the shared document.
//!
//! The engine only looks at identifiers and endpoints. Everything else
//! (table names, columns, styling) rides along as opaque JSON, and fields
//! this crate does not know about are preserved through `extra`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CollabError;

/// Canvas coordinates of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A table on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind: None,
            position: Position::new(x, y),
            data: Value::Null,
            extra: Map::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// A relationship between two tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub style: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EdgeRecord {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            kind: None,
            style: Value::Null,
            extra: Map::new(),
        }
    }

    pub fn with_handles(
        mut self,
        source_handle: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        self.source_handle = Some(source_handle.into());
        self.target_handle = Some(target_handle.into());
        self
    }

    pub fn with_style(mut self, style: Value) -> Self {
        self.style = style;
        self
    }
}

/// A record that can live in one of the document's collections.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the shared array holding this record type.
    const COLLECTION: &'static str;

    fn id(&self) -> &str;

    /// Structural checks applied to records decoded from remote state.
    fn validate(&self) -> Result<(), CollabError> {
        if self.id().is_empty() {
            return Err(CollabError::MalformedRemoteSnapshot(format!(
                "{} record without id",
                Self::COLLECTION
            )));
        }
        Ok(())
    }

    /// Encode for storage in the shared document. The JSON text is also
    /// what gives every stored element its own deep copy.
    fn to_json(&self) -> Result<String, CollabError> {
        serde_json::to_string(self).map_err(|e| CollabError::Document(e.to_string()))
    }

    /// Decode and validate an element read back from the shared document.
    fn from_json(raw: &str) -> Result<Self, CollabError> {
        let record: Self = serde_json::from_str(raw)?;
        record.validate()?;
        Ok(record)
    }
}

impl Record for NodeRecord {
    const COLLECTION: &'static str = "nodes";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for EdgeRecord {
    const COLLECTION: &'static str = "edges";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), CollabError> {
        if self.id.is_empty() || self.source.is_empty() || self.target.is_empty() {
            return Err(CollabError::MalformedRemoteSnapshot(format!(
                "edge '{}' is missing an id or endpoint",
                self.id
            )));
        }
        Ok(())
    }
}

/// The `{nodes, edges}` pair the designer persists and loads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl CanvasSnapshot {
    pub fn new(nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>) -> Self {
        Self { nodes, edges }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_preserves_unknown_fields() {
        let raw = json!({
            "id": "n1",
            "type": "tableNode",
            "position": { "x": 10.0, "y": 20.0 },
            "data": { "name": "users", "columns": [] },
            "width": 240,
            "selected": true
        })
        .to_string();

        let node = NodeRecord::from_json(&raw).unwrap();
        assert_eq!(node.id, "n1");
        assert_eq!(node.kind.as_deref(), Some("tableNode"));
        assert_eq!(node.position, Position::new(10.0, 20.0));
        assert_eq!(node.extra.get("width"), Some(&json!(240)));

        let back: Value = serde_json::from_str(&node.to_json().unwrap()).unwrap();
        assert_eq!(back["selected"], json!(true));
        assert_eq!(back["data"]["name"], json!("users"));
    }

    #[test]
    fn test_edge_camel_case_handles() {
        let edge = EdgeRecord::new("e1", "n1", "n2").with_handles("n1-id-out", "n2-user_id-in");
        let value: Value = serde_json::from_str(&edge.to_json().unwrap()).unwrap();
        assert_eq!(value["sourceHandle"], json!("n1-id-out"));
        assert_eq!(value["targetHandle"], json!("n2-user_id-in"));
        assert!(value.get("style").is_none());
    }

    #[test]
    fn test_node_without_id_rejected() {
        let raw = json!({ "id": "", "position": { "x": 0.0, "y": 0.0 } }).to_string();
        assert!(matches!(
            NodeRecord::from_json(&raw),
            Err(CollabError::MalformedRemoteSnapshot(_))
        ));
    }

    #[test]
    fn test_edge_without_target_rejected() {
        let raw = json!({ "id": "e1", "source": "n1", "target": "" }).to_string();
        assert!(EdgeRecord::from_json(&raw).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(NodeRecord::from_json("not json").is_err());
        assert!(EdgeRecord::from_json("{\"id\": 5}").is_err());
    }

    #[test]
    fn test_snapshot_defaults_missing_collections() {
        let snapshot: CanvasSnapshot = serde_json::from_value(json!({ "nodes": [] })).unwrap();
        assert!(snapshot.is_empty());
    }
}
