//! [crate::properties] contains the persisted building blocks of a vault graph: [Node]s, the
//! [Edge]s derived between them, and the raw [Reference]s edges are derived from.
use chrono::{DateTime, Utc};
pub use enumset::EnumSet;
use enumset::EnumSetType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::error::VaultError;

/// Relationship every template must declare. Untyped cross-references between entity types
/// without a declared default land here.
pub const RELATED: &str = "related";

/// The canon workflow. `Draft -> Pending -> Canon` is the main line, `NonCanon` and `Archived`
/// are side states consumers use to discount a node.
#[derive(Debug, Default, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(serialize_repr = "list")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Draft,
    Pending,
    Canon,
    NonCanon,
    Archived,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Draft => "draft",
            NodeStatus::Pending => "pending",
            NodeStatus::Canon => "canon",
            NodeStatus::NonCanon => "non_canon",
            NodeStatus::Archived => "archived",
        }
    }
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(NodeStatus::Draft),
            "pending" => Ok(NodeStatus::Pending),
            "canon" => Ok(NodeStatus::Canon),
            "non_canon" => Ok(NodeStatus::NonCanon),
            "archived" => Ok(NodeStatus::Archived),
            other => Err(VaultError::Serialization(format!(
                "unknown node status '{other}', expected one of draft, pending, canon, non_canon, archived"
            ))),
        }
    }
}

/// A validated, persisted document of a known entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub entity_type: String,
    pub status: NodeStatus,
    pub title: String,
    /// Vault-relative source path, `/` separated
    pub path: String,
    pub body: String,
    /// Normalized field values produced by the entity type's validator
    pub fields: Map<String, Value>,
    /// Template the node was validated under
    pub template_id: String,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Hash of everything persisted for this node except the timestamp. Two upserts carrying the
    /// same hash are the same write.
    pub fn compute_hash(&self) -> String {
        let content = serde_json::json!([
            self.id,
            self.entity_type,
            self.status.as_str(),
            self.title,
            self.path,
            self.body,
            self.fields,
            self.template_id,
        ]);
        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            entity_type: self.entity_type.clone(),
            status: self.status,
            title: self.title.clone(),
            path: self.path.clone(),
            updated_at: self.updated_at,
        }
    }
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, VaultError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| VaultError::Serialization(format!("timestamp out of range: {micros}")))
}

impl FromRow<'_, SqliteRow> for Node {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status_str: &str = row.try_get("status")?;
        let fields_str: &str = row.try_get("fields")?;
        let fields = match serde_json::from_str::<Value>(fields_str).map_err(VaultError::from)? {
            Value::Object(map) => map,
            other => {
                return Err(VaultError::Serialization(format!(
                    "node fields must be a JSON object, found {other}"
                ))
                .into())
            }
        };
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(Node {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            status: NodeStatus::from_str(status_str)?,
            title: row.try_get("title")?,
            path: row.try_get("path")?,
            body: row.try_get("body")?,
            fields,
            template_id: row.try_get("template_id")?,
            content_hash: row.try_get("content_hash")?,
            updated_at: micros_to_datetime(updated_at)?,
        })
    }
}

/// The listing/search view of a [Node] (no body or fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub entity_type: String,
    pub status: NodeStatus,
    pub title: String,
    pub path: String,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for NodeSummary {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status_str: &str = row.try_get("status")?;
        let updated_at: i64 = row.try_get("updated_at")?;
        Ok(NodeSummary {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            status: NodeStatus::from_str(status_str)?,
            title: row.try_get("title")?,
            path: row.try_get("path")?,
            updated_at: micros_to_datetime(updated_at)?,
        })
    }
}

/// A directed, typed relationship between two nodes.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::FromRow,
)]
pub struct Edge {
    pub source_id: String,
    pub relationship_id: String,
    pub target_id: String,
}

impl Edge {
    pub fn new<S: Into<String>, R: Into<String>, T: Into<String>>(
        source_id: S,
        relationship_id: R,
        target_id: T,
    ) -> Self {
        Edge {
            source_id: source_id.into(),
            relationship_id: relationship_id.into(),
            target_id: target_id.into(),
        }
    }
}

impl Display for Edge {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.source_id, self.relationship_id, self.target_id
        )
    }
}

/// A resolved cross-reference held by a source document. Edges are derived from these; a
/// reference whose target is not indexed yet stays pending until the target appears.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub source_id: String,
    pub target_id: String,
    /// Explicit relationship requested by the document, `None` for plain links
    pub relationship: Option<String>,
}

impl Reference {
    pub fn new<S: Into<String>, T: Into<String>>(
        source_id: S,
        target_id: T,
        relationship: Option<String>,
    ) -> Self {
        Reference {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship,
        }
    }

    /// Column value used in `node_refs.relationship_id`; untyped references are stored as ''.
    pub fn relationship_column(&self) -> &str {
        self.relationship.as_deref().unwrap_or("")
    }
}

impl FromRow<'_, SqliteRow> for Reference {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let relationship: String = row.try_get("relationship_id")?;
        Ok(Reference {
            source_id: row.try_get("source_id")?,
            target_id: row.try_get("target_id")?,
            relationship: if relationship.is_empty() {
                None
            } else {
                Some(relationship)
            },
        })
    }
}
