//! Item identity and lifecycle status.
//!
//! An item is a node or a property of the hierarchical content tree. Node
//! identity is a stable UUID; property identity is the owning node plus the
//! property name.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in the content tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Allocate a fresh node identity
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the canonical hyphenated form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a property: the owning node plus the property name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId {
    /// Node the property is attached to
    pub parent: NodeId,
    /// Property name, unique within the parent
    pub name: String,
}

impl PropertyId {
    /// Create a property identifier
    pub fn new(parent: NodeId, name: impl Into<String>) -> Self {
        Self {
            parent,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PropertyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.parent, self.name)
    }
}

/// Identity of any item, distinguishing node from property identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemId {
    Node(NodeId),
    Property(PropertyId),
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemId::Node(id) => write!(f, "node {}", id),
            ItemId::Property(id) => write!(f, "property {}", id),
        }
    }
}

impl From<NodeId> for ItemId {
    fn from(id: NodeId) -> Self {
        ItemId::Node(id)
    }
}

impl From<PropertyId> for ItemId {
    fn from(id: PropertyId) -> Self {
        ItemId::Property(id)
    }
}

/// Identifier of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocate a fresh session identity
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Created in this session; no persistent counterpart yet
    New,
    /// Clean copy of the persistent record
    Existing,
    /// Modified in this session, not yet committed
    ExistingModified,
    /// The persistent base changed under this overlay
    Stale,
    /// Detached from tracking (committed or discarded)
    Disconnected,
}
