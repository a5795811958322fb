//! Item state record shapes.
//!
//! Copy-on-write without inheritance: the persisted record and the
//! transient record share the same read-only snapshot shape. A transient
//! record holds a non-owning back-reference to its persisted counterpart
//! plus the persistent version it was derived from; that version is the
//! staleness check at commit time.

use crate::item::{ItemStatus, NodeId, PropertyId, SessionId};
use crate::value::{InternalValue, PropertyType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// Identifier of the definition a property was created under
pub type DefinitionId = String;

/// Residual definition id applied when a node pins nothing for a name
pub const RESIDUAL_DEFINITION: &str = "*";

/// Static definition a property is bound to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub id: DefinitionId,
    /// Required type; `Undefined` adopts the supplied values' type
    pub required_type: PropertyType,
    /// Pinned single/array shape; `None` for residual definitions
    pub multiple: Option<bool>,
    /// Protected properties reject session writes entirely
    pub protected: bool,
}

impl PropertyDefinition {
    /// Definition applied to names a node does not pin
    pub fn residual() -> Self {
        Self {
            id: RESIDUAL_DEFINITION.to_string(),
            required_type: PropertyType::Undefined,
            multiple: None,
            protected: false,
        }
    }

    /// Definition pinning a required type and shape
    pub fn typed(id: impl Into<String>, required_type: PropertyType, multiple: bool) -> Self {
        Self {
            id: id.into(),
            required_type,
            multiple: Some(multiple),
            protected: false,
        }
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }
}

/// Read-only snapshot of a property's persisted attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub id: PropertyId,
    pub definition_id: DefinitionId,
    /// Concrete type at rest; never `Undefined` once values are stored
    pub prop_type: PropertyType,
    /// Agrees with the stored arity: single vs array shape
    pub multi_valued: bool,
    pub values: Vec<InternalValue>,
}

impl PropertySnapshot {
    /// Empty single-valued snapshot for a freshly created property
    pub fn empty(id: PropertyId) -> Self {
        Self {
            id,
            definition_id: RESIDUAL_DEFINITION.to_string(),
            prop_type: PropertyType::String,
            multi_valued: false,
            values: Vec::new(),
        }
    }

    pub fn parent(&self) -> NodeId {
        self.id.parent
    }
}

/// Persistent property record shared by all sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentProperty {
    pub snapshot: PropertySnapshot,
    /// Bumped on every store; the staleness source
    pub version: u64,
    pub status: ItemStatus,
}

impl PersistentProperty {
    /// Freshly allocated counterpart for a new transient state
    pub fn allocate(id: PropertyId) -> Self {
        Self {
            snapshot: PropertySnapshot::empty(id),
            version: 0,
            status: ItemStatus::New,
        }
    }
}

/// Slot wrapping a persistent property record.
///
/// The write half of the lock is the per-item commit critical section.
pub type PropertySlot = RwLock<PersistentProperty>;

/// Session-private working copy of a property
#[derive(Debug)]
pub struct TransientProperty {
    pub snapshot: PropertySnapshot,
    pub status: ItemStatus,
    /// Version of the persistent record this overlay was derived from
    pub base_version: u64,
    /// Relation to the persisted counterpart; no ownership
    pub overlaid: Weak<PropertySlot>,
}

impl TransientProperty {
    /// Seed a copy-on-write overlay from a persistent record
    pub fn from_persistent(persistent: &PersistentProperty, slot: &Arc<PropertySlot>) -> Self {
        Self {
            snapshot: persistent.snapshot.clone(),
            status: ItemStatus::Existing,
            base_version: persistent.version,
            overlaid: Arc::downgrade(slot),
        }
    }

    /// Working copy for an item with no persistent counterpart yet
    pub fn new_item(snapshot: PropertySnapshot) -> Self {
        Self {
            snapshot,
            status: ItemStatus::New,
            base_version: 0,
            overlaid: Weak::new(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.status == ItemStatus::New
    }

    /// Capture the overlay for a later undo
    pub fn capture(&self) -> TransientSnapshot {
        TransientSnapshot {
            snapshot: self.snapshot.clone(),
            status: self.status,
        }
    }

    /// Reapply field values from a prior capture (undo of uncommitted
    /// changes). A capture of a never-persisted item force-resets the
    /// overlay to new and disconnects it from any persistent counterpart.
    pub fn restore(&mut self, saved: &TransientSnapshot) {
        let force_new = saved.status == ItemStatus::New && self.status != ItemStatus::New;
        self.snapshot = saved.snapshot.clone();
        self.status = saved.status;
        if force_new {
            self.base_version = 0;
            self.overlaid = Weak::new();
        }
    }
}

/// Saved copy of a transient overlay used for undo
#[derive(Debug, Clone)]
pub struct TransientSnapshot {
    pub snapshot: PropertySnapshot,
    pub status: ItemStatus,
}

/// Persisted attributes of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    pub path: String,
    /// Carries a stable identity reference values may point at
    pub referenceable: bool,
    /// Versionable state consulted by the write preconditions
    pub checked_out: bool,
    /// Session holding a lock on this node, if any
    pub lock_owner: Option<SessionId>,
    /// Property definitions pinned on this node, by property name
    pub definitions: BTreeMap<String, PropertyDefinition>,
    /// Child node names
    pub children: BTreeMap<String, NodeId>,
    /// Names of properties attached to this node
    pub properties: BTreeSet<String>,
}

impl NodeRecord {
    /// The workspace root
    pub fn root() -> Self {
        Self {
            id: NodeId::generate(),
            parent: None,
            name: String::new(),
            path: "/".to_string(),
            referenceable: false,
            checked_out: true,
            lock_owner: None,
            definitions: BTreeMap::new(),
            children: BTreeMap::new(),
            properties: BTreeSet::new(),
        }
    }

    /// A child of `parent_record` with the given name
    pub fn child_of(parent_record: &NodeRecord, name: &str, referenceable: bool) -> Self {
        let path = if parent_record.path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent_record.path, name)
        };
        Self {
            id: NodeId::generate(),
            parent: Some(parent_record.id),
            name: name.to_string(),
            path,
            referenceable,
            checked_out: true,
            lock_owner: None,
            definitions: BTreeMap::new(),
            children: BTreeMap::new(),
            properties: BTreeSet::new(),
        }
    }

    /// Definition bound to a property name; residual when nothing is pinned
    pub fn definition_for(&self, name: &str) -> PropertyDefinition {
        self.definitions
            .get(name)
            .cloned()
            .unwrap_or_else(PropertyDefinition::residual)
    }
}

/// Persistent node record shared by all sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentNode {
    pub record: NodeRecord,
    /// Bumped on every store; the staleness source
    pub version: u64,
    pub status: ItemStatus,
}

/// Slot wrapping a persistent node record
pub type NodeSlot = RwLock<PersistentNode>;

/// Session-private working copy of a node
#[derive(Debug)]
pub struct TransientNode {
    pub record: NodeRecord,
    pub status: ItemStatus,
    pub base_version: u64,
    pub overlaid: Weak<NodeSlot>,
}

impl TransientNode {
    pub fn from_persistent(persistent: &PersistentNode, slot: &Arc<NodeSlot>) -> Self {
        Self {
            record: persistent.record.clone(),
            status: ItemStatus::Existing,
            base_version: persistent.version,
            overlaid: Arc::downgrade(slot),
        }
    }

    pub fn new_item(record: NodeRecord) -> Self {
        Self {
            record,
            status: ItemStatus::New,
            base_version: 0,
            overlaid: Weak::new(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.status == ItemStatus::New
    }
}

/// Frozen view of a node delivered to the index engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub path: String,
    pub properties: Vec<PropertySnapshot>,
}
