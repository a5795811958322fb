//! Shared persistent-state registry and the persistence contract.
//!
//! Persistent records live in lock-striped concurrent maps of `Arc`
//! slots; each slot's write lock is the commit critical section for that
//! one item, so commits on disjoint items never block each other.
//! Conflicts are detected, not prevented: a committer whose overlay is
//! stale gets an invalid-state error and must re-read, there is no
//! automatic retry.

use crate::error::{RepositoryError, Result};
use crate::item::{ItemId, ItemStatus, NodeId, PropertyId, SessionId};
use crate::state::{
    NodeRecord, NodeSlot, NodeSnapshot, PersistentNode, PersistentProperty, PropertyDefinition,
    PropertySlot, TransientNode, TransientProperty,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Durable storage contract for persistent item states.
///
/// Backends are pluggable; the core only requires store/remove/load of
/// whole records.
#[async_trait]
pub trait PersistenceManager: Send + Sync {
    /// Durably store a node record
    async fn store_node(&self, record: &PersistentNode) -> Result<()>;

    /// Durably store a property record
    async fn store_property(&self, record: &PersistentProperty) -> Result<()>;

    /// Remove a node record
    async fn remove_node(&self, id: NodeId) -> Result<()>;

    /// Remove a property record
    async fn remove_property(&self, id: &PropertyId) -> Result<()>;

    /// Load a previously stored node record
    async fn load_node(&self, id: NodeId) -> Result<Option<PersistentNode>>;

    /// Load a previously stored property record
    async fn load_property(&self, id: &PropertyId) -> Result<Option<PersistentProperty>>;
}

/// In-memory persistence used by tests and embedded setups
#[derive(Default)]
pub struct MemoryPersistence {
    nodes: RwLock<HashMap<NodeId, PersistentNode>>,
    properties: RwLock<HashMap<PropertyId, PersistentProperty>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceManager for MemoryPersistence {
    async fn store_node(&self, record: &PersistentNode) -> Result<()> {
        self.nodes.write().await.insert(record.record.id, record.clone());
        Ok(())
    }

    async fn store_property(&self, record: &PersistentProperty) -> Result<()> {
        self.properties
            .write()
            .await
            .insert(record.snapshot.id.clone(), record.clone());
        Ok(())
    }

    async fn remove_node(&self, id: NodeId) -> Result<()> {
        self.nodes.write().await.remove(&id);
        Ok(())
    }

    async fn remove_property(&self, id: &PropertyId) -> Result<()> {
        self.properties.write().await.remove(id);
        Ok(())
    }

    async fn load_node(&self, id: NodeId) -> Result<Option<PersistentNode>> {
        Ok(self.nodes.read().await.get(&id).cloned())
    }

    async fn load_property(&self, id: &PropertyId) -> Result<Option<PersistentProperty>> {
        Ok(self.properties.read().await.get(id).cloned())
    }
}

/// Mediator over the shared persistent item states.
///
/// Creates copy-on-write seeds for sessions, allocates persistent
/// counterparts for new transient states, commits overlays under per-item
/// critical sections, and writes through to the durable backend.
pub struct StateManager {
    nodes: DashMap<NodeId, Arc<NodeSlot>>,
    properties: DashMap<PropertyId, Arc<PropertySlot>>,
    persistence: Arc<dyn PersistenceManager>,
    root: NodeId,
}

impl StateManager {
    /// Create a manager with a fresh workspace root
    pub fn new(persistence: Arc<dyn PersistenceManager>) -> Self {
        let record = NodeRecord::root();
        let root = record.id;
        let manager = Self {
            nodes: DashMap::new(),
            properties: DashMap::new(),
            persistence,
            root,
        };
        manager.nodes.insert(
            root,
            Arc::new(RwLock::new(PersistentNode {
                record,
                version: 1,
                status: ItemStatus::Existing,
            })),
        );
        manager
    }

    /// The workspace root node
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Shared slot of a persistent property, if one exists
    pub fn property_slot(&self, id: &PropertyId) -> Option<Arc<PropertySlot>> {
        self.properties.get(id).map(|entry| entry.clone())
    }

    /// Shared slot of a persistent node, if one exists
    pub fn node_slot(&self, id: NodeId) -> Option<Arc<NodeSlot>> {
        self.nodes.get(&id).map(|entry| entry.clone())
    }

    /// Obtain the persistent counterpart for a property, allocating a
    /// brand-new record for a new transient state
    fn property_slot_or_allocate(&self, id: &PropertyId) -> Arc<PropertySlot> {
        self.properties
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(PersistentProperty::allocate(id.clone()))))
            .clone()
    }

    fn node_slot_or_allocate(&self, record: &NodeRecord) -> Arc<NodeSlot> {
        self.nodes
            .entry(record.id)
            .or_insert_with(|| {
                Arc::new(RwLock::new(PersistentNode {
                    record: record.clone(),
                    version: 0,
                    status: ItemStatus::New,
                }))
            })
            .clone()
    }

    /// Current persistent record of a node
    pub async fn node_record(&self, id: NodeId) -> Option<NodeRecord> {
        let slot = self.node_slot(id)?;
        let guard = slot.read().await;
        Some(guard.record.clone())
    }

    /// Current path of a node
    pub async fn node_path(&self, id: NodeId) -> Option<String> {
        let slot = self.node_slot(id)?;
        let guard = slot.read().await;
        Some(guard.record.path.clone())
    }

    /// Whether a node carries a stable referenceable identity
    pub async fn is_referenceable(&self, id: NodeId) -> bool {
        match self.node_slot(id) {
            Some(slot) => slot.read().await.record.referenceable,
            None => false,
        }
    }

    /// Live lookup of a node's current snapshot, including its property
    /// snapshots. `None` when the node no longer exists.
    pub async fn node_snapshot(&self, id: NodeId) -> Option<NodeSnapshot> {
        let record = self.node_record(id).await?;
        let mut properties = Vec::with_capacity(record.properties.len());
        for name in &record.properties {
            let pid = PropertyId::new(id, name.clone());
            if let Some(slot) = self.property_slot(&pid) {
                properties.push(slot.read().await.snapshot.clone());
            }
        }
        Some(NodeSnapshot {
            id,
            path: record.path,
            properties,
        })
    }

    /// Commit a transient property overlay onto its persistent
    /// counterpart.
    ///
    /// Staleness is checked first, under the slot's write lock: if the
    /// persistent record was stored by someone else since the overlay was
    /// derived, the commit fails with an invalid-state error, the overlay
    /// is marked stale and nothing is copied. Otherwise definition id,
    /// type, multiplicity flag and values are copied over, the version is
    /// bumped and the record is written through to the durable backend.
    pub async fn commit_property(&self, overlay: &mut TransientProperty) -> Result<Arc<PropertySlot>> {
        let slot = self.property_slot_or_allocate(&overlay.snapshot.id);
        {
            let mut persistent = slot.write().await;
            if persistent.version != overlay.base_version {
                overlay.status = ItemStatus::Stale;
                return Err(RepositoryError::InvalidState(format!(
                    "property {} was modified concurrently (overlay base {}, current {})",
                    overlay.snapshot.id, overlay.base_version, persistent.version
                )));
            }
            persistent.snapshot.definition_id = overlay.snapshot.definition_id.clone();
            persistent.snapshot.prop_type = overlay.snapshot.prop_type;
            persistent.snapshot.multi_valued = overlay.snapshot.multi_valued;
            persistent.snapshot.values = overlay.snapshot.values.clone();
            persistent.version += 1;
            persistent.status = ItemStatus::Existing;
            self.persistence
                .store_property(&persistent)
                .await
                .map_err(|e| RepositoryError::Internal {
                    item: ItemId::Property(persistent.snapshot.id.clone()),
                    message: e.to_string(),
                })?;
            // spooled binary payloads are durable now
            for value in &mut persistent.snapshot.values {
                value.dispose();
            }
            tracing::debug!(
                "committed property {} at version {}",
                persistent.snapshot.id,
                persistent.version
            );
        }
        overlay.status = ItemStatus::Disconnected;
        Ok(slot)
    }

    /// Commit a transient node overlay. Same staleness protocol as
    /// property commits.
    pub async fn commit_node(&self, overlay: &mut TransientNode) -> Result<Arc<NodeSlot>> {
        let slot = self.node_slot_or_allocate(&overlay.record);
        {
            let mut persistent = slot.write().await;
            if persistent.version != overlay.base_version {
                overlay.status = ItemStatus::Stale;
                return Err(RepositoryError::InvalidState(format!(
                    "node {} was modified concurrently (overlay base {}, current {})",
                    overlay.record.id, overlay.base_version, persistent.version
                )));
            }
            persistent.record = overlay.record.clone();
            persistent.version += 1;
            persistent.status = ItemStatus::Existing;
            self.persistence
                .store_node(&persistent)
                .await
                .map_err(|e| RepositoryError::Internal {
                    item: ItemId::Node(persistent.record.id),
                    message: e.to_string(),
                })?;
            tracing::debug!(
                "committed node {} at version {}",
                persistent.record.id,
                persistent.version
            );
        }
        overlay.status = ItemStatus::Disconnected;
        Ok(slot)
    }

    /// Remove a persistent property. The base version recorded when the
    /// removal was staged is checked against the current record.
    pub async fn remove_property_commit(&self, id: &PropertyId, base_version: u64) -> Result<()> {
        let slot = match self.property_slot(id) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        {
            let guard = slot.read().await;
            if guard.version != base_version {
                return Err(RepositoryError::InvalidState(format!(
                    "property {} was modified concurrently (removal base {}, current {})",
                    id, base_version, guard.version
                )));
            }
        }
        self.properties.remove(id);
        self.persistence.remove_property(id).await?;
        Ok(())
    }

    /// Remove a persistent node along with its properties
    pub async fn remove_node_commit(&self, id: NodeId, base_version: u64) -> Result<()> {
        let slot = match self.node_slot(id) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let property_names = {
            let guard = slot.read().await;
            if guard.version != base_version {
                return Err(RepositoryError::InvalidState(format!(
                    "node {} was modified concurrently (removal base {}, current {})",
                    id, base_version, guard.version
                )));
            }
            guard.record.properties.iter().cloned().collect::<Vec<_>>()
        };
        self.nodes.remove(&id);
        self.persistence.remove_node(id).await?;
        for name in property_names {
            let pid = PropertyId::new(id, name);
            self.properties.remove(&pid);
            self.persistence.remove_property(&pid).await?;
        }
        Ok(())
    }

    /// Place a session lock on a node. Bumps the version so overlapping
    /// overlays detect the change.
    pub async fn lock_node(&self, id: NodeId, session: SessionId) -> Result<()> {
        let slot = self
            .node_slot(id)
            .ok_or(RepositoryError::NotFound(ItemId::Node(id)))?;
        let mut guard = slot.write().await;
        match guard.record.lock_owner {
            Some(owner) if owner != session => Err(RepositoryError::LockConflict(format!(
                "node {} is locked by session {}",
                id, owner
            ))),
            _ => {
                guard.record.lock_owner = Some(session);
                guard.version += 1;
                Ok(())
            }
        }
    }

    /// Release a session lock
    pub async fn unlock_node(&self, id: NodeId, session: SessionId) -> Result<()> {
        let slot = self
            .node_slot(id)
            .ok_or(RepositoryError::NotFound(ItemId::Node(id)))?;
        let mut guard = slot.write().await;
        match guard.record.lock_owner {
            Some(owner) if owner == session => {
                guard.record.lock_owner = None;
                guard.version += 1;
                Ok(())
            }
            Some(owner) => Err(RepositoryError::LockConflict(format!(
                "node {} is locked by session {}",
                id, owner
            ))),
            None => Ok(()),
        }
    }

    /// Flip the checked-out flag consulted by the write preconditions
    pub async fn set_checked_out(&self, id: NodeId, checked_out: bool) -> Result<()> {
        let slot = self
            .node_slot(id)
            .ok_or(RepositoryError::NotFound(ItemId::Node(id)))?;
        let mut guard = slot.write().await;
        guard.record.checked_out = checked_out;
        guard.version += 1;
        Ok(())
    }

    /// Pin a property definition on a node
    pub async fn define_property(
        &self,
        id: NodeId,
        name: impl Into<String>,
        definition: PropertyDefinition,
    ) -> Result<()> {
        let slot = self
            .node_slot(id)
            .ok_or(RepositoryError::NotFound(ItemId::Node(id)))?;
        let mut guard = slot.write().await;
        guard.record.definitions.insert(name.into(), definition);
        guard.version += 1;
        Ok(())
    }
}
