//! Sessions over the shared repository state.
//!
//! A session owns a private arena of transient overlays, created lazily
//! on first mutation (copy-on-write) and promoted to persistent state on
//! `save`. Overlays are never shared across sessions; all cross-session
//! coordination happens in the `StateManager` at commit time.
//!
//! Write preconditions are checked in a fixed order before any state is
//! touched: checked-out ancestor, protected definition, static
//! multiplicity, foreign lock.

use crate::coerce::{self, ReferenceResolver};
use crate::error::{RepositoryError, Result};
use crate::event::{Event, EventCollector};
use crate::indexing::IndexFeed;
use crate::item::{ItemId, ItemStatus, NodeId, PropertyId, SessionId};
use crate::state::{
    NodeRecord, PropertyDefinition, PropertySnapshot, TransientNode, TransientProperty,
    TransientSnapshot,
};
use crate::store::StateManager;
use crate::value::{self, InternalValue, PropertyType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Property removal staged for the next save
struct StagedRemoval {
    base_version: u64,
    path: String,
}

/// Node removal staged for the next save
struct StagedNodeRemoval {
    base_version: u64,
    path: String,
    parent: NodeId,
}

/// Per-session registry of live transient states, keyed by item id
#[derive(Default)]
struct SessionArena {
    nodes: HashMap<NodeId, TransientNode>,
    properties: HashMap<PropertyId, TransientProperty>,
    removed_properties: HashMap<PropertyId, StagedRemoval>,
    removed_nodes: HashMap<NodeId, StagedNodeRemoval>,
}

/// A single client's view of the repository
pub struct Session {
    id: SessionId,
    store: Arc<StateManager>,
    feed: Option<IndexFeed>,
    arena: SessionArena,
    collector: EventCollector,
}

impl Session {
    /// Create a session over the shared state. `feed` carries committed
    /// event batches to the indexing task; `None` disables indexing.
    pub fn new(store: Arc<StateManager>, feed: Option<IndexFeed>) -> Self {
        Self {
            id: SessionId::generate(),
            store,
            feed,
            arena: SessionArena::default(),
            collector: EventCollector::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The workspace root node
    pub fn root(&self) -> NodeId {
        self.store.root()
    }

    // ── Node operations ─────────────────────────────────────────

    /// Create a child node under `parent`
    pub async fn add_node(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.add_node_with(parent, name, false).await
    }

    /// Create a child node carrying a stable referenceable identity
    pub async fn add_referenceable_node(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.add_node_with(parent, name, true).await
    }

    async fn add_node_with(
        &mut self,
        parent: NodeId,
        name: &str,
        referenceable: bool,
    ) -> Result<NodeId> {
        validate_name(name)?;
        self.check_checked_out(parent).await?;
        let parent_record = self.node_view(parent).await?;
        if let Some(owner) = parent_record.lock_owner {
            if owner != self.id {
                return Err(RepositoryError::LockConflict(format!(
                    "node {} is locked by session {}",
                    parent, owner
                )));
            }
        }
        if parent_record.children.contains_key(name) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "node {} already has a child named '{}'",
                parent, name
            )));
        }

        let record = NodeRecord::child_of(&parent_record, name, referenceable);
        let id = record.id;

        self.node_overlay(parent).await?;
        if let Some(overlay) = self.arena.nodes.get_mut(&parent) {
            overlay.record.children.insert(name.to_string(), id);
            if overlay.status == ItemStatus::Existing {
                overlay.status = ItemStatus::ExistingModified;
            }
        }
        self.arena.nodes.insert(id, TransientNode::new_item(record));
        Ok(id)
    }

    /// Remove a node. A node created in this session and never saved
    /// disappears without effect; a persistent node is removed at the
    /// next save.
    pub async fn remove_node(&mut self, id: NodeId) -> Result<()> {
        if id == self.store.root() {
            return Err(RepositoryError::ConstraintViolation(
                "cannot remove the root node".to_string(),
            ));
        }
        let record = self.node_view(id).await?;
        if !record.children.is_empty() {
            return Err(RepositoryError::ConstraintViolation(format!(
                "node {} still has children",
                id
            )));
        }
        self.check_checked_out(id).await?;
        if let Some(owner) = record.lock_owner {
            if owner != self.id {
                return Err(RepositoryError::LockConflict(format!(
                    "node {} is locked by session {}",
                    id, owner
                )));
            }
        }
        let parent = match record.parent {
            Some(parent) => parent,
            None => {
                return Err(RepositoryError::ConstraintViolation(format!(
                    "node {} has no parent",
                    id
                )))
            }
        };

        self.node_overlay(parent).await?;
        if let Some(overlay) = self.arena.nodes.get_mut(&parent) {
            overlay.record.children.remove(&record.name);
            if overlay.status == ItemStatus::Existing {
                overlay.status = ItemStatus::ExistingModified;
            }
        }

        let was_new = self
            .arena
            .nodes
            .get(&id)
            .map(|overlay| overlay.is_new())
            .unwrap_or(false);
        self.arena.nodes.remove(&id);
        self.arena.properties.retain(|pid, _| pid.parent != id);
        if was_new {
            return Ok(());
        }

        let base_version = match self.store.node_slot(id) {
            Some(slot) => slot.read().await.version,
            None => return Ok(()),
        };
        self.arena.removed_nodes.insert(
            id,
            StagedNodeRemoval {
                base_version,
                path: record.path,
                parent,
            },
        );
        Ok(())
    }

    /// Whether the node is visible to this session
    pub async fn node_exists(&self, id: NodeId) -> bool {
        self.node_view(id).await.is_ok()
    }

    /// Current path of a node as seen by this session
    pub async fn node_path(&self, id: NodeId) -> Result<String> {
        Ok(self.node_view(id).await?.path)
    }

    // ── Property mutation surface ───────────────────────────────

    /// Set a single value. `None` removes the property entirely.
    pub async fn set_value(
        &mut self,
        node: NodeId,
        name: &str,
        value: Option<InternalValue>,
    ) -> Result<()> {
        let definition = self.check_set_value(node, name, false).await?;
        match value {
            Some(v) => {
                let supplied = [Some(v)];
                let (resolved, coerced) =
                    coerce::coerce_values(&supplied, definition.required_type, self).await?;
                self.apply_values(node, name, coerced, resolved, false, &definition)
                    .await
            }
            None => self.detach_property(node, name).await,
        }
    }

    /// Set a homogeneous array of values. `None` removes the property;
    /// interior `None` slots are purged, the rest keep their order.
    pub async fn set_values(
        &mut self,
        node: NodeId,
        name: &str,
        values: Option<Vec<Option<InternalValue>>>,
    ) -> Result<()> {
        let definition = self.check_set_value(node, name, true).await?;
        match values {
            Some(supplied) => {
                let (resolved, coerced) =
                    coerce::coerce_values(&supplied, definition.required_type, self).await?;
                self.apply_values(node, name, coerced, resolved, true, &definition)
                    .await
            }
            None => self.detach_property(node, name).await,
        }
    }

    /// Read the single value of a property
    pub async fn value(&self, node: NodeId, name: &str) -> Result<InternalValue> {
        let snapshot = self.property_view(&PropertyId::new(node, name)).await?;
        if snapshot.multi_valued {
            return Err(RepositoryError::ValueFormat(format!(
                "property '{}' is multi-valued",
                name
            )));
        }
        snapshot.values.into_iter().next().ok_or_else(|| {
            RepositoryError::ValueFormat(format!("property '{}' has no value", name))
        })
    }

    /// Read the value array of a multi-valued property
    pub async fn values(&self, node: NodeId, name: &str) -> Result<Vec<InternalValue>> {
        let snapshot = self.property_view(&PropertyId::new(node, name)).await?;
        if !snapshot.multi_valued {
            return Err(RepositoryError::ValueFormat(format!(
                "property '{}' is single-valued",
                name
            )));
        }
        Ok(snapshot.values)
    }

    /// Length of a single-valued property's value
    pub async fn value_length(&self, node: NodeId, name: &str) -> Result<i64> {
        Ok(self.value(node, name).await?.length())
    }

    /// Per-element lengths of a multi-valued property
    pub async fn value_lengths(&self, node: NodeId, name: &str) -> Result<Vec<i64>> {
        Ok(self
            .values(node, name)
            .await?
            .iter()
            .map(InternalValue::length)
            .collect())
    }

    /// Whether the property is visible to this session
    pub async fn property_exists(&self, node: NodeId, name: &str) -> bool {
        self.property_view(&PropertyId::new(node, name)).await.is_ok()
    }

    // ── Undo support ────────────────────────────────────────────

    /// Capture the property's current transient state for a later undo
    pub async fn snapshot_property(&mut self, node: NodeId, name: &str) -> Result<TransientSnapshot> {
        let id = PropertyId::new(node, name);
        if !self.arena.properties.contains_key(&id) && self.store.property_slot(&id).is_none() {
            return Err(RepositoryError::NotFound(ItemId::Property(id)));
        }
        self.ensure_property_overlay(&id, node, name).await?;
        match self.arena.properties.get(&id) {
            Some(overlay) => Ok(overlay.capture()),
            None => Err(RepositoryError::NotFound(ItemId::Property(id))),
        }
    }

    /// Reapply a captured transient state, undoing uncommitted changes
    pub async fn restore_property(
        &mut self,
        node: NodeId,
        name: &str,
        saved: &TransientSnapshot,
    ) -> Result<()> {
        let id = PropertyId::new(node, name);
        self.ensure_property_overlay(&id, node, name).await?;
        match self.arena.properties.get_mut(&id) {
            Some(overlay) => {
                overlay.restore(saved);
                Ok(())
            }
            None => Err(RepositoryError::NotFound(ItemId::Property(id))),
        }
    }

    // ── Lock / versioning surface ───────────────────────────────

    pub async fn lock_node(&self, node: NodeId) -> Result<()> {
        self.store.lock_node(node, self.id).await
    }

    pub async fn unlock_node(&self, node: NodeId) -> Result<()> {
        self.store.unlock_node(node, self.id).await
    }

    pub async fn set_checked_out(&self, node: NodeId, checked_out: bool) -> Result<()> {
        self.store.set_checked_out(node, checked_out).await
    }

    pub async fn define_property(
        &self,
        node: NodeId,
        name: &str,
        definition: PropertyDefinition,
    ) -> Result<()> {
        self.store.define_property(node, name, definition).await
    }

    // ── Commit hook ─────────────────────────────────────────────

    /// Promote every dirty overlay to persistent state, then hand the
    /// buffered events to the indexing task as one batch.
    ///
    /// Overlays are committed item by item; the first staleness failure
    /// aborts the save, leaving the failed overlay (marked stale) and any
    /// unprocessed overlays intact for inspection or discard. Events for
    /// items committed before the failure are still delivered.
    pub async fn save(&mut self) -> Result<()> {
        let result = self.commit_dirty().await;
        let batch = self.collector.take();
        if let Some(feed) = &self.feed {
            feed.submit(batch).await;
        }
        result
    }

    /// Drop every uncommitted overlay and staged removal without effect
    pub fn discard(&mut self) {
        self.arena.nodes.clear();
        self.arena.properties.clear();
        self.arena.removed_properties.clear();
        self.arena.removed_nodes.clear();
        self.collector.take();
    }

    /// Whether the session carries uncommitted changes
    pub fn has_pending_changes(&self) -> bool {
        !self.arena.removed_properties.is_empty()
            || !self.arena.removed_nodes.is_empty()
            || self
                .arena
                .nodes
                .values()
                .any(|o| o.status != ItemStatus::Existing)
            || self
                .arena
                .properties
                .values()
                .any(|o| o.status != ItemStatus::Existing)
    }

    async fn commit_dirty(&mut self) -> Result<()> {
        // staged property removals
        let removal_ids: Vec<PropertyId> =
            self.arena.removed_properties.keys().cloned().collect();
        for id in removal_ids {
            let staged = match self.arena.removed_properties.remove(&id) {
                Some(staged) => staged,
                None => continue,
            };
            match self
                .store
                .remove_property_commit(&id, staged.base_version)
                .await
            {
                Ok(()) => self
                    .collector
                    .push(Event::property_removed(id.clone(), staged.path)),
                Err(e) => {
                    self.arena.removed_properties.insert(id, staged);
                    return Err(e);
                }
            }
        }

        // staged node removals
        let removal_ids: Vec<NodeId> = self.arena.removed_nodes.keys().copied().collect();
        for id in removal_ids {
            let staged = match self.arena.removed_nodes.remove(&id) {
                Some(staged) => staged,
                None => continue,
            };
            match self.store.remove_node_commit(id, staged.base_version).await {
                Ok(()) => self
                    .collector
                    .push(Event::node_removed(id, staged.parent, staged.path)),
                Err(e) => {
                    self.arena.removed_nodes.insert(id, staged);
                    return Err(e);
                }
            }
        }

        // nodes, parents before children
        let mut node_order: Vec<(usize, NodeId)> = self
            .arena
            .nodes
            .iter()
            .filter(|(_, overlay)| overlay.status != ItemStatus::Existing)
            .map(|(id, overlay)| (overlay.record.path.len(), *id))
            .collect();
        node_order.sort();
        for (_, id) in node_order {
            let mut overlay = match self.arena.nodes.remove(&id) {
                Some(overlay) => overlay,
                None => continue,
            };
            let was_new = overlay.is_new();
            let parent = overlay.record.parent;
            let path = overlay.record.path.clone();
            match self.store.commit_node(&mut overlay).await {
                Ok(_) => {
                    if was_new {
                        if let Some(parent) = parent {
                            self.collector.push(Event::node_added(id, parent, path));
                        }
                    }
                }
                Err(e) => {
                    self.arena.nodes.insert(id, overlay);
                    return Err(e);
                }
            }
        }

        // properties
        let property_ids: Vec<PropertyId> = self
            .arena
            .properties
            .iter()
            .filter(|(_, overlay)| overlay.status != ItemStatus::Existing)
            .map(|(id, _)| id.clone())
            .collect();
        for id in property_ids {
            let mut overlay = match self.arena.properties.remove(&id) {
                Some(overlay) => overlay,
                None => continue,
            };
            let was_new = overlay.is_new();
            match self.store.commit_property(&mut overlay).await {
                Ok(_) => {
                    let path = self.property_path(id.parent, &id.name).await;
                    let event = if was_new {
                        Event::property_added(id.clone(), path)
                    } else {
                        Event::property_changed(id.clone(), path)
                    };
                    self.collector.push(event);
                }
                Err(e) => {
                    self.arena.properties.insert(id, overlay);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────

    /// Transient-first view of a node record
    async fn node_view(&self, id: NodeId) -> Result<NodeRecord> {
        if let Some(overlay) = self.arena.nodes.get(&id) {
            return Ok(overlay.record.clone());
        }
        if self.arena.removed_nodes.contains_key(&id) {
            return Err(RepositoryError::NotFound(ItemId::Node(id)));
        }
        self.store
            .node_record(id)
            .await
            .ok_or(RepositoryError::NotFound(ItemId::Node(id)))
    }

    /// Transient-first view of a property snapshot
    async fn property_view(&self, id: &PropertyId) -> Result<PropertySnapshot> {
        if let Some(overlay) = self.arena.properties.get(id) {
            return Ok(overlay.snapshot.clone());
        }
        if self.arena.removed_properties.contains_key(id) {
            return Err(RepositoryError::NotFound(ItemId::Property(id.clone())));
        }
        if let Some(slot) = self.store.property_slot(id) {
            return Ok(slot.read().await.snapshot.clone());
        }
        Err(RepositoryError::NotFound(ItemId::Property(id.clone())))
    }

    /// Validate a value-set against the write preconditions, in order:
    /// checked-out ancestor, protected definition, static multiplicity,
    /// foreign lock. Any failure aborts before any state is touched.
    async fn check_set_value(
        &self,
        node: NodeId,
        name: &str,
        multiple: bool,
    ) -> Result<PropertyDefinition> {
        self.check_checked_out(node).await?;
        let record = self.node_view(node).await?;
        let definition = record.definition_for(name);
        if definition.protected {
            return Err(RepositoryError::ConstraintViolation(format!(
                "property '{}' on node {} is protected",
                name, node
            )));
        }
        if let Some(pinned) = definition.multiple {
            if pinned != multiple {
                return Err(RepositoryError::ValueFormat(format!(
                    "property '{}' is {}",
                    name,
                    if pinned { "multi-valued" } else { "single-valued" }
                )));
            }
        }
        if let Some(owner) = record.lock_owner {
            if owner != self.id {
                return Err(RepositoryError::LockConflict(format!(
                    "node {} is locked by session {}",
                    node, owner
                )));
            }
        }
        Ok(definition)
    }

    /// Reject writes anywhere below a checked-in ancestor
    async fn check_checked_out(&self, node: NodeId) -> Result<()> {
        let mut current = Some(node);
        while let Some(id) = current {
            let record = self.node_view(id).await?;
            if !record.checked_out {
                return Err(RepositoryError::VersionConflict(format!(
                    "node {} is checked in",
                    id
                )));
            }
            current = record.parent;
        }
        Ok(())
    }

    /// Store a coerced value sequence on the property overlay: compact
    /// the slots, release superseded binary payloads, fall back to
    /// string for an undefined type.
    async fn apply_values(
        &mut self,
        node: NodeId,
        name: &str,
        values: Vec<Option<InternalValue>>,
        resolved: PropertyType,
        multiple: bool,
        definition: &PropertyDefinition,
    ) -> Result<()> {
        let id = PropertyId::new(node, name);
        let compacted = value::compact(values);
        let prop_type = if resolved == PropertyType::Undefined {
            PropertyType::String
        } else {
            resolved
        };

        self.ensure_property_overlay(&id, node, name).await?;
        let overlay = match self.arena.properties.get_mut(&id) {
            Some(overlay) => overlay,
            None => return Err(RepositoryError::NotFound(ItemId::Property(id))),
        };
        for old in &mut overlay.snapshot.values {
            old.dispose();
        }
        overlay.snapshot.values = compacted;
        overlay.snapshot.prop_type = prop_type;
        overlay.snapshot.multi_valued = multiple;
        overlay.snapshot.definition_id = definition.id.clone();
        if overlay.status == ItemStatus::Existing {
            overlay.status = ItemStatus::ExistingModified;
        }
        Ok(())
    }

    /// Idempotent transient-state access: reuse the session's overlay or
    /// seed a copy-on-write working copy from the persistent record. A
    /// property with no persistent counterpart starts as a new item and
    /// attaches its name to the parent overlay.
    async fn ensure_property_overlay(
        &mut self,
        id: &PropertyId,
        node: NodeId,
        name: &str,
    ) -> Result<()> {
        if self.arena.properties.contains_key(id) {
            return Ok(());
        }
        let staged_removed = self.arena.removed_properties.contains_key(id);
        if !staged_removed {
            if let Some(slot) = self.store.property_slot(id) {
                let overlay = {
                    let guard = slot.read().await;
                    TransientProperty::from_persistent(&guard, &slot)
                };
                self.arena.properties.insert(id.clone(), overlay);
                return Ok(());
            }
        }

        self.node_overlay(node).await?;
        if let Some(parent) = self.arena.nodes.get_mut(&node) {
            parent.record.properties.insert(name.to_string());
            if parent.status == ItemStatus::Existing {
                parent.status = ItemStatus::ExistingModified;
            }
        }
        self.arena.properties.insert(
            id.clone(),
            TransientProperty::new_item(PropertySnapshot::empty(id.clone())),
        );
        Ok(())
    }

    /// Remove the property from this session's view and signal the
    /// parent to detach the child name. A property never saved just
    /// disappears; a persistent one is removed at the next save.
    async fn detach_property(&mut self, node: NodeId, name: &str) -> Result<()> {
        let id = PropertyId::new(node, name);
        let overlay_is_new = self
            .arena
            .properties
            .get(&id)
            .map(|overlay| overlay.is_new())
            .unwrap_or(false);
        let in_arena = self.arena.properties.contains_key(&id);
        let persistent_slot = self.store.property_slot(&id);
        if !in_arena && persistent_slot.is_none() {
            return Err(RepositoryError::NotFound(ItemId::Property(id)));
        }

        self.node_overlay(node).await?;
        if let Some(parent) = self.arena.nodes.get_mut(&node) {
            parent.record.properties.remove(name);
            if parent.status == ItemStatus::Existing {
                parent.status = ItemStatus::ExistingModified;
            }
        }
        self.arena.properties.remove(&id);
        if !overlay_is_new {
            if let Some(slot) = persistent_slot {
                let base_version = slot.read().await.version;
                let path = self.property_path(node, name).await;
                self.arena
                    .removed_properties
                    .insert(id, StagedRemoval { base_version, path });
            }
        }
        Ok(())
    }

    /// Ensure a node overlay exists in the arena
    async fn node_overlay(&mut self, id: NodeId) -> Result<()> {
        if self.arena.nodes.contains_key(&id) {
            return Ok(());
        }
        let slot = self
            .store
            .node_slot(id)
            .ok_or(RepositoryError::NotFound(ItemId::Node(id)))?;
        let overlay = {
            let guard = slot.read().await;
            TransientNode::from_persistent(&guard, &slot)
        };
        self.arena.nodes.insert(id, overlay);
        Ok(())
    }

    async fn property_path(&self, node: NodeId, name: &str) -> String {
        let node_path = match self.node_view(node).await {
            Ok(record) => record.path,
            Err(_) => match self.store.node_path(node).await {
                Some(path) => path,
                None => "/".to_string(),
            },
        };
        if node_path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", node_path, name)
        }
    }
}

#[async_trait]
impl ReferenceResolver for Session {
    async fn is_referenceable(&self, id: NodeId) -> bool {
        if let Some(overlay) = self.arena.nodes.get(&id) {
            return overlay.record.referenceable;
        }
        self.store.is_referenceable(id).await
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(RepositoryError::ValueFormat(format!(
            "'{}' is not a valid item name",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPersistence;
    use crate::value::BinaryValue;

    fn store() -> Arc<StateManager> {
        Arc::new(StateManager::new(Arc::new(MemoryPersistence::new())))
    }

    fn session(store: &Arc<StateManager>) -> Session {
        Session::new(store.clone(), None)
    }

    #[tokio::test]
    async fn test_set_and_read_single_value() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();

        s.set_value(doc, "title", Some(InternalValue::String("hello".to_string())))
            .await
            .unwrap();
        assert_eq!(
            s.value(doc, "title").await.unwrap(),
            InternalValue::String("hello".to_string())
        );
        assert_eq!(s.value_length(doc, "title").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_array_compaction_preserves_order() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();

        s.set_values(
            doc,
            "tags",
            Some(vec![
                Some(InternalValue::String("a".to_string())),
                None,
                Some(InternalValue::String("b".to_string())),
                None,
                Some(InternalValue::String("c".to_string())),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(
            s.values(doc, "tags").await.unwrap(),
            vec![
                InternalValue::String("a".to_string()),
                InternalValue::String("b".to_string()),
                InternalValue::String("c".to_string()),
            ]
        );
        assert_eq!(s.value_lengths(doc, "tags").await.unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_null_removes_property() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();

        s.set_value(doc, "title", Some(InternalValue::Long(1)))
            .await
            .unwrap();
        assert!(s.property_exists(doc, "title").await);

        s.set_value(doc, "title", None).await.unwrap();
        assert!(!s.property_exists(doc, "title").await);
    }

    #[tokio::test]
    async fn test_heterogeneous_array_rejected_and_untouched() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();

        s.set_values(doc, "tags", Some(vec![Some(InternalValue::Long(1))]))
            .await
            .unwrap();

        let err = s
            .set_values(
                doc,
                "tags",
                Some(vec![
                    Some(InternalValue::Long(2)),
                    Some(InternalValue::String("two".to_string())),
                ]),
            )
            .await;
        assert!(matches!(err, Err(RepositoryError::ValueFormat(_))));

        // stored values unchanged
        assert_eq!(
            s.values(doc, "tags").await.unwrap(),
            vec![InternalValue::Long(1)]
        );
    }

    #[tokio::test]
    async fn test_protected_property_rejected() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();
        s.save().await.unwrap();
        s.define_property(
            doc,
            "system",
            PropertyDefinition::typed("sys", PropertyType::String, false).protected(),
        )
        .await
        .unwrap();

        let err = s
            .set_value(doc, "system", Some(InternalValue::String("x".to_string())))
            .await;
        assert!(matches!(err, Err(RepositoryError::ConstraintViolation(_))));
    }

    #[tokio::test]
    async fn test_multiplicity_pinned_by_definition() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();
        s.save().await.unwrap();
        s.define_property(
            doc,
            "tags",
            PropertyDefinition::typed("tags", PropertyType::String, true),
        )
        .await
        .unwrap();

        let err = s
            .set_value(doc, "tags", Some(InternalValue::String("x".to_string())))
            .await;
        assert!(matches!(err, Err(RepositoryError::ValueFormat(_))));

        s.set_values(
            doc,
            "tags",
            Some(vec![Some(InternalValue::String("x".to_string()))]),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_checked_in_ancestor_blocks_write() {
        let store = store();
        let mut s = session(&store);
        let folder = s.add_node(store.root(), "folder").await.unwrap();
        let doc = s.add_node(folder, "doc").await.unwrap();
        s.save().await.unwrap();

        s.set_checked_out(folder, false).await.unwrap();
        let err = s.set_value(doc, "title", Some(InternalValue::Long(1))).await;
        assert!(matches!(err, Err(RepositoryError::VersionConflict(_))));
    }

    #[tokio::test]
    async fn test_foreign_lock_blocks_write() {
        let store = store();
        let mut alice = session(&store);
        let doc = alice.add_node(store.root(), "doc").await.unwrap();
        alice.save().await.unwrap();

        let bob = session(&store);
        bob.lock_node(doc).await.unwrap();

        let err = alice
            .set_value(doc, "title", Some(InternalValue::Long(1)))
            .await;
        assert!(matches!(err, Err(RepositoryError::LockConflict(_))));

        // the lock holder can still write
        let mut bob = bob;
        bob.set_value(doc, "title", Some(InternalValue::Long(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reference_requires_referenceable_target() {
        let store = store();
        let mut s = session(&store);
        let plain = s.add_node(store.root(), "plain").await.unwrap();
        let target = s.add_referenceable_node(store.root(), "target").await.unwrap();
        let doc = s.add_node(store.root(), "doc").await.unwrap();

        let err = s
            .set_value(doc, "ref", Some(InternalValue::Reference(plain)))
            .await;
        assert!(matches!(err, Err(RepositoryError::ValueFormat(_))));

        s.set_value(doc, "ref", Some(InternalValue::Reference(target)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_binary_released_on_overwrite() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();

        let first = BinaryValue::new(b"first".to_vec());
        let temp = first.temp().unwrap().clone();
        s.set_value(doc, "data", Some(InternalValue::Binary(first)))
            .await
            .unwrap();
        assert!(!temp.is_released());

        s.set_value(
            doc,
            "data",
            Some(InternalValue::Binary(BinaryValue::new(b"second".to_vec()))),
        )
        .await
        .unwrap();
        assert!(temp.is_released());
    }

    #[tokio::test]
    async fn test_undo_restores_uncommitted_changes() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();

        s.set_value(doc, "title", Some(InternalValue::String("one".to_string())))
            .await
            .unwrap();
        let saved = s.snapshot_property(doc, "title").await.unwrap();

        s.set_value(doc, "title", Some(InternalValue::String("two".to_string())))
            .await
            .unwrap();
        s.restore_property(doc, "title", &saved).await.unwrap();

        assert_eq!(
            s.value(doc, "title").await.unwrap(),
            InternalValue::String("one".to_string())
        );
    }

    #[tokio::test]
    async fn test_save_promotes_to_shared_state() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();
        s.set_value(doc, "title", Some(InternalValue::String("hello".to_string())))
            .await
            .unwrap();
        s.save().await.unwrap();
        assert!(!s.has_pending_changes());

        // a second session sees the committed state
        let other = session(&store);
        assert_eq!(
            other.value(doc, "title").await.unwrap(),
            InternalValue::String("hello".to_string())
        );
    }

    #[tokio::test]
    async fn test_discard_abandons_changes_without_effect() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();
        s.save().await.unwrap();

        s.set_value(doc, "title", Some(InternalValue::Long(1)))
            .await
            .unwrap();
        s.discard();
        assert!(!s.property_exists(doc, "title").await);

        let other = session(&store);
        assert!(!other.property_exists(doc, "title").await);
    }

    #[tokio::test]
    async fn test_stale_save_leaves_overlay_intact() {
        let store = store();
        let mut writer = session(&store);
        let doc = writer.add_node(store.root(), "doc").await.unwrap();
        writer
            .set_value(doc, "title", Some(InternalValue::String("base".to_string())))
            .await
            .unwrap();
        writer.save().await.unwrap();

        // both sessions derive overlays from the same base
        let mut alice = session(&store);
        alice
            .set_value(doc, "title", Some(InternalValue::String("alice".to_string())))
            .await
            .unwrap();
        let mut bob = session(&store);
        bob.set_value(doc, "title", Some(InternalValue::String("bob".to_string())))
            .await
            .unwrap();

        alice.save().await.unwrap();
        let err = bob.save().await;
        assert!(matches!(err, Err(RepositoryError::InvalidState(_))));

        // winner's value intact, loser's overlay still readable
        let reader = session(&store);
        assert_eq!(
            reader.value(doc, "title").await.unwrap(),
            InternalValue::String("alice".to_string())
        );
        assert_eq!(
            bob.value(doc, "title").await.unwrap(),
            InternalValue::String("bob".to_string())
        );
        assert!(bob.has_pending_changes());
    }

    #[tokio::test]
    async fn test_remove_node_staged_until_save() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();
        s.save().await.unwrap();

        s.remove_node(doc).await.unwrap();
        assert!(!s.node_exists(doc).await);

        // other sessions still see it until the removal commits
        let other = session(&store);
        assert!(other.node_exists(doc).await);

        s.save().await.unwrap();
        assert!(!other.node_exists(doc).await);
    }

    #[tokio::test]
    async fn test_new_node_removed_before_save_vanishes() {
        let store = store();
        let mut s = session(&store);
        let doc = s.add_node(store.root(), "doc").await.unwrap();
        s.remove_node(doc).await.unwrap();
        s.save().await.unwrap();

        let other = session(&store);
        assert!(!other.node_exists(doc).await);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let store = store();
        let mut s = session(&store);
        for bad in ["", ".", "..", "a/b"] {
            assert!(matches!(
                s.add_node(store.root(), bad).await,
                Err(RepositoryError::ValueFormat(_))
            ));
        }
    }
}
