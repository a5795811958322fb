//! Observation events.
//!
//! Events record committed mutations. A collector buffers the events of
//! one commit batch; the batch is handed to the index synchronizer in
//! emission order. Order reflects emission only, not tree causality.

use crate::item::{ItemId, NodeId, PropertyId};
use serde::{Deserialize, Serialize};

/// Kind of observation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    NodeAdded,
    NodeRemoved,
    PropertyAdded,
    PropertyChanged,
    PropertyRemoved,
}

/// A single observation event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    /// Subject of the event
    pub id: ItemId,
    /// Node owning the subject
    pub parent: NodeId,
    /// Path of the subject at emission time
    pub path: String,
    /// Originated outside this process (e.g. a remote cluster member)
    pub external: bool,
}

impl Event {
    pub fn node_added(id: NodeId, parent: NodeId, path: impl Into<String>) -> Self {
        Self {
            event_type: EventType::NodeAdded,
            id: ItemId::Node(id),
            parent,
            path: path.into(),
            external: false,
        }
    }

    pub fn node_removed(id: NodeId, parent: NodeId, path: impl Into<String>) -> Self {
        Self {
            event_type: EventType::NodeRemoved,
            id: ItemId::Node(id),
            parent,
            path: path.into(),
            external: false,
        }
    }

    pub fn property_added(id: PropertyId, path: impl Into<String>) -> Self {
        Self {
            event_type: EventType::PropertyAdded,
            parent: id.parent,
            id: ItemId::Property(id),
            path: path.into(),
            external: false,
        }
    }

    pub fn property_changed(id: PropertyId, path: impl Into<String>) -> Self {
        Self {
            event_type: EventType::PropertyChanged,
            parent: id.parent,
            id: ItemId::Property(id),
            path: path.into(),
            external: false,
        }
    }

    pub fn property_removed(id: PropertyId, path: impl Into<String>) -> Self {
        Self {
            event_type: EventType::PropertyRemoved,
            parent: id.parent,
            id: ItemId::Property(id),
            path: path.into(),
            external: false,
        }
    }

    /// Mark the event as externally sourced
    pub fn from_external(mut self) -> Self {
        self.external = true;
        self
    }

    /// The node this event affects for indexing purposes: the node itself
    /// for node events, the owning node for property events
    pub fn subject_node(&self) -> NodeId {
        match &self.id {
            ItemId::Node(id) => *id,
            ItemId::Property(id) => id.parent,
        }
    }
}

/// Ordered event sequence delivered to the synchronizer in one notification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<Event>,
}

impl EventBatch {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

/// Buffers raw observation events for one commit batch
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<Event>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drain the buffered events into a batch
    pub fn take(&mut self) -> EventBatch {
        EventBatch::new(std::mem::take(&mut self.events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_node_for_property_events() {
        let node = NodeId::generate();
        let event = Event::property_changed(PropertyId::new(node, "title"), "/doc/title");
        assert_eq!(event.subject_node(), node);
    }

    #[test]
    fn test_collector_drains_in_emission_order() {
        let node = NodeId::generate();
        let parent = NodeId::generate();
        let mut collector = EventCollector::new();
        collector.push(Event::node_added(node, parent, "/doc"));
        collector.push(Event::property_added(PropertyId::new(node, "title"), "/doc/title"));

        let batch = collector.take();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.events[0].event_type, EventType::NodeAdded);
        assert_eq!(batch.events[1].event_type, EventType::PropertyAdded);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_external_marking() {
        let node = NodeId::generate();
        let event = Event::node_added(node, NodeId::generate(), "/doc").from_external();
        assert!(event.external);
    }
}
