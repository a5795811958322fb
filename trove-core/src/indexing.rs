//! Incremental index synchronization.
//!
//! Turns committed event batches into index updates. Each batch runs
//! independently through a fixed pipeline: filter, classify, external-add
//! correction, property folding, resolution, delivery. Every node is
//! indexed as one atomic document, so property-level changes are widened
//! to a node-level remove-and-reinsert rather than field patches.
//!
//! The synchronizer is the single consumer of a bounded channel fed from
//! the commit path. Processing failures are caught and logged; a batch
//! either completes or is dropped, and nothing propagates back into the
//! already-completed commit.

use crate::error::Result;
use crate::event::{Event, EventBatch, EventType};
use crate::index::IndexEngine;
use crate::item::NodeId;
use crate::store::StateManager;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consumes event batches and issues incremental index updates
pub struct IndexSynchronizer {
    engine: Arc<dyn IndexEngine>,
    store: Arc<StateManager>,
    excluded_paths: Vec<String>,
}

impl IndexSynchronizer {
    pub fn new(
        engine: Arc<dyn IndexEngine>,
        store: Arc<StateManager>,
        excluded_paths: Vec<String>,
    ) -> Self {
        Self {
            engine,
            store,
            excluded_paths,
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|prefix| {
            path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
        })
    }

    /// Process one batch; issues at most one engine update.
    pub async fn process_batch(&self, batch: EventBatch) -> Result<()> {
        // Filter: drop everything under an excluded subtree
        let events: Vec<Event> = batch
            .events
            .into_iter()
            .filter(|event| !self.is_excluded(&event.path))
            .collect();

        // Classify node events; property events are folded afterwards
        let mut added: HashMap<NodeId, Event> = HashMap::new();
        let mut removed: HashSet<NodeId> = HashSet::new();
        let mut property_events: Vec<Event> = Vec::new();
        for event in events {
            match event.event_type {
                EventType::NodeAdded => {
                    added.insert(event.subject_node(), event);
                }
                EventType::NodeRemoved => {
                    removed.insert(event.subject_node());
                }
                _ => property_events.push(event),
            }
        }

        // An externally sourced add cannot trust the local view; force a
        // fetch-and-reindex
        for (id, event) in &added {
            if event.external {
                removed.insert(*id);
            }
        }

        // Property folding: any property-level change invalidates the
        // owning node's whole document
        for event in property_events {
            let node = event.subject_node();
            match event.event_type {
                EventType::PropertyAdded => {
                    if !added.contains_key(&node) {
                        removed.insert(node);
                        added.insert(node, event);
                    }
                }
                _ => {
                    removed.insert(node);
                    added.entry(node).or_insert(event);
                }
            }
        }

        // Resolution: live lookup of every added node
        let mut pending: Vec<(NodeId, Event)> = added.into_iter().collect();
        pending.sort_by_key(|(id, _)| *id);
        let mut resolved = Vec::with_capacity(pending.len());
        for (id, event) in pending {
            match self.store.node_snapshot(id).await {
                Some(snapshot) => resolved.push(snapshot),
                None if event.external => {
                    tracing::debug!("external node {} no longer exists, skipping", id);
                }
                None => {
                    tracing::error!(
                        "indexing integrity: node {} vanished before resolution, skipping",
                        id
                    );
                }
            }
        }

        // Delivery: exactly one engine call when there is anything to do
        if removed.is_empty() && resolved.is_empty() {
            return Ok(());
        }
        let mut removed: Vec<NodeId> = removed.into_iter().collect();
        removed.sort();
        tracing::debug!(
            "index update: {} removed, {} added",
            removed.len(),
            resolved.len()
        );
        self.engine.update_nodes(removed, resolved).await
    }
}

/// Producer handle feeding committed batches to the indexing task
#[derive(Clone)]
pub struct IndexFeed {
    tx: mpsc::Sender<EventBatch>,
}

impl IndexFeed {
    /// Enqueue a batch. Waits only for queue capacity, never for the
    /// batch to be processed.
    pub async fn submit(&self, batch: EventBatch) {
        if batch.is_empty() {
            return;
        }
        if self.tx.send(batch).await.is_err() {
            tracing::warn!("index feed closed, dropping event batch");
        }
    }
}

/// Spawn the single-consumer indexing task.
///
/// Batches are processed in arrival order. A failed batch is dropped
/// with a logged error; the error never reaches the committer. The task
/// exits once every feed handle is dropped and the queue is drained.
pub fn spawn_indexing_task(
    synchronizer: IndexSynchronizer,
    capacity: usize,
) -> (IndexFeed, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            if let Err(e) = synchronizer.process_batch(batch).await {
                tracing::error!("index update failed, batch dropped: {}", e);
            }
        }
    });
    (IndexFeed { tx }, handle)
}
