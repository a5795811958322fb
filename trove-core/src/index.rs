//! Index engine contract and registry.
//!
//! The core never patches index documents: an id present in both the
//! removed and added collections of an update must be deleted and then
//! reinserted by the engine, so stale terms from the prior version of a
//! changed node are fully purged before new terms are added.

use crate::config::IndexingConfig;
use crate::error::{RepositoryError, Result};
use crate::item::NodeId;
use crate::state::NodeSnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Context handed to an engine at startup
#[derive(Debug, Clone)]
pub struct IndexContext {
    pub workspace: String,
    pub excluded_paths: Vec<String>,
}

/// Abstract consumer of incremental add/remove instructions
#[async_trait]
pub trait IndexEngine: Send + Sync {
    /// Prepare the engine for the given workspace
    async fn init(&self, context: &IndexContext) -> Result<()>;

    /// Apply one incremental update.
    ///
    /// Ids in `removed` are deleted first; every id appearing in both
    /// collections must be deleted and reinserted, never patched in
    /// place.
    async fn update_nodes(&self, removed: Vec<NodeId>, added: Vec<NodeSnapshot>) -> Result<()>;

    /// Release engine resources
    async fn close(&self) -> Result<()>;
}

/// Factory for a named engine, resolved once at startup
pub type IndexEngineFactory =
    Arc<dyn Fn(&IndexingConfig) -> Result<Arc<dyn IndexEngine>> + Send + Sync>;

/// Registry of engine factories keyed by configured name
#[derive(Default)]
pub struct IndexEngineRegistry {
    factories: HashMap<String, IndexEngineFactory>,
}

impl IndexEngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in engines registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |_config| {
            Ok(Arc::new(MemoryIndexEngine::new()) as Arc<dyn IndexEngine>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&IndexingConfig) -> Result<Arc<dyn IndexEngine>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Build the engine registered under the configured name
    pub fn resolve(&self, name: &str, config: &IndexingConfig) -> Result<Arc<dyn IndexEngine>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            RepositoryError::Config(format!("no index engine registered under '{}'", name))
        })?;
        factory(config)
    }
}

/// Reference engine holding documents in memory
#[derive(Default)]
pub struct MemoryIndexEngine {
    documents: RwLock<HashMap<NodeId, NodeSnapshot>>,
}

impl MemoryIndexEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current document for a node, if indexed
    pub async fn document(&self, id: NodeId) -> Option<NodeSnapshot> {
        self.documents.read().await.get(&id).cloned()
    }

    /// Number of indexed documents
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl IndexEngine for MemoryIndexEngine {
    async fn init(&self, context: &IndexContext) -> Result<()> {
        tracing::debug!("memory index engine ready for workspace {}", context.workspace);
        Ok(())
    }

    async fn update_nodes(&self, removed: Vec<NodeId>, added: Vec<NodeSnapshot>) -> Result<()> {
        let mut documents = self.documents.write().await;
        for id in &removed {
            documents.remove(id);
        }
        for snapshot in added {
            documents.insert(snapshot.id, snapshot);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
