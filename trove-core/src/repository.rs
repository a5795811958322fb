//! Repository façade.
//!
//! Wires the consistency core together: the shared state manager, the
//! index engine resolved once from the registry, and the indexing task
//! consuming the commit feed. Sessions are created through `login`.

use crate::config::RepositoryConfig;
use crate::error::Result;
use crate::index::{IndexContext, IndexEngine, IndexEngineRegistry};
use crate::indexing::{spawn_indexing_task, IndexFeed, IndexSynchronizer};
use crate::item::NodeId;
use crate::session::Session;
use crate::store::{MemoryPersistence, PersistenceManager, StateManager};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A running repository instance
pub struct Repository {
    config: RepositoryConfig,
    store: Arc<StateManager>,
    engine: Arc<dyn IndexEngine>,
    feed: IndexFeed,
    indexing_task: Option<JoinHandle<()>>,
}

impl Repository {
    /// Open a repository with in-memory persistence
    pub async fn open(config: RepositoryConfig, registry: &IndexEngineRegistry) -> Result<Self> {
        Self::with_persistence(config, registry, Arc::new(MemoryPersistence::new())).await
    }

    /// Open a repository over an explicit persistence backend.
    ///
    /// The configured index engine name is resolved against the registry
    /// exactly once; an unknown name is a configuration error.
    pub async fn with_persistence(
        config: RepositoryConfig,
        registry: &IndexEngineRegistry,
        persistence: Arc<dyn PersistenceManager>,
    ) -> Result<Self> {
        let store = Arc::new(StateManager::new(persistence));
        let engine = registry.resolve(&config.indexing.engine, &config.indexing)?;
        engine
            .init(&IndexContext {
                workspace: config.workspace.clone(),
                excluded_paths: config.indexing.excluded_paths.clone(),
            })
            .await?;

        let synchronizer = IndexSynchronizer::new(
            engine.clone(),
            store.clone(),
            config.indexing.excluded_paths.clone(),
        );
        let (feed, indexing_task) =
            spawn_indexing_task(synchronizer, config.indexing.queue_capacity);

        tracing::info!(
            "repository '{}' open with engine '{}'",
            config.workspace,
            config.indexing.engine
        );
        Ok(Self {
            config,
            store,
            engine,
            feed,
            indexing_task: Some(indexing_task),
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// The workspace root node
    pub fn root(&self) -> NodeId {
        self.store.root()
    }

    /// The shared state manager
    pub fn store(&self) -> &Arc<StateManager> {
        &self.store
    }

    /// Create a session wired to the indexing feed
    pub fn login(&self) -> Session {
        Session::new(self.store.clone(), Some(self.feed.clone()))
    }

    /// Drain the indexing queue and release the engine.
    ///
    /// Sessions still holding the feed keep the queue open; drop them
    /// before closing.
    pub async fn close(self) -> Result<()> {
        let Repository {
            feed,
            indexing_task,
            engine,
            ..
        } = self;
        drop(feed);
        if let Some(task) = indexing_task {
            if let Err(e) = task.await {
                tracing::warn!("indexing task ended abnormally: {}", e);
            }
        }
        engine.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;

    #[tokio::test]
    async fn test_open_and_login() {
        let registry = IndexEngineRegistry::with_defaults();
        let repo = Repository::open(RepositoryConfig::default(), &registry)
            .await
            .unwrap();
        let session = repo.login();
        assert_eq!(session.root(), repo.root());
        drop(session);
        repo.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_engine_is_config_error() {
        let registry = IndexEngineRegistry::with_defaults();
        let mut config = RepositoryConfig::default();
        config.indexing.engine = "missing".to_string();
        let err = Repository::open(config, &registry).await;
        assert!(matches!(err, Err(RepositoryError::Config(_))));
    }
}
