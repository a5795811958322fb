//! Durable persistence backend using Fjall LSM-tree.
//!
//! Write-through store for committed item states. Records are
//! bincode-encoded and keyed by item id; node and property records live
//! in separate keyspaces.

use crate::error::{RepositoryError, Result};
use crate::item::{NodeId, PropertyId};
use crate::state::{PersistentNode, PersistentProperty};
use crate::store::PersistenceManager;
use async_trait::async_trait;
use std::sync::Arc;

/// Fjall-backed persistence
pub struct FjallPersistence {
    db: Arc<fjall::Database>,
    nodes: Arc<fjall::Keyspace>,
    properties: Arc<fjall::Keyspace>,
}

impl FjallPersistence {
    /// Open or create the state store at the given path
    pub fn open(path: &str) -> Result<Self> {
        let db = fjall::Database::builder(path)
            .open()
            .map_err(|e| RepositoryError::Backend(format!("Failed to open state store: {}", e)))?;

        let nodes = db
            .keyspace("nodes", || fjall::KeyspaceCreateOptions::default())
            .map_err(|e| RepositoryError::Backend(format!("Failed to open nodes keyspace: {}", e)))?;

        let properties = db
            .keyspace("properties", || fjall::KeyspaceCreateOptions::default())
            .map_err(|e| {
                RepositoryError::Backend(format!("Failed to open properties keyspace: {}", e))
            })?;

        Ok(Self {
            db: Arc::new(db),
            nodes: Arc::new(nodes),
            properties: Arc::new(properties),
        })
    }

    /// Flush all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.db
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| RepositoryError::Backend(format!("Failed to persist: {}", e)))?;
        Ok(())
    }

    fn property_key(id: &PropertyId) -> String {
        format!("{}:{}", id.parent, id.name)
    }
}

#[async_trait]
impl PersistenceManager for FjallPersistence {
    async fn store_node(&self, record: &PersistentNode) -> Result<()> {
        let key = record.record.id.to_string();
        let value = bincode::serialize(record)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        self.nodes
            .insert(&key, value.as_slice())
            .map_err(|e| RepositoryError::Backend(format!("Node store failed: {}", e)))?;
        Ok(())
    }

    async fn store_property(&self, record: &PersistentProperty) -> Result<()> {
        let key = Self::property_key(&record.snapshot.id);
        let value = bincode::serialize(record)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        self.properties
            .insert(&key, value.as_slice())
            .map_err(|e| RepositoryError::Backend(format!("Property store failed: {}", e)))?;
        Ok(())
    }

    async fn remove_node(&self, id: NodeId) -> Result<()> {
        self.nodes
            .remove(&id.to_string())
            .map_err(|e| RepositoryError::Backend(format!("Node remove failed: {}", e)))?;
        Ok(())
    }

    async fn remove_property(&self, id: &PropertyId) -> Result<()> {
        self.properties
            .remove(&Self::property_key(id))
            .map_err(|e| RepositoryError::Backend(format!("Property remove failed: {}", e)))?;
        Ok(())
    }

    async fn load_node(&self, id: NodeId) -> Result<Option<PersistentNode>> {
        let value = self
            .nodes
            .get(&id.to_string())
            .map_err(|e| RepositoryError::Backend(format!("Node load failed: {}", e)))?;
        match value {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes.to_vec())
                    .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn load_property(&self, id: &PropertyId) -> Result<Option<PersistentProperty>> {
        let value = self
            .properties
            .get(&Self::property_key(id))
            .map_err(|e| RepositoryError::Backend(format!("Property load failed: {}", e)))?;
        match value {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes.to_vec())
                    .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemStatus;
    use crate::state::{NodeRecord, PropertySnapshot};
    use crate::value::InternalValue;

    #[tokio::test]
    async fn test_property_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallPersistence::open(dir.path().to_str().unwrap()).unwrap();

        let id = PropertyId::new(NodeId::generate(), "title");
        let mut snapshot = PropertySnapshot::empty(id.clone());
        snapshot.values = vec![InternalValue::String("hello".to_string())];
        let record = PersistentProperty {
            snapshot,
            version: 1,
            status: ItemStatus::Existing,
        };

        store.store_property(&record).await.unwrap();
        let loaded = store.load_property(&id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.snapshot.values, record.snapshot.values);
    }

    #[tokio::test]
    async fn test_node_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let record = PersistentNode {
            record: NodeRecord::root(),
            version: 1,
            status: ItemStatus::Existing,
        };
        let id = record.record.id;

        {
            let store = FjallPersistence::open(&path).unwrap();
            store.store_node(&record).await.unwrap();
            store.persist().unwrap();
        }

        let store = FjallPersistence::open(&path).unwrap();
        let loaded = store.load_node(id).await.unwrap().unwrap();
        assert_eq!(loaded.record.path, "/");
    }

    #[tokio::test]
    async fn test_remove_property() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallPersistence::open(dir.path().to_str().unwrap()).unwrap();

        let id = PropertyId::new(NodeId::generate(), "title");
        let record = PersistentProperty {
            snapshot: PropertySnapshot::empty(id.clone()),
            version: 1,
            status: ItemStatus::Existing,
        };
        store.store_property(&record).await.unwrap();
        store.remove_property(&id).await.unwrap();
        assert!(store.load_property(&id).await.unwrap().is_none());
    }
}
