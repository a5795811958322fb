//! Trove Core Library
//!
//! Consistency core of a hierarchical content repository:
//! - Item identity and typed property values
//! - Copy-on-write transient overlays with optimistic commit
//! - Shared persistent-state registry with per-item commit sections
//! - Value coercion for typed property assignment
//! - Observation events and the incremental index synchronizer
//! - Pluggable persistence and index-engine contracts

pub mod coerce;
pub mod config;
pub mod durable;
pub mod error;
pub mod event;
pub mod index;
pub mod indexing;
pub mod item;
pub mod repository;
pub mod session;
pub mod state;
pub mod store;
pub mod value;

pub use coerce::{coerce_values, resolve_type, ReferenceResolver};
pub use config::{IndexingConfig, RepositoryConfig};
pub use durable::FjallPersistence;
pub use error::{RepositoryError, Result};
pub use event::{Event, EventBatch, EventCollector, EventType};
pub use index::{IndexContext, IndexEngine, IndexEngineRegistry, MemoryIndexEngine};
pub use indexing::{spawn_indexing_task, IndexFeed, IndexSynchronizer};
pub use item::{ItemId, ItemStatus, NodeId, PropertyId, SessionId};
pub use repository::Repository;
pub use session::Session;
pub use state::{
    NodeRecord, NodeSnapshot, PersistentNode, PersistentProperty, PropertyDefinition,
    PropertySnapshot, TransientNode, TransientProperty, TransientSnapshot,
};
pub use store::{MemoryPersistence, PersistenceManager, StateManager};
pub use value::{BinaryValue, InternalValue, PropertyType, TempBlob};
