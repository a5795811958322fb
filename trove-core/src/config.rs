//! Repository configuration.
//!
//! Stored at `<repo>/config.json`. Absent files yield the defaults;
//! saves go through a temp file and rename.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Index synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Registered engine name, resolved once at startup
    pub engine: String,
    /// Subtrees beneath which changes are never indexed
    #[serde(default)]
    pub excluded_paths: Vec<String>,
    /// Capacity of the commit-to-indexer queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    128
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            engine: "memory".to_string(),
            excluded_paths: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Top-level repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Workspace name
    pub workspace: String,
    #[serde(default)]
    pub indexing: IndexingConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            workspace: "default".to_string(),
            indexing: IndexingConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Load configuration from a repository path
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join("config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        let config: RepositoryConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse config JSON")?;
        Ok(config)
    }

    /// Save configuration to a repository path
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join("config.json");
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = RepositoryConfig::load(tmp.path()).unwrap();
        assert_eq!(config.workspace, "default");
        assert_eq!(config.indexing.engine, "memory");
        assert!(config.indexing.excluded_paths.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let config = RepositoryConfig {
            workspace: "content".to_string(),
            indexing: IndexingConfig {
                engine: "memory".to_string(),
                excluded_paths: vec!["/system".to_string()],
                queue_capacity: 16,
            },
        };
        config.save(tmp.path()).unwrap();

        let loaded = RepositoryConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.workspace, "content");
        assert_eq!(loaded.indexing.excluded_paths, vec!["/system".to_string()]);
        assert_eq!(loaded.indexing.queue_capacity, 16);
    }
}
