//! Engine configuration
//!
//! Loaded from a JSON file; every field has a default, so a partial file (or
//! `{}`) is valid.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionKey;
use crate::storage::block::DEFAULT_BLOCK_SIZE;
use crate::storage::{BlockEngine, BlockError, DirEncStorage, MetaStore};

/// Configuration for a syncfs folder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the plaintext tree users edit
    pub open_path: PathBuf,

    /// Directory of the encrypted block cache
    pub block_path: PathBuf,

    /// SQLite metadata database
    pub db_path: PathBuf,

    /// File holding the hex-encoded folder encryption key
    pub key_file: PathBuf,

    /// Plaintext block size used when indexing files
    pub block_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = PathBuf::from("./syncfs_data");
        Self {
            open_path: base.join("open"),
            block_path: base.join("blocks"),
            db_path: base.join("syncfs.db"),
            key_file: base.join("key"),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, BlockError> {
        let data = std::fs::read(path).map_err(|e| {
            BlockError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&data).map_err(|e| {
            BlockError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), BlockError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| BlockError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BlockError> {
        if self.block_size == 0 {
            return Err(BlockError::Config("block_size must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Open the metadata store and block cache and build an engine over them.
    pub fn open_engine(&self) -> Result<BlockEngine, BlockError> {
        self.validate()?;
        let key = EncryptionKey::load(&self.key_file).map_err(|e| {
            BlockError::Config(format!(
                "Failed to load key from {}: {}",
                self.key_file.display(),
                e
            ))
        })?;
        std::fs::create_dir_all(&self.open_path)?;

        let meta = Arc::new(MetaStore::open(&self.db_path)?);
        let cache = Arc::new(DirEncStorage::new(&self.block_path)?);
        Ok(BlockEngine::new(self.open_path.clone(), key, meta, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "block_size": 4096 }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.open_path, EngineConfig::default().open_path);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = EngineConfig {
            open_path: dir.path().join("open"),
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_configs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{ "block_size": 0 }"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(BlockError::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(BlockError::Config(_))));
    }

    #[test]
    fn test_open_engine_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig {
            open_path: dir.path().join("open"),
            block_path: dir.path().join("blocks"),
            db_path: dir.path().join("syncfs.db"),
            key_file: dir.path().join("key"),
            block_size: 16,
        };
        assert!(matches!(config.open_engine(), Err(BlockError::Config(_))));

        std::fs::write(&config.key_file, EncryptionKey::generate().to_hex()).unwrap();
        let engine = config.open_engine().unwrap();
        assert_eq!(engine.open_path(), dir.path().join("open"));
        assert!(dir.path().join("blocks").is_dir());

        config.block_size = 0;
        assert!(config.open_engine().is_err());
    }
}
