//! Encrypted block cache
//!
//! The cache holds ciphertext keyed by content address and is the surface the
//! network layer serves blocks from. Implementations must tolerate concurrent
//! `has`/`get`/`put` from several engine calls; a duplicate `put` of the same
//! address is harmless because the content is identical.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::block::BlockHash;
use super::BlockError;

/// Trait for encrypted block caches
pub trait EncStorage: Send + Sync {
    /// Check if a block is present
    fn has(&self, hash: &BlockHash) -> Result<bool, BlockError>;

    /// Fetch a block's ciphertext, failing with `BlockUnavailable` if absent
    fn get(&self, hash: &BlockHash) -> Result<Vec<u8>, BlockError>;

    /// Store a block's ciphertext under its address
    fn put(&self, hash: &BlockHash, ciphertext: &[u8]) -> Result<(), BlockError>;

    /// Drop a block from the cache; removing an absent block is not an error
    fn remove(&self, hash: &BlockHash) -> Result<(), BlockError>;
}

/// A block cache that keeps one file per block on the local file system.
///
/// Layout: `{root}/{hex[0..2]}/{hex}`.
#[derive(Debug)]
pub struct DirEncStorage {
    root: PathBuf,
}

impl DirEncStorage {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, BlockError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path for a specific block
    fn block_path(&self, hash: &BlockHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[0..2]).join(hex)
    }
}

impl EncStorage for DirEncStorage {
    fn has(&self, hash: &BlockHash) -> Result<bool, BlockError> {
        Ok(self.block_path(hash).is_file())
    }

    fn get(&self, hash: &BlockHash) -> Result<Vec<u8>, BlockError> {
        match std::fs::read(self.block_path(hash)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlockError::BlockUnavailable(*hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, hash: &BlockHash, ciphertext: &[u8]) -> Result<(), BlockError> {
        let path = self.block_path(hash);
        let dir = path
            .parent()
            .ok_or_else(|| BlockError::InvalidPath(path.display().to_string()))?;
        std::fs::create_dir_all(dir)?;

        // Write beside the final name and rename, so readers never see a
        // half-written block.
        let mut staging = tempfile::Builder::new()
            .prefix(".put-")
            .tempfile_in(dir)?;
        staging.write_all(ciphertext)?;
        staging.as_file().sync_all()?;
        staging.persist(&path).map_err(|e| BlockError::Io(e.error))?;

        log::debug!("Cached block {} ({} bytes)", hash, ciphertext.len());
        Ok(())
    }

    fn remove(&self, hash: &BlockHash) -> Result<(), BlockError> {
        match std::fs::remove_file(self.block_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory block cache.
#[derive(Debug, Default)]
pub struct MemoryEncStorage {
    blocks: RwLock<HashMap<BlockHash, Vec<u8>>>,
}

impl MemoryEncStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize, BlockError> {
        let blocks = self.blocks.read().map_err(|_| Self::poisoned())?;
        Ok(blocks.len())
    }

    pub fn is_empty(&self) -> Result<bool, BlockError> {
        Ok(self.len()? == 0)
    }

    fn poisoned() -> BlockError {
        BlockError::Poisoned("memory block cache".to_string())
    }
}

impl EncStorage for MemoryEncStorage {
    fn has(&self, hash: &BlockHash) -> Result<bool, BlockError> {
        let blocks = self.blocks.read().map_err(|_| Self::poisoned())?;
        Ok(blocks.contains_key(hash))
    }

    fn get(&self, hash: &BlockHash) -> Result<Vec<u8>, BlockError> {
        let blocks = self.blocks.read().map_err(|_| Self::poisoned())?;
        blocks
            .get(hash)
            .cloned()
            .ok_or(BlockError::BlockUnavailable(*hash))
    }

    fn put(&self, hash: &BlockHash, ciphertext: &[u8]) -> Result<(), BlockError> {
        let mut blocks = self.blocks.write().map_err(|_| Self::poisoned())?;
        blocks.insert(*hash, ciphertext.to_vec());
        Ok(())
    }

    fn remove(&self, hash: &BlockHash) -> Result<(), BlockError> {
        let mut blocks = self.blocks.write().map_err(|_| Self::poisoned())?;
        blocks.remove(hash);
        Ok(())
    }
}
