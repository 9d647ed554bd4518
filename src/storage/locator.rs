//! Block lookup from plaintext in the open tree.
//!
//! A block hash may be recorded at several places (the same bytes in several
//! files, or stale rows for files that have since changed). Candidates are tried
//! in store order and the first one that re-encrypts to the requested hash wins.

use super::block::BlockHash;
use super::engine::{BlockEngine, VerifiedBlock};
use super::BlockError;

impl BlockEngine {
    /// Find a verified plaintext/ciphertext pair for `hash` in the open tree.
    ///
    /// Unreadable and stale candidates are skipped; only when every candidate
    /// has been tried does this fail, with `NoSuchBlock`.
    pub fn locate_block(&self, hash: &BlockHash) -> Result<VerifiedBlock, BlockError> {
        let candidates = self.meta.blocks_for_hash(hash)?;
        log::debug!("Locating block {} ({} candidates)", hash, candidates.len());

        candidates
            .iter()
            .find_map(|location| match self.read_verified(location, hash) {
                Ok(verified) => Some(verified),
                Err(e) => {
                    log::debug!(
                        "Skipping candidate {}@{} for block {}: {}",
                        location.path,
                        location.offset,
                        hash,
                        e
                    );
                    None
                }
            })
            .ok_or(BlockError::NoSuchBlock(*hash))
    }

    /// Plaintext half of [`locate_block`](Self::locate_block).
    pub fn get_block(&self, hash: &BlockHash) -> Result<Vec<u8>, BlockError> {
        self.locate_block(hash).map(|verified| verified.plaintext)
    }

    /// Ciphertext half of [`locate_block`](Self::locate_block).
    pub fn get_encblock(&self, hash: &BlockHash) -> Result<Vec<u8>, BlockError> {
        self.locate_block(hash).map(|verified| verified.ciphertext)
    }
}
