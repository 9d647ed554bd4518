//! File disassembly: push a plaintext file's blocks into the encrypted cache.
//!
//! Used before a file leaves the open tree (replaced by a newer version or
//! evicted) so peers can still fetch blocks that only ever existed inside it.

use super::block::FileBlock;
use super::engine::{normalize_relative, BlockEngine, VerifiedBlock};
use super::BlockError;

/// Outcome of [`BlockEngine::disassemble`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisassembleReport {
    /// Blocks encrypted and written to the cache by this call.
    pub stored: usize,
    /// Blocks the cache already held.
    pub already_cached: usize,
    /// Whether the plaintext file was removed afterwards.
    pub deleted: bool,
}

impl BlockEngine {
    /// Make sure every block of `path` is in the cache, then optionally
    /// remove the file.
    ///
    /// If a block can't be verified from `path` itself, the other recorded
    /// locations are tried. A block no location can produce aborts the call
    /// with `NoSuchBlock` before anything is deleted; blocks cached so far stay
    /// cached, so a retry only does the remaining work.
    pub fn disassemble(
        &self,
        path: &str,
        delete_after: bool,
    ) -> Result<DisassembleReport, BlockError> {
        let relative = normalize_relative(path)?;
        let token = self.cipher.path_token(&relative)?;
        let (record, blocks) = self.snapshot(&token)?;

        let mut report = DisassembleReport::default();
        for block in &blocks {
            if self.cache.has(&block.hash)? {
                report.already_cached += 1;
                continue;
            }
            let verified = self.verify_for_disassembly(&record.path, block)?;
            self.cache.put(&block.hash, &verified.ciphertext)?;
            report.stored += 1;
        }

        if delete_after {
            // Flag first: a crash before the removal leaves a present file
            // marked unassembled, which the next assembly overwrites.
            self.meta.set_assembled(&token, false)?;
            let absolute = self.absolute_path(&record.path)?;
            match std::fs::remove_file(&absolute) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            report.deleted = true;
        }

        log::info!(
            "Disassembled {}: {} blocks stored, {} already cached{}",
            record.path,
            report.stored,
            report.already_cached,
            if report.deleted { ", file removed" } else { "" }
        );
        Ok(report)
    }

    fn verify_for_disassembly(
        &self,
        path: &str,
        block: &FileBlock,
    ) -> Result<VerifiedBlock, BlockError> {
        match self.read_verified(&block.location_in(path), &block.hash) {
            Ok(verified) => Ok(verified),
            Err(e) => {
                log::warn!(
                    "Block {} at {}@{} does not verify ({}), trying other locations",
                    block.hash,
                    path,
                    block.offset,
                    e
                );
                self.locate_block(&block.hash)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::storage::block::DEFAULT_BLOCK_SIZE;
    use crate::storage::enc_storage::{EncStorage, MemoryEncStorage};
    use crate::storage::meta::MetaStore;

    fn engine(root: &std::path::Path) -> BlockEngine {
        BlockEngine::new(
            root,
            EncryptionKey::from_bytes([5u8; 32]),
            Arc::new(MetaStore::open_in_memory().unwrap()),
            Arc::new(MemoryEncStorage::new()),
        )
    }

    #[test]
    fn test_disassemble_caches_every_block() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        std::fs::write(dir.path().join("f.bin"), vec![42u8; 10]).unwrap();
        let indexed = engine.index_file("f.bin", 4).unwrap();

        let report = engine.disassemble("f.bin", false).unwrap();
        assert_eq!(report.stored, 3);
        assert_eq!(report.already_cached, 0);
        assert!(!report.deleted);
        for block in &indexed.blocks {
            assert!(engine.cache.has(&block.hash).unwrap());
        }
        assert!(dir.path().join("f.bin").exists());
    }

    #[test]
    fn test_disassemble_delete_clears_flag_then_removes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        std::fs::write(dir.path().join("f.bin"), b"some content").unwrap();
        let indexed = engine.index_file("f.bin", DEFAULT_BLOCK_SIZE).unwrap();

        let report = engine.disassemble("f.bin", true).unwrap();
        assert!(report.deleted);
        assert!(!dir.path().join("f.bin").exists());
        let record = engine.meta.file(&indexed.record.path_token).unwrap().unwrap();
        assert!(!record.assembled);
    }

    #[test]
    fn test_stale_file_falls_back_to_other_location() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        std::fs::write(dir.path().join("a.bin"), b"identical").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"identical").unwrap();
        let a = engine.index_file("a.bin", DEFAULT_BLOCK_SIZE).unwrap();
        // Re-record b.bin with a's block so both share one hash
        engine
            .meta
            .put_file(
                &crate::storage::block::FileRecord {
                    path_token: engine.path_token("b.bin").unwrap(),
                    path: "b.bin".to_string(),
                    assembled: true,
                },
                &a.blocks,
            )
            .unwrap();

        std::fs::write(dir.path().join("a.bin"), b"rewritten").unwrap();
        let report = engine.disassemble("a.bin", false).unwrap();
        assert_eq!(report.stored, 1);
        assert!(engine.cache.has(&a.blocks[0].hash).unwrap());
    }

    #[test]
    fn test_unverifiable_block_aborts_without_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        std::fs::write(dir.path().join("f.bin"), b"original").unwrap();
        let indexed = engine.index_file("f.bin", DEFAULT_BLOCK_SIZE).unwrap();
        std::fs::write(dir.path().join("f.bin"), b"modified").unwrap();

        let result = engine.disassemble("f.bin", true);
        assert!(matches!(result, Err(BlockError::NoSuchBlock(_))));
        assert!(dir.path().join("f.bin").exists());
        assert!(!engine.cache.has(&indexed.blocks[0].hash).unwrap());
        let record = engine.meta.file(&indexed.record.path_token).unwrap().unwrap();
        assert!(record.assembled);
    }

    #[test]
    fn test_unknown_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        std::fs::write(dir.path().join("untracked"), b"x").unwrap();

        assert!(matches!(
            engine.disassemble("untracked", true),
            Err(BlockError::UnknownFile(_))
        ));
        assert!(dir.path().join("untracked").exists());
    }
}
