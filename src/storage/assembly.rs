//! File assembly: rebuild plaintext files from the encrypted block cache.
//!
//! Output is staged in a temporary file beside the target. Only after every
//! block has been fetched, authenticated and written is the staging file
//! renamed over the target, and the `assembled` flag set, under one metadata
//! transaction. On any failure the staging file is dropped and neither the
//! target nor the flag changes.
//!
//! The rename and the flag update touch two different resources, so a crash
//! between them leaves a correct file still flagged as not assembled. The
//! next assembly simply rewrites it.

use std::io::{BufWriter, Write};

use crate::crypto::content_hash;

use super::block::{check_contiguous, FileBlock, FileRecord, PathToken};
use super::engine::BlockEngine;
use super::BlockError;

/// Outcome of [`BlockEngine::assemble_pending`].
#[derive(Debug, Default)]
pub struct AssembleReport {
    /// Relative paths that were written and flagged as assembled.
    pub assembled: Vec<String>,
    /// Relative paths that could not be assembled, with the reason.
    pub failed: Vec<(String, BlockError)>,
}

impl AssembleReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl BlockEngine {
    /// Rebuild the file identified by `token` from cached blocks.
    pub fn assemble(&self, token: &PathToken) -> Result<(), BlockError> {
        let (record, blocks) = self.snapshot(token)?;
        let total = check_contiguous(&blocks).map_err(BlockError::InvalidBlockList)?;

        let target = self.absolute_path(&record.path)?;
        let dir = target
            .parent()
            .ok_or_else(|| BlockError::InvalidPath(record.path.clone()))?;
        std::fs::create_dir_all(dir)?;

        let mut staging = tempfile::Builder::new()
            .prefix(".syncfs-")
            .suffix(".part")
            .tempfile_in(dir)?;
        {
            let mut writer = BufWriter::new(staging.as_file_mut());
            for block in &blocks {
                let plaintext = self.fetch_plaintext(block)?;
                writer.write_all(&plaintext)?;
            }
            writer.flush()?;
        }
        staging.as_file().sync_all()?;

        let tx = self.meta.transaction()?;
        // Refuse to flag a file whose block list moved on while we were writing.
        if tx.block_list_for_file(token)? != blocks {
            return Err(BlockError::InvalidBlockList(format!(
                "block list of {} changed during assembly",
                record.path
            )));
        }
        staging
            .persist(&target)
            .map_err(|e| BlockError::Io(e.error))?;
        tx.set_assembled(token, true)?;
        tx.commit()?;

        log::info!(
            "Assembled {} ({} blocks, {} bytes)",
            record.path,
            blocks.len(),
            total
        );
        Ok(())
    }

    /// Rebuild a file by its relative path.
    pub fn assemble_path(&self, path: &str) -> Result<(), BlockError> {
        let token = self.path_token(path)?;
        self.assemble(&token)
    }

    /// Assemble every file not currently flagged as assembled.
    ///
    /// Failures are collected per file; one missing block does not hold back
    /// the rest of the tree.
    pub fn assemble_pending(&self) -> Result<AssembleReport, BlockError> {
        let pending: Vec<FileRecord> = self.meta.pending_files()?;
        let mut report = AssembleReport::default();

        for record in pending {
            match self.assemble(&record.path_token) {
                Ok(()) => report.assembled.push(record.path),
                Err(e) => {
                    log::warn!("Could not assemble {}: {}", record.path, e);
                    report.failed.push((record.path, e));
                }
            }
        }
        Ok(report)
    }

    /// Fetch a block's ciphertext from the cache and decrypt it.
    fn fetch_plaintext(&self, block: &FileBlock) -> Result<Vec<u8>, BlockError> {
        let ciphertext = self.cache.get(&block.hash)?;

        let actual = content_hash(&ciphertext);
        if actual != block.hash {
            log::warn!(
                "Cached block {} is corrupt (hashes to {}), treating as unavailable",
                block.hash,
                actual
            );
            return Err(BlockError::BlockUnavailable(block.hash));
        }

        let plaintext = self.cipher.decrypt(&block.iv, &ciphertext)?;
        if plaintext.len() as u64 != block.size {
            return Err(BlockError::InvalidBlockList(format!(
                "block {} decrypts to {} bytes, recorded size is {}",
                block.hash,
                plaintext.len(),
                block.size
            )));
        }
        Ok(plaintext)
    }
}
