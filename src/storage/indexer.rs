//! Record a plaintext file as a list of encrypted blocks.
//!
//! Splits the file into fixed-size chunks, gives each a fresh IV and derives
//! its content address. The file is recorded as assembled, since the bytes on
//! disk are the ones the block list was computed from.

use std::fs::File;
use std::io::{BufReader, Read};

use crate::crypto::content_hash;

use super::block::{FileBlock, FileRecord, Iv};
use super::engine::{normalize_relative, BlockEngine};
use super::BlockError;

/// A freshly indexed file and its block list.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub record: FileRecord,
    pub blocks: Vec<FileBlock>,
}

impl IndexedFile {
    pub fn size(&self) -> u64 {
        self.blocks.last().and_then(FileBlock::end).unwrap_or(0)
    }
}

impl BlockEngine {
    /// Index `path` (relative to the open root) into blocks of `block_size`
    /// bytes, replacing any previous record for it.
    pub fn index_file(&self, path: &str, block_size: usize) -> Result<IndexedFile, BlockError> {
        if block_size == 0 {
            return Err(BlockError::Config("block size must be non-zero".to_string()));
        }
        let relative = normalize_relative(path)?;
        let mut reader = BufReader::new(File::open(self.absolute_path(&relative)?)?);

        let mut blocks = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut chunk = Vec::new();
            reader
                .by_ref()
                .take(block_size as u64)
                .read_to_end(&mut chunk)?;
            if chunk.is_empty() {
                break;
            }

            let iv = Iv::random();
            let ciphertext = self.cipher.encrypt(&iv, &chunk)?;
            let size = chunk.len() as u64;
            blocks.push(FileBlock {
                hash: content_hash(&ciphertext),
                offset,
                size,
                iv,
            });
            offset += size;
        }

        let record = FileRecord {
            path_token: self.cipher.path_token(&relative)?,
            path: relative,
            assembled: true,
        };
        self.meta.put_file(&record, &blocks)?;

        log::debug!(
            "Indexed {} into {} blocks ({} bytes)",
            record.path,
            blocks.len(),
            offset
        );
        Ok(IndexedFile { record, blocks })
    }
}
