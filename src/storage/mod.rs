//! Storage subsystem for syncfs
//!
//! This module reconciles the plaintext "open" tree with the content-addressed,
//! encrypted block cache, using the SQLite metadata store as the map between them.

pub mod assembly;
pub mod block;
pub mod disassembly;
pub mod enc_storage;
pub mod engine;
pub mod indexer;
pub mod locator;
pub mod meta;
pub mod migrations;
pub mod worker;

use thiserror::Error;

pub use block::{BlockHash, BlockLocation, FileBlock, FileRecord, Iv, PathToken};
pub use enc_storage::{DirEncStorage, EncStorage, MemoryEncStorage};
pub use engine::BlockEngine;
pub use meta::{MetaStore, MetaTransaction};
pub use worker::BlockWorker;

/// Error types for block engine operations
#[derive(Error, Debug)]
pub enum BlockError {
    /// No recorded location produced plaintext that verifies against this hash.
    #[error("No such block: {0}")]
    NoSuchBlock(BlockHash),

    /// The encrypted block cache does not (yet) hold this block.
    #[error("Block unavailable in cache: {0}")]
    BlockUnavailable(BlockHash),

    #[error("Verification mismatch: expected {expected}, computed {actual}")]
    VerificationMismatch { expected: BlockHash, actual: BlockHash },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error("Schema migration error: {0}")]
    Migration(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Invalid block list: {0}")]
    InvalidBlockList(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock poisoned: {0}")]
    Poisoned(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl BlockError {
    /// Whether the caller can expect the operation to succeed once blocks
    /// have been fetched or the file system settles.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BlockError::NoSuchBlock(_)
                | BlockError::BlockUnavailable(_)
                | BlockError::VerificationMismatch { .. }
                | BlockError::Io(_)
        )
    }
}

impl From<rusqlite_migration::Error> for BlockError {
    fn from(e: rusqlite_migration::Error) -> Self {
        BlockError::Migration(e.to_string())
    }
}
