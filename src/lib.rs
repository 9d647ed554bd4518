// syncfs - encrypted block engine for a peer-to-peer folder sync client

pub mod config;
pub mod crypto;
pub mod storage;

pub use config::EngineConfig;
pub use crypto::{content_hash, BlockCipher, EncryptionKey};
pub use storage::assembly::AssembleReport;
pub use storage::disassembly::DisassembleReport;
pub use storage::engine::VerifiedBlock;
pub use storage::indexer::IndexedFile;
pub use storage::{
    BlockEngine, BlockError, BlockHash, BlockWorker, DirEncStorage, EncStorage, MemoryEncStorage,
    MetaStore, PathToken,
};
