//! Async facade over the block engine.
//!
//! The engine does blocking disk and SQLite I/O. Callers running inside a
//! tokio runtime go through [`BlockWorker`], which moves each call onto the
//! blocking thread pool.

use std::sync::Arc;

use super::assembly::AssembleReport;
use super::block::{BlockHash, PathToken};
use super::disassembly::DisassembleReport;
use super::engine::{BlockEngine, VerifiedBlock};
use super::BlockError;

#[derive(Clone, Debug)]
pub struct BlockWorker {
    engine: Arc<BlockEngine>,
}

impl BlockWorker {
    pub fn new(engine: Arc<BlockEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<BlockEngine> {
        &self.engine
    }

    async fn run<T, F>(&self, op: F) -> Result<T, BlockError>
    where
        T: Send + 'static,
        F: FnOnce(&BlockEngine) -> Result<T, BlockError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|e| BlockError::Worker(e.to_string()))?
    }

    pub async fn locate_block(&self, hash: BlockHash) -> Result<VerifiedBlock, BlockError> {
        self.run(move |engine| engine.locate_block(&hash)).await
    }

    pub async fn assemble(&self, token: PathToken) -> Result<(), BlockError> {
        self.run(move |engine| engine.assemble(&token)).await
    }

    pub async fn assemble_path(&self, path: String) -> Result<(), BlockError> {
        self.run(move |engine| engine.assemble_path(&path)).await
    }

    pub async fn assemble_pending(&self) -> Result<AssembleReport, BlockError> {
        self.run(|engine| engine.assemble_pending()).await
    }

    pub async fn disassemble(
        &self,
        path: String,
        delete_after: bool,
    ) -> Result<DisassembleReport, BlockError> {
        self.run(move |engine| engine.disassemble(&path, delete_after))
            .await
    }
}
