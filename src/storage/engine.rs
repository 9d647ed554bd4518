//! The block engine: moves data between the open tree and the encrypted cache.
//!
//! Operations are split across sibling modules (`locator`, `assembly`,
//! `disassembly`, `indexer`); this module holds the shared state and the one
//! read-and-verify path they all go through.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::crypto::{content_hash, BlockCipher, EncryptionKey};

use super::block::{BlockHash, BlockLocation, FileBlock, FileRecord, PathToken};
use super::enc_storage::EncStorage;
use super::meta::MetaStore;
use super::BlockError;

/// Plaintext and ciphertext of a block whose content address has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedBlock {
    pub plaintext: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Synchronous block engine. Cheap to share behind an `Arc`; every method
/// takes `&self` and may be called from several threads at once.
pub struct BlockEngine {
    pub(crate) cipher: BlockCipher,
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) cache: Arc<dyn EncStorage>,
    open_path: PathBuf,
}

impl BlockEngine {
    pub fn new<P: Into<PathBuf>>(
        open_path: P,
        key: EncryptionKey,
        meta: Arc<MetaStore>,
        cache: Arc<dyn EncStorage>,
    ) -> Self {
        Self {
            cipher: BlockCipher::new(key),
            meta,
            cache,
            open_path: open_path.into(),
        }
    }

    /// Root of the plaintext tree.
    pub fn open_path(&self) -> &Path {
        &self.open_path
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn cache(&self) -> &Arc<dyn EncStorage> {
        &self.cache
    }

    /// Path token for a path relative to the open root.
    pub fn path_token(&self, path: &str) -> Result<PathToken, BlockError> {
        let normalized = normalize_relative(path)?;
        self.cipher.path_token(&normalized)
    }

    /// Resolve a stored relative path under the open root.
    pub(crate) fn absolute_path(&self, relative: &str) -> Result<PathBuf, BlockError> {
        let normalized = normalize_relative(relative)?;
        Ok(normalized
            .split('/')
            .fold(self.open_path.clone(), |acc, part| acc.join(part)))
    }

    /// Read a file's record and block list under one metadata lock.
    pub(crate) fn snapshot(
        &self,
        token: &PathToken,
    ) -> Result<(FileRecord, Vec<FileBlock>), BlockError> {
        let tx = self.meta.transaction()?;
        let record = tx
            .file(token)?
            .ok_or_else(|| BlockError::UnknownFile(token.to_hex()))?;
        let blocks = tx.block_list_for_file(token)?;
        tx.commit()?;
        Ok((record, blocks))
    }

    /// Read `size` bytes at `offset` from a candidate location.
    fn read_plaintext(&self, location: &BlockLocation) -> Result<Vec<u8>, BlockError> {
        let path = self.absolute_path(&location.path)?;
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;

        let mut buf = Vec::new();
        file.take(location.size).read_to_end(&mut buf)?;
        if buf.len() as u64 != location.size {
            return Err(BlockError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} is truncated: wanted {} bytes at offset {}, got {}",
                    location.path,
                    location.size,
                    location.offset,
                    buf.len()
                ),
            )));
        }
        Ok(buf)
    }

    /// Read a block from one location, re-encrypt it, and check that the
    /// result hashes to `expected`.
    ///
    /// This is the only place plaintext from the open tree is turned into
    /// ciphertext, so the locator and the disassembler reject exactly the
    /// same inputs.
    pub(crate) fn read_verified(
        &self,
        location: &BlockLocation,
        expected: &BlockHash,
    ) -> Result<VerifiedBlock, BlockError> {
        let plaintext = self.read_plaintext(location)?;
        let ciphertext = self.cipher.encrypt(&location.iv, &plaintext)?;
        let actual = content_hash(&ciphertext);
        if actual != *expected {
            return Err(BlockError::VerificationMismatch {
                expected: *expected,
                actual,
            });
        }
        Ok(VerifiedBlock {
            plaintext,
            ciphertext,
        })
    }
}

impl std::fmt::Debug for BlockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEngine")
            .field("open_path", &self.open_path)
            .finish_non_exhaustive()
    }
}

/// Normalize a path relative to the open root into the `/`-separated form
/// stored in metadata. Absolute paths and `..` are rejected.
pub fn normalize_relative(path: &str) -> Result<String, BlockError> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| BlockError::InvalidPath(format!("{:?} is not UTF-8", path)))?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(BlockError::InvalidPath(format!(
                    "{} escapes the open root",
                    path
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(BlockError::InvalidPath(format!("{:?} names no file", path)));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::Iv;
    use crate::storage::enc_storage::MemoryEncStorage;

    fn engine(root: &Path) -> BlockEngine {
        BlockEngine::new(
            root,
            EncryptionKey::from_bytes([7u8; 32]),
            Arc::new(MetaStore::open_in_memory().unwrap()),
            Arc::new(MemoryEncStorage::new()),
        )
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_relative("./a//b.txt").unwrap(), "a/b.txt");
        assert!(normalize_relative("../a").is_err());
        assert!(normalize_relative("a/../../b").is_err());
        assert!(normalize_relative("/etc/passwd").is_err());
        assert!(normalize_relative("").is_err());
        assert!(normalize_relative(".").is_err());
    }

    #[test]
    fn test_path_token_ignores_spelling() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert_eq!(
            engine.path_token("./docs/a.txt").unwrap(),
            engine.path_token("docs/a.txt").unwrap()
        );
    }

    #[test]
    fn test_read_verified_accepts_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        std::fs::write(dir.path().join("f.bin"), b"0123456789").unwrap();

        let iv = Iv([4u8; 12]);
        let expected = content_hash(&engine.cipher.encrypt(&iv, b"3456").unwrap());
        let location = BlockLocation {
            path: "f.bin".to_string(),
            offset: 3,
            size: 4,
            iv,
        };

        let verified = engine.read_verified(&location, &expected).unwrap();
        assert_eq!(verified.plaintext, b"3456");
        assert_eq!(content_hash(&verified.ciphertext), expected);

        let shifted = BlockLocation { offset: 4, ..location.clone() };
        assert!(matches!(
            engine.read_verified(&shifted, &expected),
            Err(BlockError::VerificationMismatch { .. })
        ));

        let past_end = BlockLocation { offset: 8, ..location };
        assert!(matches!(
            engine.read_verified(&past_end, &expected),
            Err(BlockError::Io(_))
        ));
    }
}
