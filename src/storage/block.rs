//! Block and file descriptors shared by the metadata store and the engine

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const BLOCK_HASH_SIZE: usize = 32;
pub const PATH_TOKEN_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;

/// Default plaintext block size used when indexing files.
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024; // 256 KiB

/// Content address of a block: the SHA-256 of its ciphertext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; BLOCK_HASH_SIZE]);

/// Keyed, irreversible token standing in for a file's relative path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathToken(pub [u8; PATH_TOKEN_SIZE]);

/// Per-block initialization vector, used as the AES-GCM nonce.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Iv(pub [u8; IV_SIZE]);

/// Parse a fixed-width hex string into a byte array.
fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected {} bytes, got {}", N, v.len()))
}

/// Copy a database blob into a fixed-width array.
pub(crate) fn fixed_from_slice<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

macro_rules! hex_newtype {
    ($name:ident) => {
        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed(s).map($name)
            }
        }
    };
}

hex_newtype!(BlockHash);
hex_newtype!(PathToken);
hex_newtype!(Iv);

impl Iv {
    /// Fresh random IV for a newly indexed block.
    pub fn random() -> Self {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        Iv(iv)
    }
}

/// One place on disk where a block's plaintext is recorded to live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Path relative to the open root, `/`-separated.
    pub path: String,
    pub offset: u64,
    pub size: u64,
    pub iv: Iv,
}

/// A block as it appears in one file's ordered block list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub hash: BlockHash,
    pub offset: u64,
    pub size: u64,
    pub iv: Iv,
}

impl FileBlock {
    /// One past the last byte, or `None` if the range overflows.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    /// The same block viewed as a location inside `path`.
    pub fn location_in(&self, path: &str) -> BlockLocation {
        BlockLocation {
            path: path.to_string(),
            offset: self.offset,
            size: self.size,
            iv: self.iv,
        }
    }
}

/// A tracked file in the open tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path_token: PathToken,
    pub path: String,
    pub assembled: bool,
}

/// Check that a block list covers `[0, len)` exactly once, in offset order.
///
/// Returns the total length on success.
pub fn check_contiguous(blocks: &[FileBlock]) -> Result<u64, String> {
    let mut expected = 0u64;
    for block in blocks {
        if block.size == 0 {
            return Err(format!("block {} at offset {} is empty", block.hash, block.offset));
        }
        if block.offset != expected {
            return Err(format!(
                "block {} starts at offset {}, expected {}",
                block.hash, block.offset, expected
            ));
        }
        expected = block.end().ok_or_else(|| {
            format!(
                "block {} at offset {} with size {} overflows",
                block.hash, block.offset, block.size
            )
        })?;
    }
    Ok(expected)
}
