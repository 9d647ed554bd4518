//! Block encryption and path obfuscation
//!
//! - Blocks are encrypted with AES-256-GCM using the block's recorded IV as the
//!   nonce, so the same (key, iv, plaintext) always yields the same ciphertext.
//! - A block's content address is the SHA-256 of that ciphertext.
//! - Paths are replaced by an HMAC-SHA256 token keyed with the encryption key.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::storage::block::{BlockHash, Iv, PathToken};
use crate::storage::BlockError;

type HmacSha256 = Hmac<Sha256>;

/// The folder's symmetric encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key stored as 64 hex characters (surrounding whitespace ignored).
    pub fn from_hex(s: &str) -> Result<Self, BlockError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| BlockError::Crypto(format!("invalid key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BlockError::Crypto("key must be exactly 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    /// Read a hex-encoded key from a file.
    pub fn load(path: &Path) -> Result<Self, BlockError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_hex(&text)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Hash of a block's ciphertext, used as its address in the cache.
pub fn content_hash(ciphertext: &[u8]) -> BlockHash {
    BlockHash(Sha256::digest(ciphertext).into())
}

/// Keyed cipher shared by every engine operation.
pub struct BlockCipher {
    key: EncryptionKey,
    aead: Aes256Gcm,
}

impl BlockCipher {
    pub fn new(key: EncryptionKey) -> Self {
        let aead = Aes256Gcm::new(&Key::<Aes256Gcm>::from(key.0));
        Self { key, aead }
    }

    /// Encrypt one block's plaintext under its IV.
    ///
    /// Returns ciphertext || 16-byte GCM tag. The IV is not prepended; it lives
    /// in the metadata store next to the block hash.
    pub fn encrypt(&self, iv: &Iv, plaintext: &[u8]) -> Result<Vec<u8>, BlockError> {
        self.aead
            .encrypt(Nonce::from_slice(&iv.0), plaintext)
            .map_err(|e| BlockError::Crypto(format!("block encryption failed: {}", e)))
    }

    /// Decrypt one block, authenticating the GCM tag.
    pub fn decrypt(&self, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>, BlockError> {
        self.aead
            .decrypt(Nonce::from_slice(&iv.0), ciphertext)
            .map_err(|e| BlockError::Crypto(format!("block decryption failed: {}", e)))
    }

    /// Obfuscated identity of a relative path.
    pub fn path_token(&self, path: &str) -> Result<PathToken, BlockError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key.0)
            .map_err(|e| BlockError::Crypto(e.to_string()))?;
        mac.update(path.as_bytes());
        Ok(PathToken(mac.finalize().into_bytes().into()))
    }
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher").finish_non_exhaustive()
    }
}
