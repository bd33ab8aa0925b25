//! Content digests using BLAKE3
//!
//! The engine only needs a "compute digest of bytes" capability; BLAKE3 is
//! the concrete choice here. Digests travel on the wire as lowercase hex.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A content digest (256-bit).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap raw digest bytes
    #[must_use]
    pub fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}

/// Incremental digest for streaming payloads through fixed-size blocks
/// without buffering the whole input.
#[derive(Default)]
pub struct DigestHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

/// Block size used when feeding a payload through [`DigestHasher`].
pub const DIGEST_BLOCK_SIZE: usize = 64 * 1024;

impl DigestHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a block of bytes
    pub fn update(&mut self, block: &[u8]) {
        self.inner.update(block);
        self.bytes += block.len() as u64;
    }

    /// Total bytes fed so far
    #[must_use]
    pub fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the digest
    #[must_use]
    pub fn finalize(self) -> ContentHash {
        ContentHash(*self.inner.finalize().as_bytes())
    }
}
