//! Content keys: a hash algorithm tag plus the digest of a block.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::{CacheError, CacheResult};

/// Longest digest a key may carry.
pub const MAX_HASH_LENGTH: usize = 64;

/// Digest function selected by a key's algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HashAlgorithm {
    /// SHA-512, 64-byte digest.
    #[default]
    Sha2_512,
}

impl HashAlgorithm {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha2_512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Identifies a block by the hash of its content.
///
/// Equality is structural; hashing uses the digest cached at construction so map
/// lookups never rehash the full 64 bytes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "KeyRepr", into = "KeyRepr")]
pub struct Key {
    algorithm: HashAlgorithm,
    hash: Vec<u8>,
    digest: u32,
}

#[derive(Serialize, Deserialize)]
struct KeyRepr {
    algorithm: HashAlgorithm,
    hash: Vec<u8>,
}

impl TryFrom<KeyRepr> for Key {
    type Error = CacheError;

    fn try_from(r: KeyRepr) -> CacheResult<Self> {
        Key::new(r.algorithm, r.hash)
    }
}

impl From<Key> for KeyRepr {
    fn from(k: Key) -> Self {
        KeyRepr { algorithm: k.algorithm, hash: k.hash }
    }
}

impl Key {
    pub fn new(algorithm: HashAlgorithm, hash: Vec<u8>) -> CacheResult<Self> {
        if hash.len() > MAX_HASH_LENGTH {
            return Err(CacheError::InvalidArgument(format!(
                "hash is {} bytes, at most {} allowed",
                hash.len(),
                MAX_HASH_LENGTH
            )));
        }
        let mut head = [0u8; 4];
        let n = hash.len().min(4);
        head[..n].copy_from_slice(&hash[..n]);
        Ok(Self { algorithm, hash, digest: u32::from_le_bytes(head) })
    }

    /// Hash `data` and wrap the digest.
    pub fn compute(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let hash = algorithm.digest(data);
        let mut head = [0u8; 4];
        head.copy_from_slice(&hash[..4]);
        Self { algorithm, hash, digest: u32::from_le_bytes(head) }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// True when `data` hashes to this key.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == self.hash
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.algorithm == other.algorithm && self.hash == other.hash
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.digest);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.hash.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        if self.hash.len() > 8 {
            f.write_str("…")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?}, {})", self.algorithm, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_verify() {
        let k = Key::compute(HashAlgorithm::Sha2_512, b"hello");
        assert_eq!(k.hash().len(), 64);
        assert!(k.verify(b"hello"));
        assert!(!k.verify(b"hellO"));
    }

    #[test]
    fn oversized_hash_rejected() {
        let err = Key::new(HashAlgorithm::Sha2_512, vec![0u8; 65]).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[test]
    fn short_hash_digest_is_padded() {
        let a = Key::new(HashAlgorithm::Sha2_512, vec![1, 2]).unwrap();
        let b = Key::new(HashAlgorithm::Sha2_512, vec![1, 2]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Key::new(HashAlgorithm::Sha2_512, vec![1, 2, 0]).unwrap());
    }
}
