//! Redundancy groups and the seed → index → group dependency tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compression::CompressionAlgorithm;
use crate::encryption::CipherAlgorithm;
use crate::error::{CacheError, CacheResult};
use crate::key::Key;

/// Largest information length a ReedSolomon8 group accepts (data + parity must fit GF(2^8)).
pub const RS8_MAX_INFORMATION: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CorrectionAlgorithm {
    /// Data keys only, no parity.
    #[default]
    None,
    /// Reed-Solomon over 8-bit symbols, one parity block per data block.
    ReedSolomon8,
}

/// A redundancy unit: data keys first, then parity keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "GroupRepr")]
pub struct Group {
    pub correction: CorrectionAlgorithm,
    /// Number of true data blocks at the head of `keys`.
    pub information_length: usize,
    /// Padded size of every block in the group.
    pub block_length: usize,
    /// Total byte length of the original data blocks, before padding.
    pub length: u64,
    pub keys: Vec<Key>,
}

#[derive(Deserialize)]
struct GroupRepr {
    correction: CorrectionAlgorithm,
    information_length: usize,
    block_length: usize,
    length: u64,
    keys: Vec<Key>,
}

impl TryFrom<GroupRepr> for Group {
    type Error = CacheError;

    fn try_from(r: GroupRepr) -> CacheResult<Self> {
        Group::new(r.correction, r.information_length, r.block_length, r.length, r.keys)
    }
}

impl Group {
    pub fn new(
        correction: CorrectionAlgorithm,
        information_length: usize,
        block_length: usize,
        length: u64,
        keys: Vec<Key>,
    ) -> CacheResult<Self> {
        if keys.len() < information_length {
            return Err(CacheError::InvalidArgument(format!(
                "group has {} keys but information length {}",
                keys.len(),
                information_length
            )));
        }
        if correction == CorrectionAlgorithm::ReedSolomon8
            && information_length > RS8_MAX_INFORMATION
        {
            return Err(CacheError::UnsupportedConfiguration(format!(
                "ReedSolomon8 supports at most {} information blocks, got {}",
                RS8_MAX_INFORMATION, information_length
            )));
        }
        Ok(Self { correction, information_length, block_length, length, keys })
    }

    pub fn data_keys(&self) -> &[Key] {
        &self.keys[..self.information_length.min(self.keys.len())]
    }

    pub fn parity_keys(&self) -> &[Key] {
        &self.keys[self.information_length.min(self.keys.len())..]
    }
}

/// One content tree: its groups plus the codec used to turn the blocks back into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index {
    pub groups: Vec<Group>,
    pub compression: CompressionAlgorithm,
    pub cipher: CipherAlgorithm,
    pub cipher_key: Vec<u8>,
}

impl Index {
    pub fn plain(groups: Vec<Group>) -> Self {
        Self {
            groups,
            compression: CompressionAlgorithm::None,
            cipher: CipherAlgorithm::None,
            cipher_key: Vec::new(),
        }
    }
}

/// Externally referenced root of a content item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seed {
    pub name: String,
    pub length: u64,
    pub creation_time: DateTime<Utc>,
    /// Top-level key; the seed is only retained while this block is fetchable.
    pub key: Key,
}

impl Seed {
    pub fn new(name: impl Into<String>, length: u64, key: Key) -> Self {
        Self { name: name.into(), length, creation_time: Utc::now(), key }
    }
}
