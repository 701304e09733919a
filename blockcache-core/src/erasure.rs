//! Parity groups over stored blocks.

use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::group::{CorrectionAlgorithm, Group, RS8_MAX_INFORMATION};
use crate::key::{HashAlgorithm, Key};
use crate::manager::CacheManager;
use crate::rs_codec::RsCodec;

impl CacheManager {
    /// Wrap `keys` in a redundancy group, storing any parity blocks it needs.
    pub fn parity_encoding(
        &self,
        keys: &[Key],
        hash_algorithm: HashAlgorithm,
        block_length: usize,
        correction: CorrectionAlgorithm,
    ) -> CacheResult<Group> {
        match correction {
            CorrectionAlgorithm::None => {
                let mut length = 0u64;
                for k in keys {
                    length += self.length_of(k)? as u64;
                }
                Group::new(correction, keys.len(), block_length, length, keys.to_vec())
            }
            CorrectionAlgorithm::ReedSolomon8 => {
                self.rs8_encode(keys, hash_algorithm, block_length)
            }
        }
    }

    fn rs8_encode(
        &self,
        keys: &[Key],
        hash_algorithm: HashAlgorithm,
        block_length: usize,
    ) -> CacheResult<Group> {
        let k = keys.len();
        if k == 0 || k > RS8_MAX_INFORMATION {
            return Err(CacheError::UnsupportedConfiguration(format!(
                "ReedSolomon8 needs 1..={} data blocks, got {}",
                RS8_MAX_INFORMATION, k
            )));
        }
        if block_length == 0 {
            return Err(CacheError::InvalidArgument("block length must be non-zero".into()));
        }

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(2 * k);
        let mut length = 0u64;
        for (i, key) in keys.iter().enumerate() {
            let mut buf = self.get(key)?;
            if buf.len() > block_length {
                return Err(CacheError::InvalidArgument(format!(
                    "block {} is {} bytes, longer than block length {}",
                    key,
                    buf.len(),
                    block_length
                )));
            }
            // Only the last data block may be short; decode trims it from `Group::length`.
            if i + 1 < k && buf.len() != block_length {
                return Err(CacheError::InvalidArgument(format!(
                    "block {} at position {} is {} bytes; only the last block may be shorter \
                     than block length {}",
                    key,
                    i,
                    buf.len(),
                    block_length
                )));
            }
            length += buf.len() as u64;
            buf.resize(block_length, 0);
            shards.push(buf);
        }
        shards.resize_with(2 * k, || vec![0u8; block_length]);
        RsCodec::new(k, k)?.encode(&mut shards)?;

        let mut all = keys.to_vec();
        for parity in &shards[k..] {
            let key = Key::compute(hash_algorithm, parity);
            self.put(&key, parity)?;
            all.push(key);
        }
        debug!(data = k, block_length, length, "built ReedSolomon8 group");
        Group::new(CorrectionAlgorithm::ReedSolomon8, k, block_length, length, all)
    }

    /// Make the group's data blocks locally available again; returns the data keys.
    pub fn parity_decoding(&self, group: &Group) -> CacheResult<Vec<Key>> {
        match group.correction {
            CorrectionAlgorithm::None => Ok(group.keys.clone()),
            CorrectionAlgorithm::ReedSolomon8 => self.rs8_decode(group),
        }
    }

    fn rs8_decode(&self, group: &Group) -> CacheResult<Vec<Key>> {
        let info = group.information_length;
        let total = group.keys.len();
        let bl = group.block_length;
        if info == 0 || info > total {
            return Err(CacheError::InvalidArgument(format!(
                "group has {} keys but information length {}",
                total, info
            )));
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut lengths: Vec<Option<usize>> = vec![None; info];
        let mut available = 0usize;
        for (i, key) in group.keys.iter().enumerate() {
            // Parity is only needed up to the information length.
            if i >= info && available >= info {
                break;
            }
            match self.get(key) {
                Ok(mut buf) => {
                    if i < info {
                        lengths[i] = Some(buf.len());
                    }
                    buf.resize(bl, 0);
                    shards[i] = Some(buf);
                    available += 1;
                }
                Err(CacheError::BlockNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let missing: Vec<usize> = (0..info).filter(|&i| shards[i].is_none()).collect();
        if missing.is_empty() {
            return Ok(group.data_keys().to_vec());
        }
        if available < info {
            warn!(available, needed = info, "group cannot be reconstructed");
            return Err(CacheError::BlockNotFound(group.keys[missing[0]].clone()));
        }

        RsCodec::new(info, total - info)?.reconstruct_data(&mut shards)?;

        let mut consumed = 0u64;
        for i in 0..info {
            let len = match lengths[i] {
                Some(n) => n,
                None if i + 1 < info => bl,
                None => group.length.saturating_sub(consumed).min(bl as u64) as usize,
            };
            consumed += len as u64;
            if lengths[i].is_some() {
                continue;
            }
            let key = &group.keys[i];
            let Some(buf) = shards[i].as_ref() else {
                return Err(CacheError::BlockNotFound(key.clone()));
            };
            let data = &buf[..len];
            if !key.verify(data) {
                warn!(%key, "reconstructed block does not match its key");
                return Err(CacheError::BlockNotFound(key.clone()));
            }
            self.put(key, data)?;
        }
        debug!(recovered = missing.len(), data = info, "reconstructed group");
        Ok(group.data_keys().to_vec())
    }
}
