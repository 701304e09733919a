use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{CacheError, CacheResult};

/// Reed-Solomon over GF(2^8): `k` data shards, `m` parity shards, equal-length shards.
pub struct RsCodec {
    pub k: usize,
    pub m: usize,
    inner: ReedSolomon,
}

impl RsCodec {
    pub fn new(k: usize, m: usize) -> CacheResult<Self> {
        if k + m > 256 {
            return Err(CacheError::UnsupportedConfiguration(format!(
                "GF(2^8) allows at most 256 shards, asked for {}+{}",
                k, m
            )));
        }
        let inner = ReedSolomon::new(k, m)?;
        Ok(Self { k, m, inner })
    }

    /// Fill the trailing `m` shards from the leading `k`.
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> CacheResult<()> {
        self.inner.encode(shards)?;
        Ok(())
    }

    // Only the data shards are rebuilt; missing parity stays `None`.
    pub fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> CacheResult<()> {
        self.inner.reconstruct_data(shards)?;
        Ok(())
    }
}
