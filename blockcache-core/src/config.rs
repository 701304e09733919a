use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cluster_store::CLUSTER_SIZE;
use crate::error::{CacheError, CacheResult};
use crate::key::HashAlgorithm;

/// Engine configuration; every field has a default so partial JSON files load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backing cluster file.
    pub path: PathBuf,
    /// Store byte budget.
    pub size: u64,
    /// The backing file grows by this much at a time.
    pub growth_step: u64,
    pub hash_algorithm: HashAlgorithm,
    /// Read size used by the block pipeline.
    pub transfer_chunk: usize,
    pub revalidate_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cache.blocks"),
            size: 1 << 30,
            growth_step: 64 << 20,
            hash_algorithm: HashAlgorithm::default(),
            transfer_chunk: 1 << 20,
            revalidate_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open config {:?}", path))?;
        let cfg: Self =
            serde_json::from_reader(f).with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.size < CLUSTER_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "store size {} is smaller than one cluster",
                self.size
            )));
        }
        if self.transfer_chunk == 0 {
            return Err(CacheError::InvalidArgument("transfer_chunk must be non-zero".into()));
        }
        Ok(())
    }
}
