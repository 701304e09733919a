//! Cluster file storage and the bounded free-cluster set.

use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

pub const CLUSTER_SIZE: u64 = 32 * 1024;

/// Upper bound on free clusters tracked at a time.
pub const MAX_FREE_CANDIDATES: usize = 8192;

/// Number of clusters needed to hold `length` bytes.
pub fn clusters_for(length: usize) -> usize {
    (length as u64).div_ceil(CLUSTER_SIZE) as usize
}

#[derive(Debug, Default)]
pub(crate) struct FreeClusters {
    candidates: BTreeSet<u64>,
}

impl FreeClusters {
    pub(crate) fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Rebuild from holes below the end of the used region, then a lookahead window past it.
    pub(crate) fn refill(&mut self, used: &HashSet<u64>, total: u64) {
        self.candidates.clear();
        let end = used.iter().max().map_or(0, |m| m + 1).min(total);
        for i in 0..end {
            if self.candidates.len() >= MAX_FREE_CANDIDATES {
                return;
            }
            if !used.contains(&i) {
                self.candidates.insert(i);
            }
        }
        let mut i = end;
        while i < total && self.candidates.len() < MAX_FREE_CANDIDATES {
            self.candidates.insert(i);
            i += 1;
        }
    }

    /// Lowest `count` candidates, or `None` (set untouched) if there are not enough.
    pub(crate) fn take(&mut self, count: usize) -> Option<Vec<u64>> {
        if self.candidates.len() < count {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.extend(self.candidates.pop_first());
        }
        Some(out)
    }

    /// Clusters past the cap are dropped here and recovered by the next refill.
    pub(crate) fn release(&mut self, indices: &[u64], total: u64) {
        for &i in indices {
            if i < total && self.candidates.len() < MAX_FREE_CANDIDATES {
                self.candidates.insert(i);
            }
        }
    }

    pub(crate) fn truncate(&mut self, total: u64) {
        let _past_end = self.candidates.split_off(&total);
    }
}

pub struct ClusterStore {
    path: PathBuf,
    file: File,
    file_len: u64,
    size: u64,
    growth_step: u64,
    free: FreeClusters,
}

impl ClusterStore {
    /// Open (or create) the backing file and take an exclusive advisory lock on it.
    pub fn open(path: &Path, size: u64, growth_step: u64) -> CacheResult<Self> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        file.try_lock_exclusive()?;
        let file_len = file.metadata()?.len();
        debug!(path = %path.display(), file_len, size, "opened cluster store");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            file_len,
            size,
            growth_step: growth_step.max(CLUSTER_SIZE),
            free: FreeClusters::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store byte budget.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total_clusters(&self) -> u64 {
        self.size / CLUSTER_SIZE
    }

    /// Free clusters currently tracked (capped at [`MAX_FREE_CANDIDATES`]).
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Rebuild the free set from the clusters in use.
    pub fn refresh_free(&mut self, used: &HashSet<u64>) {
        self.free.refill(used, self.total_clusters());
    }

    /// Reserve `count` clusters. `used` is consulted only when the tracked set runs short.
    /// Fails with `SpaceNotFound`; the caller evicts and retries.
    pub fn allocate(
        &mut self,
        count: usize,
        used: impl FnOnce() -> HashSet<u64>,
    ) -> CacheResult<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.free.len() < count {
            let used = used();
            self.free.refill(&used, self.total_clusters());
        }
        match self.free.take(count) {
            Some(indices) => {
                debug!(count, first = indices[0], "allocated clusters");
                Ok(indices)
            }
            None => Err(CacheError::SpaceNotFound { needed: count, available: self.free.len() }),
        }
    }

    pub fn free_clusters(&mut self, indices: &[u64]) {
        let total = self.total_clusters();
        self.free.release(indices, total);
    }

    /// Read one cluster, or less when the file ends inside it.
    pub fn read_cluster(&mut self, cluster: u64) -> CacheResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(CLUSTER_SIZE as usize);
        self.file.seek(SeekFrom::Start(cluster * CLUSTER_SIZE))?;
        (&mut self.file).take(CLUSTER_SIZE).read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cluster {} is past end of file", cluster),
            )
            .into());
        }
        Ok(buf)
    }

    /// Read `length` bytes spread over `indices` in storage order.
    pub fn read_clusters(&mut self, indices: &[u64], length: usize) -> CacheResult<Vec<u8>> {
        if indices.len() < clusters_for(length) {
            return Err(CacheError::InvalidArgument(format!(
                "{} clusters cannot hold {} bytes",
                indices.len(),
                length
            )));
        }
        let mut out = vec![0u8; length];
        for (&cluster, chunk) in indices.iter().zip(out.chunks_mut(CLUSTER_SIZE as usize)) {
            self.file.seek(SeekFrom::Start(cluster * CLUSTER_SIZE))?;
            self.file.read_exact(chunk)?;
        }
        Ok(out)
    }

    pub fn write_clusters(&mut self, indices: &[u64], payload: &[u8]) -> CacheResult<()> {
        if indices.len() < clusters_for(payload.len()) {
            return Err(CacheError::InvalidArgument(format!(
                "{} clusters cannot hold {} bytes",
                indices.len(),
                payload.len()
            )));
        }
        if let Some(&last) = indices.iter().max() {
            self.ensure_len((last + 1) * CLUSTER_SIZE)?;
        }
        for (&cluster, chunk) in indices.iter().zip(payload.chunks(CLUSTER_SIZE as usize)) {
            self.file.seek(SeekFrom::Start(cluster * CLUSTER_SIZE))?;
            self.file.write_all(chunk)?;
        }
        Ok(())
    }

    fn ensure_len(&mut self, required: u64) -> CacheResult<()> {
        if required <= self.file_len {
            return Ok(());
        }
        if required > self.size {
            return Err(CacheError::InvalidArgument(format!(
                "write ends at {} past store size {}",
                required, self.size
            )));
        }
        let target = required.div_ceil(self.growth_step) * self.growth_step;
        let target = target.min(self.size).max(required);
        self.file.allocate(target)?;
        debug!(from = self.file_len, to = target, "grew cluster file");
        self.file_len = target;
        Ok(())
    }

    /// Change the byte budget. Callers must first drop records past the new end.
    pub fn resize(&mut self, size: u64) -> CacheResult<()> {
        self.size = size;
        if self.file_len > size {
            self.file.set_len(size)?;
            self.file_len = size;
        }
        self.free.truncate(self.total_clusters());
        Ok(())
    }

    pub fn sync(&self) -> CacheResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_takes_holes_before_lookahead() {
        let mut free = FreeClusters::default();
        let used: HashSet<u64> = [0, 2, 3, 6].into_iter().collect();
        free.refill(&used, 10);
        assert_eq!(free.take(5).unwrap(), vec![1, 4, 5, 7, 8]);
        assert_eq!(free.take(2), None);
        assert_eq!(free.take(1).unwrap(), vec![9]);
    }

    #[test]
    fn refill_is_capped() {
        let mut free = FreeClusters::default();
        free.refill(&HashSet::new(), 100_000);
        assert_eq!(free.len(), MAX_FREE_CANDIDATES);
    }

    #[test]
    fn truncate_drops_clusters_past_end() {
        let mut free = FreeClusters::default();
        free.refill(&HashSet::new(), 16);
        free.truncate(4);
        assert_eq!(free.take(4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(free.len(), 0);
    }

    #[test]
    fn allocate_write_read() {
        let td = tempfile::tempdir().unwrap();
        let mut store =
            ClusterStore::open(&td.path().join("c.bin"), 8 * CLUSTER_SIZE, CLUSTER_SIZE).unwrap();
        let idx = store.allocate(2, HashSet::new).unwrap();
        assert_eq!(idx, vec![0, 1]);
        let payload: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        store.write_clusters(&idx, &payload).unwrap();
        assert_eq!(store.read_clusters(&idx, payload.len()).unwrap(), payload);
        assert_eq!(store.read_cluster(1).unwrap().len(), CLUSTER_SIZE as usize);
        assert!(store.read_cluster(5).is_err());
    }

    #[test]
    fn allocate_reports_shortfall() {
        let td = tempfile::tempdir().unwrap();
        let mut store =
            ClusterStore::open(&td.path().join("c.bin"), 2 * CLUSTER_SIZE, CLUSTER_SIZE).unwrap();
        let err = store.allocate(3, HashSet::new).unwrap_err();
        assert!(matches!(err, CacheError::SpaceNotFound { needed: 3, available: 2 }));
    }
}
