use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cluster_store::{clusters_for, ClusterStore, CLUSTER_SIZE};
use crate::config::CacheConfig;
use crate::count_cache::CountCache;
use crate::error::{CacheError, CacheResult};
use crate::group::{Index, Seed};
use crate::key::Key;
use crate::key_index::{Clusters, KeyIndex};
use crate::seed::{Revalidation, SeedState, SeedTracker};
use crate::settings::{self, CacheSettings, SettingsLimits};
use crate::share::{ShareId, ShareInfo, ShareRegistry};

/// Priority given to blocks protected by a retained seed.
pub const RETAINED_PRIORITY: i32 = 1;

/// Host hook naming keys that must survive eviction (e.g. blocks mid-transfer).
/// Called once per eviction pass, without the cache lock held.
pub trait InUseKeys: Send + Sync {
    fn in_use_keys(&self) -> Vec<Key>;
}

impl<F> InUseKeys for F
where
    F: Fn() -> Vec<Key> + Send + Sync,
{
    fn in_use_keys(&self) -> Vec<Key> {
        self()
    }
}

pub(crate) struct CacheInner {
    pub(crate) store: ClusterStore,
    pub(crate) keys: KeyIndex,
    pub(crate) shares: ShareRegistry,
    pub(crate) counts: CountCache,
    pub(crate) seeds: SeedTracker,
}

impl CacheInner {
    pub(crate) fn contains(&self, key: &Key) -> bool {
        self.keys.contains(key) || self.shares.contains(key)
    }

    fn mark(&mut self, key: &Key) {
        let present = self.contains(key);
        self.counts.set_present(key, present);
    }

    fn remove_local(&mut self, key: &Key) -> bool {
        match self.keys.remove(key) {
            Some(c) => {
                self.store.free_clusters(&c.indices);
                self.mark(key);
                true
            }
            None => false,
        }
    }

    /// Read and verify; any failure deregisters the source and reports `BlockNotFound`.
    pub(crate) fn read(&mut self, key: &Key) -> CacheResult<Vec<u8>> {
        if let Some(c) = self.keys.get(key) {
            match self.store.read_clusters(&c.indices, c.length) {
                Ok(data) if key.verify(&data) => {
                    self.keys.touch(key);
                    return Ok(data);
                }
                Ok(_) => warn!(%key, "stored block failed hash check, removing"),
                Err(e) => warn!(%key, error = %e, "stored block unreadable, removing"),
            }
            self.remove_local(key);
        }
        match self.shares.read(key) {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(CacheError::BlockNotFound(key.clone())),
            Err(dropped) => {
                for k in &dropped {
                    self.mark(k);
                }
                Err(CacheError::BlockNotFound(key.clone()))
            }
        }
    }

    /// Store a verified block. `SpaceNotFound` means the caller should evict and retry.
    fn store_block(&mut self, key: &Key, value: &[u8]) -> CacheResult<()> {
        if self.contains(key) {
            return Ok(());
        }
        let keys = &self.keys;
        let indices = self.store.allocate(clusters_for(value.len()), || keys.used_clusters())?;
        if let Err(e) = self.store.write_clusters(&indices, value) {
            self.store.free_clusters(&indices);
            return Err(e);
        }
        self.keys.insert(key.clone(), Clusters::new(indices, value.len()));
        self.counts.set_present(key, true);
        Ok(())
    }

    fn evict_until(&mut self, needed: usize, protected: &HashSet<Key>) -> CacheResult<()> {
        let used = self.keys.used_clusters();
        self.store.refresh_free(&used);
        if self.store.free_count() >= needed {
            return Ok(());
        }
        let order = self.keys.eviction_order(protected);
        debug!(needed, free = self.store.free_count(), candidates = order.len(), "evicting");
        let mut evicted = 0usize;
        for key in order {
            if self.store.free_count() >= needed {
                break;
            }
            self.remove_local(&key);
            evicted += 1;
        }
        let available = self.store.free_count();
        if available < needed {
            warn!(needed, available, evicted, "eviction could not free enough clusters");
            return Err(CacheError::SpaceNotFound { needed, available });
        }
        debug!(evicted, available, "eviction done");
        Ok(())
    }

    fn length_of(&mut self, key: &Key) -> CacheResult<usize> {
        if let Some(c) = self.keys.get(key) {
            return Ok(c.length);
        }
        match self.shares.length_of(key) {
            Some(Ok(n)) => Ok(n),
            Some(Err(e)) => {
                warn!(%key, error = %e, "shared file unavailable");
                for k in self.shares.prune_missing() {
                    self.mark(&k);
                }
                Err(CacheError::KeyNotFound(key.clone()))
            }
            None => Err(CacheError::KeyNotFound(key.clone())),
        }
    }

    fn register_groups(&mut self, indices: &[Index]) {
        for group in indices.iter().flat_map(|i| i.groups.iter()) {
            let (keys, shares) = (&self.keys, &self.shares);
            self.counts.register(group, |k| keys.contains(k) || shares.contains(k));
        }
    }

    fn unregister_groups(&mut self, indices: &[Index]) {
        for group in indices.iter().flat_map(|i| i.groups.iter()) {
            self.counts.unregister(group);
        }
    }

    /// Raise retained keys to [`RETAINED_PRIORITY`] and drop everything else back to 0.
    fn reprotect(&mut self) {
        let keys = &self.keys;
        let protected = self.seeds.protection_set(
            &self.counts,
            |k| keys.priority(k).is_some_and(|p| p > 0),
            &mut rand::thread_rng(),
        );
        let stale: Vec<Key> = self
            .keys
            .iter()
            .filter(|(k, c)| c.priority > 0 && !protected.contains(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &stale {
            self.keys.set_priority(k, 0);
        }
        let mut raised = 0usize;
        for k in &protected {
            if self.keys.set_priority(k, RETAINED_PRIORITY) {
                raised += 1;
            }
        }
        debug!(protected = protected.len(), raised, lowered = stale.len(), "reprotected keys");
    }

    fn revalidate(&mut self) -> Revalidation {
        let (keys, shares) = (&self.keys, &self.shares);
        let outcome =
            self.seeds.revalidate(&self.counts, |k| keys.contains(k) || shares.contains(k));
        for (seed, indices) in &outcome.released {
            info!(seed = %seed.name, "seed released: content no longer reconstructible");
            self.unregister_groups(indices);
        }
        self.reprotect();
        outcome
    }

    fn snapshot(&self) -> CacheSettings {
        CacheSettings {
            size: self.store.size(),
            clusters: self.keys.iter().map(|(k, c)| (k.clone(), c.clone())).collect(),
            shares: self.shares.iter().map(|(id, s)| (*id, s.clone())).collect(),
            seeds: self.seeds.iter().map(|(s, i)| (s.clone(), i.to_vec())).collect(),
        }
    }

    fn restore(&mut self, s: CacheSettings) -> CacheResult<()> {
        self.keys = KeyIndex::new();
        self.shares = ShareRegistry::new();
        self.counts = CountCache::new();
        self.seeds = SeedTracker::new();
        self.store.resize(s.size)?;

        let total = self.store.total_clusters();
        let mut claimed = HashSet::new();
        let mut dropped = 0usize;
        for (key, clusters) in s.clusters {
            let fits = clusters.indices.len() >= clusters_for(clusters.length)
                && clusters.indices.iter().all(|&i| i < total && !claimed.contains(&i));
            if !fits {
                dropped += 1;
                continue;
            }
            claimed.extend(clusters.indices.iter().copied());
            self.keys.insert(key, clusters);
        }
        for (id, share) in s.shares {
            self.shares.restore(id, share);
        }
        let vanished = self.shares.prune_missing();
        for (seed, indices) in s.seeds {
            self.register_groups(&indices);
            self.seeds.add(seed, indices);
        }
        self.store.refresh_free(&claimed);
        info!(
            keys = self.keys.len(),
            shares = self.shares.len(),
            seeds = self.seeds.len(),
            dropped,
            vanished = vanished.len(),
            "restored cache state"
        );
        Ok(())
    }
}

/// Content-addressed block cache over a single cluster file.
pub struct CacheManager {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    in_use: Box<dyn InUseKeys>,
    last_revalidate: Mutex<Option<Instant>>,
}

impl CacheManager {
    pub fn open(config: CacheConfig, in_use: impl InUseKeys + 'static) -> CacheResult<Self> {
        config.validate()?;
        let store = ClusterStore::open(&config.path, config.size, config.growth_step)?;
        info!(path = %config.path.display(), size = config.size, "cache opened");
        Ok(Self {
            config,
            inner: Mutex::new(CacheInner {
                store,
                keys: KeyIndex::new(),
                shares: ShareRegistry::new(),
                counts: CountCache::new(),
                seeds: SeedTracker::new(),
            }),
            in_use: Box::new(in_use),
            last_revalidate: Mutex::new(None),
        })
    }

    /// Open with no in-use keys reported by the host.
    pub fn open_default(config: CacheConfig) -> CacheResult<Self> {
        Self::open(config, Vec::<Key>::new)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, CacheInner> {
        self.inner.lock()
    }

    fn protected_keys(&self) -> HashSet<Key> {
        self.in_use.in_use_keys().into_iter().collect()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.lock().contains(key)
    }

    /// Subset of `keys` available locally or through a share.
    pub fn exists_keys(&self, keys: &[Key]) -> Vec<Key> {
        let inner = self.lock();
        keys.iter().filter(|k| inner.contains(k)).cloned().collect()
    }

    pub fn length_of(&self, key: &Key) -> CacheResult<usize> {
        self.lock().length_of(key)
    }

    /// Fetch a verified block.
    pub fn get(&self, key: &Key) -> CacheResult<Vec<u8>> {
        self.lock().read(key)
    }

    /// Store a block under its content key.
    ///
    /// Already-present keys and bytes that do not hash to `key` are ignored. When the store
    /// is full, unprotected low-priority blocks are evicted; `SpaceNotFound` if that is not
    /// enough.
    pub fn put(&self, key: &Key, value: &[u8]) -> CacheResult<()> {
        if !key.verify(value) {
            debug!(%key, len = value.len(), "put ignored: value does not match key");
            return Ok(());
        }
        match self.lock().store_block(key, value) {
            Err(CacheError::SpaceNotFound { .. }) => {}
            other => return other,
        }
        let protected = self.protected_keys();
        let mut inner = self.lock();
        inner.evict_until(clusters_for(value.len()), &protected)?;
        inner.store_block(key, value)
    }

    pub fn remove(&self, key: &Key) {
        if self.lock().remove_local(key) {
            debug!(%key, "removed block");
        }
    }

    /// Evict until `needed` clusters are free.
    pub fn evict_until(&self, needed: usize) -> CacheResult<()> {
        let protected = self.protected_keys();
        self.lock().evict_until(needed, &protected)
    }

    /// Change the store budget, dropping blocks that would land past the new end.
    pub fn resize(&self, size: u64) -> CacheResult<()> {
        if size < CLUSTER_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "store size {} is smaller than one cluster",
                size
            )));
        }
        let mut inner = self.lock();
        let beyond = inner.keys.keys_beyond(size / CLUSTER_SIZE);
        for key in &beyond {
            inner.remove_local(key);
        }
        inner.store.resize(size)?;
        info!(size, removed = beyond.len(), "resized cache");
        Ok(())
    }

    /// Register an external file as a source of blocks; returns every block key in order.
    pub fn share(
        &self,
        reader: &mut impl Read,
        path: &Path,
        block_length: usize,
    ) -> CacheResult<Vec<Key>> {
        let scanned = ShareRegistry::scan(reader, block_length, self.config.hash_algorithm)?;
        let keys = scanned.keys.clone();
        let mut inner = self.lock();
        let (id, replaced) = inner.shares.register(path, scanned);
        for k in replaced.iter().chain(keys.iter()) {
            inner.mark(k);
        }
        info!(share = id.0, path = %path.display(), blocks = keys.len(), "file shared");
        Ok(keys)
    }

    pub fn share_remove(&self, id: ShareId) {
        let mut inner = self.lock();
        if let Some(keys) = inner.shares.unregister(id) {
            for k in &keys {
                inner.mark(k);
            }
            info!(share = id.0, "share removed");
        }
    }

    pub fn share_infos(&self) -> Vec<ShareInfo> {
        self.lock().shares.infos()
    }

    /// Retain `seed` and start tracking the completeness of its groups.
    pub fn set_seed(&self, seed: Seed, indices: Vec<Index>) {
        let mut inner = self.lock();
        inner.register_groups(&indices);
        if let Some(old) = inner.seeds.add(seed, indices) {
            inner.unregister_groups(&old);
        }
    }

    pub fn remove_seed(&self, seed: &Seed) {
        let mut inner = self.lock();
        if let Some(indices) = inner.seeds.remove(seed) {
            inner.unregister_groups(&indices);
            inner.reprotect();
            info!(seed = %seed.name, "seed removed");
        }
    }

    pub fn seeds(&self) -> Vec<Seed> {
        self.lock().seeds.seeds()
    }

    pub fn seed_state(&self, seed: &Seed) -> Option<SeedState> {
        self.lock().seeds.state(seed)
    }

    pub fn seed_indices(&self, seed: &Seed) -> Option<Vec<Index>> {
        self.lock().seeds.indices(seed).map(|i| i.to_vec())
    }

    /// Re-check every seed: retain and protect the complete ones, release the rest.
    pub fn revalidate_seeds(&self) -> Revalidation {
        let outcome = self.lock().revalidate();
        *self.last_revalidate.lock() = Some(Instant::now());
        outcome
    }

    /// [`Self::revalidate_seeds`] if the configured interval has elapsed since the last run.
    pub fn maybe_revalidate_seeds(&self) -> Option<Revalidation> {
        let interval = Duration::from_secs(self.config.revalidate_interval_secs);
        let due = self.last_revalidate.lock().map_or(true, |t| t.elapsed() >= interval);
        due.then(|| self.revalidate_seeds())
    }

    /// Every key available locally or through a share.
    pub fn keys(&self) -> Vec<Key> {
        let inner = self.lock();
        let mut out: Vec<Key> = inner.keys.keys().cloned().collect();
        out.extend(inner.shares.keys().filter(|k| !inner.keys.contains(k)).cloned());
        out
    }

    /// Number of locally stored blocks.
    pub fn count(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn priority(&self, key: &Key) -> Option<i32> {
        self.lock().keys.priority(key)
    }

    pub fn size(&self) -> u64 {
        self.lock().store.size()
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().keys.used_bytes()
    }

    /// Bytes in clusters not held by any block.
    pub fn free_bytes(&self) -> u64 {
        let inner = self.lock();
        let used = inner.keys.used_clusters().len() as u64;
        inner.store.total_clusters().saturating_sub(used) * CLUSTER_SIZE
    }

    pub fn snapshot_settings(&self) -> CacheSettings {
        self.lock().snapshot()
    }

    pub fn restore_settings(&self, settings: CacheSettings) -> CacheResult<()> {
        self.lock().restore(settings)
    }

    /// Flush the cluster file and persist the metadata blob.
    pub fn save_settings(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = {
            let inner = self.lock();
            inner.store.sync().context("sync cluster file")?;
            inner.snapshot()
        };
        settings::write_settings(path, &snapshot)?;
        info!(path = %path.display(), keys = snapshot.clusters.len(), "settings saved");
        Ok(())
    }

    pub fn load_settings(&self, path: &Path) -> anyhow::Result<()> {
        let loaded = settings::read_settings(path, &SettingsLimits::default())?;
        self.restore_settings(loaded).with_context(|| format!("restore {:?}", path))?;
        Ok(())
    }
}
