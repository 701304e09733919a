use tracing::{info, warn};

use crate::error::CacheError;
use crate::manager::CacheManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub good: usize,
    pub bad: usize,
}

impl CacheManager {
    /// Re-read and re-hash every available block, dropping the ones that fail.
    ///
    /// Each block is checked under its own short lock, so other callers interleave freely.
    /// `progress` receives `(done, total)` after every block.
    pub fn check_blocks(&self, progress: Option<&dyn Fn(usize, usize)>) -> CheckReport {
        let keys = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            for k in inner.shares.prune_missing() {
                inner.counts.set_present(&k, inner.keys.contains(&k));
            }
            let mut keys: Vec<_> = inner.keys.keys().cloned().collect();
            keys.extend(inner.shares.keys().filter(|k| !inner.keys.contains(k)).cloned());
            keys
        };
        let total = keys.len();
        let mut report = CheckReport::default();
        for (done, key) in keys.iter().enumerate() {
            match self.lock().read(key) {
                Ok(_) => report.good += 1,
                Err(CacheError::BlockNotFound(_)) => report.bad += 1,
                Err(e) => {
                    warn!(%key, error = %e, "block check failed");
                    report.bad += 1;
                }
            }
            if let Some(cb) = progress {
                cb(done + 1, total);
            }
        }
        info!(good = report.good, bad = report.bad, "block check done");
        report
    }
}
