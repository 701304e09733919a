//! Retained seeds and their dependency trees.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::count_cache::CountCache;
use crate::group::{Group, Index, Seed};
use crate::key::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedState {
    Unverified,
    Retained,
}

#[derive(Debug, Clone)]
struct SeedEntry {
    indices: Vec<Index>,
    state: SeedState,
}

/// Result of one revalidation pass.
#[derive(Debug, Default)]
pub struct Revalidation {
    /// Seeds that are (still) retained.
    pub retained: Vec<Seed>,
    /// Seeds dropped because a group fell below its information length.
    pub released: Vec<(Seed, Vec<Index>)>,
}

#[derive(Debug, Default)]
pub struct SeedTracker {
    seeds: HashMap<Seed, SeedEntry>,
}

impl SeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Store a seed's tree; returns the tree it replaced, if any.
    pub fn add(&mut self, seed: Seed, indices: Vec<Index>) -> Option<Vec<Index>> {
        self.seeds
            .insert(seed, SeedEntry { indices, state: SeedState::Unverified })
            .map(|old| old.indices)
    }

    pub fn remove(&mut self, seed: &Seed) -> Option<Vec<Index>> {
        self.seeds.remove(seed).map(|e| e.indices)
    }

    pub fn state(&self, seed: &Seed) -> Option<SeedState> {
        self.seeds.get(seed).map(|e| e.state)
    }

    pub fn seeds(&self) -> Vec<Seed> {
        self.seeds.keys().cloned().collect()
    }

    pub fn indices(&self, seed: &Seed) -> Option<&[Index]> {
        self.seeds.get(seed).map(|e| e.indices.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Seed, &[Index])> {
        self.seeds.iter().map(|(s, e)| (s, e.indices.as_slice()))
    }

    /// Every group of every tracked seed, with repeats.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.seeds.values().flat_map(|e| e.indices.iter()).flat_map(|i| i.groups.iter())
    }

    /// Retain seeds whose groups are all complete and whose top key is fetchable; drop the rest.
    pub fn revalidate(
        &mut self,
        counts: &CountCache,
        fetchable: impl Fn(&Key) -> bool,
    ) -> Revalidation {
        let mut out = Revalidation::default();
        let mut released = Vec::new();
        for (seed, entry) in self.seeds.iter_mut() {
            let complete = fetchable(&seed.key)
                && entry
                    .indices
                    .iter()
                    .flat_map(|i| i.groups.iter())
                    .all(|g| counts.is_complete(g));
            if complete {
                entry.state = SeedState::Retained;
                out.retained.push(seed.clone());
            } else {
                released.push(seed.clone());
            }
        }
        for seed in released {
            if let Some(entry) = self.seeds.remove(&seed) {
                out.released.push((seed, entry.indices));
            }
        }
        out
    }

    /// Keys retained seeds should protect from eviction.
    ///
    /// Each retained seed protects its top key and `information_length` present keys per
    /// group. Keys already protected (`protected_now`) are kept first; the remainder is
    /// sampled at random so replicas are not all pinned. Keys already chosen for another
    /// group or as a top key count toward the quota.
    pub fn protection_set(
        &self,
        counts: &CountCache,
        protected_now: impl Fn(&Key) -> bool,
        rng: &mut impl Rng,
    ) -> HashSet<Key> {
        let mut out = HashSet::new();
        for (seed, entry) in &self.seeds {
            if entry.state != SeedState::Retained {
                continue;
            }
            out.insert(seed.key.clone());
            for group in entry.indices.iter().flat_map(|i| i.groups.iter()) {
                let mut need = group.information_length;
                let (mut kept, mut rest) = (Vec::new(), Vec::new());
                for k in counts.present_keys(group) {
                    if out.contains(&k) {
                        need = need.saturating_sub(1);
                    } else if protected_now(&k) {
                        kept.push(k);
                    } else {
                        rest.push(k);
                    }
                }
                kept.truncate(need);
                need -= kept.len();
                out.extend(kept);
                rest.shuffle(rng);
                out.extend(rest.into_iter().take(need));
            }
        }
        out
    }
}
