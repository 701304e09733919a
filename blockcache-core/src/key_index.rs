//! Authoritative table of locally stored blocks.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Where a stored block lives and how valuable it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clusters {
    /// Cluster numbers in storage order.
    pub indices: Vec<u64>,
    pub length: usize,
    pub update_time: DateTime<Utc>,
    pub priority: i32,
}

impl Clusters {
    pub fn new(indices: Vec<u64>, length: usize) -> Self {
        Self { indices, length, update_time: Utc::now(), priority: 0 }
    }
}

#[derive(Debug, Default)]
pub struct KeyIndex {
    records: HashMap<Key, Clusters>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &Key) -> Option<&Clusters> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.records.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Clusters)> {
        self.records.iter()
    }

    pub fn insert(&mut self, key: Key, clusters: Clusters) {
        self.records.insert(key, clusters);
    }

    pub fn remove(&mut self, key: &Key) -> Option<Clusters> {
        self.records.remove(key)
    }

    pub fn touch(&mut self, key: &Key) {
        if let Some(c) = self.records.get_mut(key) {
            c.update_time = Utc::now();
        }
    }

    /// Returns true when the priority actually changed.
    pub fn set_priority(&mut self, key: &Key, priority: i32) -> bool {
        match self.records.get_mut(key) {
            Some(c) if c.priority != priority => {
                c.priority = priority;
                true
            }
            _ => false,
        }
    }

    pub fn priority(&self, key: &Key) -> Option<i32> {
        self.records.get(key).map(|c| c.priority)
    }

    pub fn used_clusters(&self) -> HashSet<u64> {
        self.records.values().flat_map(|c| c.indices.iter().copied()).collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.records.values().map(|c| c.length as u64).sum()
    }

    /// Keys whose cluster range reaches past `total_clusters`.
    pub fn keys_beyond(&self, total_clusters: u64) -> Vec<Key> {
        self.records
            .iter()
            .filter(|(_, c)| c.indices.iter().any(|&i| i >= total_clusters))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Eviction order: lowest priority first, then least recently updated.
    /// Keys in `protected` and keys with a positive (seed-retained) priority are skipped.
    pub fn eviction_order(&self, protected: &HashSet<Key>) -> Vec<Key> {
        let mut candidates: Vec<(&Key, &Clusters)> = self
            .records
            .iter()
            .filter(|(k, c)| c.priority <= 0 && !protected.contains(*k))
            .collect();
        candidates.sort_by(|(_, a), (_, b)| {
            a.priority.cmp(&b.priority).then_with(|| a.update_time.cmp(&b.update_time))
        });
        candidates.into_iter().map(|(k, _)| k.clone()).collect()
    }
}
