//! Per-group present-block counters for O(1) completeness checks.

use std::collections::HashMap;

use crate::group::Group;
use crate::key::Key;

#[derive(Debug)]
struct GroupEntry {
    group: Group,
    present: Vec<bool>,
    present_count: usize,
    refs: usize,
}

#[derive(Debug, Default)]
pub struct CountCache {
    slots: HashMap<usize, GroupEntry>,
    by_group: HashMap<Group, usize>,
    /// Every (slot, position) where a key appears.
    members: HashMap<Key, Vec<(usize, usize)>>,
    next_slot: usize,
}

impl CountCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_count(&self) -> usize {
        self.slots.len()
    }

    /// Start tracking `group` (or bump its reference count). `contains` seeds the flags.
    pub fn register(&mut self, group: &Group, contains: impl Fn(&Key) -> bool) {
        if let Some(slot) = self.by_group.get(group) {
            if let Some(entry) = self.slots.get_mut(slot) {
                entry.refs += 1;
            }
            return;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        let present: Vec<bool> = group.keys.iter().map(|k| contains(k)).collect();
        let present_count = present.iter().filter(|p| **p).count();
        for (pos, key) in group.keys.iter().enumerate() {
            self.members.entry(key.clone()).or_default().push((slot, pos));
        }
        self.by_group.insert(group.clone(), slot);
        self.slots
            .insert(slot, GroupEntry { group: group.clone(), present, present_count, refs: 1 });
    }

    /// Drop one reference; the group stops being tracked when none remain.
    pub fn unregister(&mut self, group: &Group) {
        let Some(&slot) = self.by_group.get(group) else {
            return;
        };
        let Some(entry) = self.slots.get_mut(&slot) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        self.by_group.remove(group);
        if let Some(entry) = self.slots.remove(&slot) {
            for key in &entry.group.keys {
                if let Some(list) = self.members.get_mut(key) {
                    list.retain(|(s, _)| *s != slot);
                    if list.is_empty() {
                        self.members.remove(key);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_group.clear();
        self.members.clear();
    }

    /// Record whether `key` is currently available locally.
    pub fn set_present(&mut self, key: &Key, present: bool) {
        let Some(list) = self.members.get(key) else {
            return;
        };
        for &(slot, pos) in list {
            if let Some(entry) = self.slots.get_mut(&slot) {
                if entry.present[pos] != present {
                    entry.present[pos] = present;
                    if present {
                        entry.present_count += 1;
                    } else {
                        entry.present_count -= 1;
                    }
                }
            }
        }
    }

    pub fn present_count(&self, group: &Group) -> Option<usize> {
        let slot = self.by_group.get(group)?;
        self.slots.get(slot).map(|e| e.present_count)
    }

    /// At least `information_length` blocks are present; unknown groups are incomplete.
    pub fn is_complete(&self, group: &Group) -> bool {
        self.present_count(group).is_some_and(|n| n >= group.information_length)
    }

    pub fn present_keys(&self, group: &Group) -> Vec<Key> {
        let Some(entry) = self.by_group.get(group).and_then(|s| self.slots.get(s)) else {
            return Vec::new();
        };
        entry
            .group
            .keys
            .iter()
            .zip(&entry.present)
            .filter(|(_, p)| **p)
            .map(|(k, _)| k.clone())
            .collect()
    }
}
