//! Replay protection list.
//!
//! Remembers `(source, sequence, iv index)` triples of PDUs this node accepted
//! for itself. Membership queries never reorder the history; only insertion
//! refreshes recency. When the list is full the configured
//! [`EvictionPolicy`] decides between refusing the new entry and forgetting
//! the least recently added one.

use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, trace};

use crate::protocols::ReplayStore;


pub const DEFAULT_REPLAY_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Refuse new entries with [`CacheFull`] once capacity is reached.
    RejectWhenFull,
    /// Forget the least recently added entry to make room.
    #[default]
    EvictLeastRecent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplayEntry {
    pub src: u16,
    pub seq: u32,
    pub iv_index: u32,
}

impl ReplayEntry {
    pub fn new(src: u16, seq: u32, iv_index: u32) -> Self {
        Self { src, seq, iv_index }
    }
}

/// The replay list has no room and its policy forbids eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFull {
    pub capacity: usize,
}

impl fmt::Display for CacheFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replay cache full ({} entries)", self.capacity)
    }
}

impl std::error::Error for CacheFull {}


#[derive(Debug)]
pub struct ReplayCache {
    entries: LruCache<ReplayEntry, ()>,
    policy: EvictionPolicy,
}

impl ReplayCache {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            entries: LruCache::new(capacity),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CACHE_CAPACITY, EvictionPolicy::default())
    }
}

impl ReplayStore for ReplayCache {
    fn has_elem(&self, src: u16, seq: u32, iv_index: u32) -> bool {
        self.entries.contains(&ReplayEntry::new(src, seq, iv_index))
    }

    fn add(&mut self, src: u16, seq: u32, iv_index: u32) -> Result<(), CacheFull> {
        let entry = ReplayEntry::new(src, seq, iv_index);
        if self.entries.contains(&entry) {
            return Ok(());
        }

        if self.entries.len() >= self.capacity() {
            match self.policy {
                EvictionPolicy::RejectWhenFull => {
                    debug!(src, seq, iv_index, capacity = self.capacity(), "replay cache full");
                    return Err(CacheFull { capacity: self.capacity() });
                }
                EvictionPolicy::EvictLeastRecent => {
                    if let Some((evicted, _)) = self.entries.pop_lru() {
                        trace!(
                            src = evicted.src,
                            seq = evicted.seq,
                            iv_index = evicted.iv_index,
                            "evicted replay entry"
                        );
                    }
                }
            }
        }

        self.entries.put(entry, ());
        Ok(())
    }

    fn prune_before(&mut self, iv_index: u32) {
        let stale: Vec<ReplayEntry> = self.entries
            .iter()
            .filter(|(entry, _)| entry.iv_index < iv_index)
            .map(|(entry, _)| *entry)
            .collect();

        for entry in &stale {
            self.entries.pop(entry);
        }

        if !stale.is_empty() {
            debug!(
                pruned = stale.len(),
                remaining = self.entries.len(),
                iv_index,
                "pruned replay entries from older epochs"
            );
        }
    }
}
