use super::classifier::PreparedStatementInfo;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct CacheEntry {
    info: Arc<PreparedStatementInfo>,
    /// Logical-clock tick of the last lookup, for LRU eviction.
    last_used: AtomicU64,
    /// Number of EXECUTEs currently in flight against this entry; pinned
    /// entries are never evicted.
    in_flight: AtomicUsize,
}

/// Bounded concurrent map from server-issued prepared ids to their
/// classification and rewrite metadata.
///
/// Lookups are the hot EXECUTE path: the map is sharded (dashmap), so
/// readers only contend within a shard and never take an exclusive lock.
/// Inserts are idempotent per id; eviction is LRU over unpinned entries.
pub struct PreparedStatementCache {
    entries: DashMap<Bytes, Arc<CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
}

impl PreparedStatementCache {
    pub fn new(capacity: usize) -> PreparedStatementCache {
        PreparedStatementCache {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a prepared id, refreshing its recency.
    pub fn lookup(&self, id: &[u8]) -> Option<Arc<PreparedStatementInfo>> {
        let entry = self.entries.get(id)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&entry.info))
    }

    /// Look up and pin a prepared id for the duration of an EXECUTE; the
    /// returned guard unpins on drop.
    pub fn checkout(&self, id: &[u8]) -> Option<ExecuteGuard> {
        let entry = {
            let entry = self.entries.get(id)?;
            Arc::clone(&entry)
        };
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        entry.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(ExecuteGuard { entry })
    }

    /// Insert the metadata for a freshly prepared id. A second PREPARE of
    /// the same CQL returns the same server-assigned id, so an existing
    /// entry is kept as-is.
    pub fn insert(&self, id: Bytes, info: PreparedStatementInfo) {
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get().info.decision != info.decision {
                    // A prepared id must never change decision.
                    warn!(
                        "ignoring conflicting re-registration of prepared id: {:?} != {:?}",
                        existing.get().info.decision,
                        info.decision
                    );
                }
                existing.get().last_used.store(self.tick(), Ordering::Relaxed);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(CacheEntry {
                    info: Arc::new(info),
                    last_used: AtomicU64::new(self.tick()),
                    in_flight: AtomicUsize::new(0),
                }));
            }
        }

        while self.entries.len() > self.capacity {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Remove the least-recently-used unpinned entry. Returns false when
    /// every entry is pinned, in which case the cache runs over capacity
    /// until EXECUTEs drain.
    fn evict_one(&self) -> bool {
        let mut victim: Option<(Bytes, u64)> = None;
        for entry in self.entries.iter() {
            if entry.value().in_flight.load(Ordering::Acquire) > 0 {
                continue;
            }
            let used = entry.value().last_used.load(Ordering::Relaxed);
            if victim.as_ref().map_or(true, |(_, best)| used < *best) {
                victim = Some((entry.key().clone(), used));
            }
        }
        match victim {
            Some((key, _)) => {
                debug!("evicting prepared statement from cache");
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// Pin on a cache entry held while its EXECUTE is in flight.
pub struct ExecuteGuard {
    entry: Arc<CacheEntry>,
}

impl ExecuteGuard {
    pub fn info(&self) -> &Arc<PreparedStatementInfo> {
        &self.entry.info
    }
}

impl Drop for ExecuteGuard {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
