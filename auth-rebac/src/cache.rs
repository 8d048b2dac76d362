use crate::models::{EntityRef, RelationName, SubjectRef};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

type CheckKey = (SubjectRef, RelationName, EntityRef);

/// Expired entries are swept once per this many inserts
const SWEEP_EVERY: usize = 1024;

/// Short-lived cache of Check answers.
///
/// Entries expire after `ttl`. The engine clears the whole cache after each
/// of its own mutations, so a caller always sees its own writes; the TTL
/// only bounds how stale an answer can be after another process writes.
///
/// Every `clear` starts a new generation. An answer computed during an older
/// generation may predate a local write and is never kept.
pub struct CheckCache {
    entries: DashMap<CheckKey, (bool, Instant)>,
    ttl: Duration,
    generation: AtomicU64,
    inserts: AtomicUsize,
}

impl CheckCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            generation: AtomicU64::new(0),
            inserts: AtomicUsize::new(0),
        }
    }

    /// Current generation; capture it before evaluating a check
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, subject: &SubjectRef, relation: RelationName, object: &EntityRef) -> Option<bool> {
        let key = (subject.clone(), relation, object.clone());
        let fresh = {
            let entry = self.entries.get(&key)?;
            let (allowed, inserted_at) = *entry;
            (inserted_at.elapsed() < self.ttl).then_some(allowed)
        };

        match fresh {
            Some(allowed) => {
                debug!("Cache hit for permission check: {} {} {}", subject, relation, object);
                Some(allowed)
            }
            None => {
                self.entries.remove(&key);
                None
            }
        }
    }

    /// Cache an answer computed during `generation`. Dropped if the cache
    /// was cleared since.
    pub fn insert(
        &self,
        subject: &SubjectRef,
        relation: RelationName,
        object: &EntityRef,
        allowed: bool,
        generation: u64,
    ) {
        if self.generation() != generation {
            return;
        }

        let key = (subject.clone(), relation, object.clone());
        self.entries.insert(key.clone(), (allowed, Instant::now()));

        // A clear racing with the insert above may have missed the entry
        if self.generation() != generation {
            self.entries.remove(&key);
            return;
        }

        if self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, inserted_at)| inserted_at.elapsed() < self.ttl);
        debug!("Purged {} expired check cache entries", before.saturating_sub(self.entries.len()));
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
