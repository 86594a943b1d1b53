use std::num::NonZeroUsize;
use std::time::Duration;

use alloy::primitives::TxHash;
use parking_lot::Mutex;
use tokio::time::Instant;

pub const DEFAULT_PANIC_CACHE_SIZE: usize = 5000;
pub const DEFAULT_PANIC_CACHE_TTL: Duration = Duration::from_secs(60);

/// Remembers which transactions crashed the tracer recently.
///
/// Bounded LRU with a time to live: entries older than the TTL read as
/// absent regardless of how recently they were accessed. Missing entries
/// only cost a repeated replay, never a wrong answer.
#[derive(Debug)]
pub struct PanicResultCache {
    entries: Mutex<lru::LruCache<TxHash, (bool, Instant)>>,
    ttl: Duration,
}

impl PanicResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, hash: &TxHash) -> Option<bool> {
        let mut entries = self.entries.lock();
        let cached = entries.get(hash).copied();
        match cached {
            Some((did_panic, inserted)) if inserted.elapsed() < self.ttl => Some(did_panic),
            Some(_) => {
                entries.pop(hash);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, hash: TxHash, did_panic: bool) {
        self.entries.lock().put(hash, (did_panic, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PanicResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_PANIC_CACHE_SIZE, DEFAULT_PANIC_CACHE_TTL)
    }
}
