//! Conversation cache: pins a conversation's thread id to the worker
//! address that first handled its CONNECT, so later REQUESTs on that
//! thread keep landing on the same worker (spec §3, §4.7).
//!
//! Bounded at a fixed capacity; once full, surplus CONNECTs simply aren't
//! cached — the call still works, it's just unpinned and may land on a
//! different worker next time.

use std::num::NonZeroUsize;

use lru::LruCache;
use osrf_wire::Address;
use tokio::sync::Mutex;

/// Default bound from spec §3 ("bounded at 64 entries by default").
pub const DEFAULT_CAPACITY: usize = 64;

pub struct ConversationCache {
    entries: Mutex<LruCache<String, Address>>,
}

impl ConversationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        ConversationCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Pins `thread` to `worker`. A surplus CONNECT arriving once the cache
    /// is full is silently dropped rather than evicting an existing pin —
    /// `lru::LruCache::put` would otherwise bump the least-recently-used
    /// entry out to make room, which is the opposite of what "bounded,
    /// existing pins stick" means (spec §4.7). Updating an already-pinned
    /// thread's address still goes through.
    pub async fn set(&self, thread: &str, worker: Address) {
        let mut entries = self.entries.lock().await;
        if !entries.contains(thread) && entries.len() >= entries.cap().get() {
            return;
        }
        entries.put(thread.to_owned(), worker);
    }

    pub async fn get(&self, thread: &str) -> Option<Address> {
        self.entries.lock().await.get(thread).cloned()
    }

    pub async fn remove(&self, thread: &str) {
        self.entries.lock().await.pop(thread);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
