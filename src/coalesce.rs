use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::MediaSDKError;

type SharedResult<V> = Shared<BoxFuture<'static, Result<V, MediaSDKError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Resolved,
    /// Only observable in the instant between a producer failing and its entry being evicted.
    Rejected,
}

struct Entry<V> {
    generation: u64,
    future: SharedResult<V>,
}

struct Entries<K, V> {
    map: HashMap<K, Entry<V>>,
    next_generation: u64,
}

/// Keyed memoization of in-flight and completed work.
///
/// The first caller for a key runs the producer, everyone arriving while it is pending (or
/// after it resolved) awaits the same shared future. A failed producer is evicted so the next
/// caller starts over. Each entry carries a generation so that a late failure of a replaced
/// entry cannot evict its replacement.
pub struct CoalescingCache<K, V> {
    entries: Arc<Mutex<Entries<K, V>>>,
}

impl<K, V> Default for CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                map: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Returns the existing entry for `key` or starts `producer`. The producer is not invoked
    /// if an entry is pending or resolved. The entry is registered when this is called, not when
    /// the returned future is first polled.
    pub fn get_or_start<F, Fut>(
        &self,
        key: K,
        producer: F,
    ) -> impl Future<Output = Result<V, MediaSDKError>> + Send + 'static
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, MediaSDKError>> + Send + 'static,
    {
        self.start(key, producer, false)
    }

    /// Always invokes `producer`, replacing whatever entry exists for `key`.
    pub fn force_start<F, Fut>(
        &self,
        key: K,
        producer: F,
    ) -> impl Future<Output = Result<V, MediaSDKError>> + Send + 'static
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, MediaSDKError>> + Send + 'static,
    {
        self.start(key, producer, true)
    }

    pub fn state(&self, key: &K) -> Option<EntryState> {
        let entries = lock(&self.entries);
        entries.map.get(key).map(|entry| match entry.future.peek() {
            None => EntryState::Pending,
            Some(Ok(_)) => EntryState::Resolved,
            Some(Err(_)) => EntryState::Rejected,
        })
    }

    /// Result of a resolved entry, without waiting on pending ones.
    pub fn peek(&self, key: &K) -> Option<V> {
        let entries = lock(&self.entries);
        match entries.map.get(key)?.future.peek() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The entry for `key`, pending or resolved, without starting anything.
    pub fn get(&self, key: &K) -> Option<impl Future<Output = Result<V, MediaSDKError>> + Send + 'static> {
        lock(&self.entries).map.get(key).map(|entry| entry.future.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.entries).map.contains_key(key)
    }

    pub fn invalidate(&self, key: &K) {
        lock(&self.entries).map.remove(key);
    }

    /// Evicts a resolved entry whose value matches `predicate`. Pending entries are left alone,
    /// so a replacement started by someone else survives.
    pub fn invalidate_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> bool {
        let mut entries = lock(&self.entries);
        let matches = match entries.map.get(key).and_then(|entry| entry.future.peek()) {
            Some(Ok(value)) => predicate(value),
            _ => false,
        };
        if matches {
            entries.map.remove(key);
        }
        matches
    }

    pub fn clear(&self) {
        lock(&self.entries).map.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start<F, Fut>(&self, key: K, producer: F, force: bool) -> SharedResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, MediaSDKError>> + Send + 'static,
    {
        let generation = {
            let mut entries = lock(&self.entries);
            if !force {
                if let Some(entry) = entries.map.get(&key) {
                    return entry.future.clone();
                }
            }
            let generation = entries.next_generation;
            entries.next_generation += 1;
            generation
        };

        // Invoked unlocked, the producer may use this cache itself.
        let work = producer();
        let weak_entries: Weak<Mutex<Entries<K, V>>> = Arc::downgrade(&self.entries);
        let evict_key = key.clone();

        let future = async move {
            let result = work.await;
            if result.is_err() {
                if let Some(entries) = weak_entries.upgrade() {
                    let mut entries = lock(&entries);
                    let is_current = entries
                        .map
                        .get(&evict_key)
                        .is_some_and(|entry| entry.generation == generation);
                    if is_current {
                        entries.map.remove(&evict_key);
                    }
                }
            }
            result
        }
        .boxed()
        .shared();

        let mut entries = lock(&self.entries);
        if !force {
            // Another caller registered the key while the producer was being invoked.
            if let Some(entry) = entries.map.get(&key) {
                return entry.future.clone();
            }
        }
        entries.map.insert(
            key,
            Entry {
                generation,
                future: future.clone(),
            },
        );

        future
    }
}

fn lock<K, V>(entries: &Mutex<Entries<K, V>>) -> MutexGuard<'_, Entries<K, V>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
