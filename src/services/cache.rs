//! In-memory caches with time-to-live expiration
//!
//! Caches only ever short-circuit lookups: a miss (absent or expired entry) sends
//! the caller to storage, so eviction never affects correctness.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Map whose entries expire `ttl` after insertion (or after the last access,
/// with extend-on-access enabled)
#[derive(Debug)]
pub struct ExpiringCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    extend_on_access: bool,
    capacity: usize,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Cache holding at most `capacity` entries for `ttl` each
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            extend_on_access: false,
            capacity: capacity.max(1),
        }
    }

    /// Restart an entry's time-to-live every time it is read
    pub fn with_extend_on_access(mut self, extend: bool) -> Self {
        self.extend_on_access = extend;
        self
    }

    /// Time-to-live of new entries
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Value cached for `key`, if present and not expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                if self.extend_on_access {
                    entry.expires_at = now + self.ttl;
                }
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Cache `value` under `key`
    pub fn put(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Forget `key`
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|entry| entry.value)
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Entries currently held, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is held
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Two-way cache between surrogate ids and the values they stand for
#[derive(Debug)]
pub struct BiCache<V> {
    by_value: ExpiringCache<V, i64>,
    by_id: ExpiringCache<i64, V>,
}

impl<V> BiCache<V>
where
    V: Eq + Hash + Clone,
{
    /// Extend-on-access cache of at most `capacity` pairs
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            by_value: ExpiringCache::new(capacity, ttl).with_extend_on_access(true),
            by_id: ExpiringCache::new(capacity, ttl).with_extend_on_access(true),
        }
    }

    /// Id cached for `value`
    pub fn get_id(&self, value: &V) -> Option<i64> {
        self.by_value.get(value)
    }

    /// Value cached for `id`
    pub fn get_value(&self, id: i64) -> Option<V> {
        self.by_id.get(&id)
    }

    /// Cache the pair in both directions
    pub fn put(&self, id: i64, value: V) {
        self.by_id.put(id, value.clone());
        self.by_value.put(value, id);
    }

    /// Forget both directions of the pair with `id`
    pub fn invalidate_id(&self, id: i64) {
        if let Some(value) = self.by_id.invalidate(&id) {
            self.by_value.invalidate(&value);
        }
    }

    /// Forget everything
    pub fn clear(&self) {
        self.by_value.clear();
        self.by_id.clear();
    }
}
