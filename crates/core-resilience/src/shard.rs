//! Sharded key/value store
//!
//! Every per-key store in the gateway (servers, breakers, pools, tenants)
//! sits behind one of these so that requests touching unrelated keys never
//! contend on the same lock. Keys are routed to a shard by hash; each shard
//! is an independent `RwLock<HashMap>`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default shard count, enough to spread a few thousand keys
pub const DEFAULT_SHARDS: usize = 16;

/// A string-keyed map split into independently locked shards
#[derive(Debug)]
pub struct ShardedMap<V> {
    shards: Box<[RwLock<HashMap<String, V>>]>,
}

impl<V> ShardedMap<V> {
    /// Create a map with [`DEFAULT_SHARDS`] shards
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create a map with a specific shard count (at least one)
    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn read_shard(&self, idx: usize) -> RwLockReadGuard<'_, HashMap<String, V>> {
        // A panicked writer cannot leave a HashMap half-updated in a way we
        // care about, so poisoning is ignored.
        self.shards[idx]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, idx: usize) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        self.shards[idx]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with shared access to the value for `key`
    pub fn with<R>(&self, key: &str, f: impl FnOnce(Option<&V>) -> R) -> R {
        let shard = self.read_shard(self.shard_index(key));
        f(shard.get(key))
    }

    /// Run `f` with exclusive access to the value for `key`
    pub fn with_mut<R>(&self, key: &str, f: impl FnOnce(Option<&mut V>) -> R) -> R {
        let mut shard = self.write_shard(self.shard_index(key));
        f(shard.get_mut(key))
    }

    /// Run `f` with exclusive access to the whole entry slot for `key`
    ///
    /// Allows atomic check-then-insert within a single shard.
    pub fn with_entry<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, V>) -> R) -> R {
        let mut shard = self.write_shard(self.shard_index(key));
        f(&mut shard)
    }

    /// Returns true if `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.with(key, |v| v.is_some())
    }

    /// Insert a value, returning the previous one
    pub fn insert(&self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        let idx = self.shard_index(&key);
        self.write_shard(idx).insert(key, value)
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<V> {
        self.write_shard(self.shard_index(key)).remove(key)
    }

    /// Visit every entry, one shard at a time
    pub fn for_each(&self, mut f: impl FnMut(&str, &V)) {
        for idx in 0..self.shards.len() {
            let shard = self.read_shard(idx);
            for (k, v) in shard.iter() {
                f(k, v);
            }
        }
    }

    /// Keep only entries for which `keep` returns true, returning the removed ones
    pub fn retain(&self, mut keep: impl FnMut(&str, &mut V) -> bool) -> Vec<(String, V)> {
        let mut removed = Vec::new();
        for idx in 0..self.shards.len() {
            let mut shard = self.write_shard(idx);
            let doomed: Vec<String> = shard
                .iter_mut()
                .filter_map(|(k, v)| (!keep(k, v)).then(|| k.clone()))
                .collect();
            for key in doomed {
                if let Some(v) = shard.remove(&key) {
                    removed.push((key, v));
                }
            }
        }
        removed
    }

    /// Number of entries across all shards
    pub fn len(&self) -> usize {
        (0..self.shards.len())
            .map(|idx| self.read_shard(idx).len())
            .sum()
    }

    /// Returns true if no shard holds an entry
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> ShardedMap<V> {
    /// Clone the value for `key`
    pub fn get_cloned(&self, key: &str) -> Option<V> {
        self.with(key, |v| v.cloned())
    }

    /// Clone all values
    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::new();
        self.for_each(|_, v| out.push(v.clone()));
        out
    }

    /// Return the existing value for `key`, or insert the one built by `make`
    pub fn get_or_insert_with(&self, key: &str, make: impl FnOnce() -> V) -> V {
        if let Some(existing) = self.get_cloned(key) {
            return existing;
        }
        self.with_entry(key, |map| {
            map.entry(key.to_string()).or_insert_with(make).clone()
        })
    }
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
