//! Query-level caches
//!
//! Two caches live outside a single evaluation:
//!
//! - [`InterQueryCache`]: shared across queries and handed to builtins that
//!   cache external effects, and used by the VM's own eval cache. Mutation is
//!   the cache's responsibility; implementations synchronize internally.
//! - [`NdbCache`]: per-query cache for nondeterministic builtin calls, keyed
//!   by name and argument values, so repeated calls inside one query observe
//!   one result.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;
use verdict_core::{Table, Value, ValueKeyOps};

/// A shared, internally synchronized cache with per-entry expiry.
pub trait InterQueryCache: Send + Sync {
    /// Fetch a live entry. Implementations drop entries expired at `now`.
    fn get(&self, key: &str, now: SystemTime) -> Option<Value>;

    /// Store an entry, optionally with an absolute expiry.
    fn insert(&self, key: &str, value: Value, expires_at: Option<SystemTime>);
}

/// Size-bounded in-memory [`InterQueryCache`], evicting expired entries
/// first and then oldest-inserted.
pub struct MemoryInterQueryCache {
    max_bytes: usize,
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    used: usize,
}

struct CacheEntry {
    value: Value,
    expires_at: Option<SystemTime>,
    size: usize,
}

impl MemoryInterQueryCache {
    /// `max_bytes` of zero means unbounded.
    pub fn new(max_bytes: usize) -> MemoryInterQueryCache {
        MemoryInterQueryCache {
            max_bytes,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InterQueryCache for MemoryInterQueryCache {
    fn get(&self, key: &str, now: SystemTime) -> Option<Value> {
        let mut inner = lock(&self.inner);
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(e) => e.expires_at.is_some_and(|at| now >= at),
        };
        if expired {
            if let Some(e) = inner.entries.remove(key) {
                inner.used -= e.size;
            }
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    fn insert(&self, key: &str, value: Value, expires_at: Option<SystemTime>) {
        let size = key.len() + value_size(&value);
        if self.max_bytes != 0 && size > self.max_bytes {
            return;
        }
        let mut inner = lock(&self.inner);
        if let Some(old) = inner.entries.remove(key) {
            inner.used -= old.size;
        }
        while self.max_bytes != 0 && inner.used + size > self.max_bytes {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(e) = inner.entries.remove(&oldest) {
                inner.used -= e.size;
            }
        }
        inner.used += size;
        inner.order.push_back(key.to_string());
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at,
                size,
            },
        );
    }
}

/// Per-query cache of nondeterministic builtin results.
pub struct NdbCache {
    max_bytes: usize,
    inner: Mutex<NdbInner>,
}

struct NdbInner {
    table: Table<Value, Value, ValueKeyOps>,
    used: usize,
}

impl NdbCache {
    /// `max_bytes` of zero means unbounded.
    pub fn new(max_bytes: usize) -> NdbCache {
        NdbCache {
            max_bytes,
            inner: Mutex::new(NdbInner {
                table: Table::new(ValueKeyOps),
                used: 0,
            }),
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        lock(&self.inner).table.get(key).cloned()
    }

    /// Insertions past the byte budget are dropped, not evicted: within one
    /// query the first observed result must stay authoritative.
    pub fn insert(&self, key: Value, value: Value) {
        let size = value_size(&key) + value_size(&value);
        let mut inner = lock(&self.inner);
        if self.max_bytes != 0 && inner.used + size > self.max_bytes {
            return;
        }
        if inner.table.put(key, value).is_none() {
            inner.used += size;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rough heap footprint of a value, for cache budgets.
pub(crate) fn value_size(v: &Value) -> usize {
    match v {
        Value::Null | Value::Bool(_) | Value::Number(_) => 16,
        Value::String(s) => 16 + s.len(),
        Value::Array(a) => 16 + a.iter().map(value_size).sum::<usize>(),
        Value::Object(o) => {
            let mut sum = 16;
            for (k, val) in o.iter() {
                sum += value_size(k) + value_size(val);
            }
            sum
        }
        Value::Set(s) => 16 + s.iter().map(value_size).sum::<usize>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_memory_cache_ttl() {
        let cache = MemoryInterQueryCache::new(0);
        cache.insert("k", Value::int(1), Some(at(10)));
        assert_eq!(cache.get("k", at(5)), Some(Value::int(1)));
        assert_eq!(cache.get("k", at(10)), None);
        // Expired entry was dropped.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_memory_cache_eviction() {
        let cache = MemoryInterQueryCache::new(200);
        cache.insert("a", Value::string("x".repeat(80)), None);
        cache.insert("b", Value::string("y".repeat(80)), None);
        // Third entry forces the oldest out.
        cache.insert("c", Value::string("z".repeat(80)), None);
        assert_eq!(cache.get("a", at(0)), None);
        assert!(cache.get("c", at(0)).is_some());
    }

    #[test]
    fn test_ndb_cache_first_result_wins_budget() {
        let cache = NdbCache::new(64);
        cache.insert(Value::string("k1"), Value::int(1));
        // Over budget: dropped silently.
        cache.insert(Value::string("k2"), Value::string("v".repeat(100)));
        assert_eq!(cache.get(&Value::string("k1")), Some(Value::int(1)));
        assert_eq!(cache.get(&Value::string("k2")), None);
    }

    #[test]
    fn test_ndb_cache_value_keys() {
        let cache = NdbCache::new(0);
        let key = Value::Array(vec![Value::string("rand"), Value::int(3)].into());
        cache.insert(key.clone(), Value::int(42));
        let same = Value::Array(vec![Value::string("rand"), Value::float(3.0)].into());
        // 3 and 3.0 are the same argument value.
        assert_eq!(cache.get(&same), Some(Value::int(42)));
    }
}
