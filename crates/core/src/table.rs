//! Two-tier hash table
//!
//! The backing store for large objects, sets, memoization frames, and
//! intermediate dedup. Hashing and equality are supplied by the caller
//! through [`KeyOps`], so the same table serves value-keyed documents and
//! fingerprint-keyed memo frames.
//!
//! Small tables live in a compact inline vector (capacity tiers 2, 4, 8, 16)
//! and look keys up by linear scan against a cached 64-bit key digest. Past
//! sixteen entries the table promotes to chained buckets, re-inserting
//! entries by their cached digests without touching the keys again.

/// Caller-supplied hash and equality for table keys.
pub trait KeyOps<K> {
    fn hash(&self, key: &K) -> u64;
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// Largest compact tier before promotion to buckets.
const COMPACT_MAX: usize = 16;
/// Initial bucket count after promotion. Always a power of two.
const INITIAL_BUCKETS: usize = 32;
/// Grow the bucket array when entries exceed buckets * LOAD_NUM / LOAD_DEN.
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 2;

#[derive(Clone, Debug)]
struct Entry<K, V> {
    hash: u64,
    key: K,
    value: V,
}

#[derive(Clone, Debug)]
enum Repr<K, V> {
    Compact(Vec<Entry<K, V>>),
    Buckets(Vec<Vec<Entry<K, V>>>),
}

#[derive(Clone, Debug)]
pub struct Table<K, V, O> {
    ops: O,
    len: usize,
    repr: Repr<K, V>,
}

impl<K, V, O: KeyOps<K>> Table<K, V, O> {
    pub fn new(ops: O) -> Self {
        Table {
            ops,
            len: 0,
            repr: Repr::Compact(Vec::new()),
        }
    }

    pub fn with_capacity(ops: O, cap: usize) -> Self {
        let mut t = Table::new(ops);
        if cap > COMPACT_MAX {
            t.repr = Repr::Buckets(new_buckets(bucket_count_for(cap)));
        } else {
            t.repr = Repr::Compact(Vec::with_capacity(tier_for(cap)));
        }
        t
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.get_hashed(self.ops.hash(key), key)
    }

    /// Lookup with a digest the caller already computed.
    pub fn get_hashed(&self, hash: u64, key: &K) -> Option<&V> {
        match &self.repr {
            Repr::Compact(entries) => entries
                .iter()
                .find(|e| e.hash == hash && self.ops.eq(&e.key, key))
                .map(|e| &e.value),
            Repr::Buckets(buckets) => buckets[bucket_index(hash, buckets.len())]
                .iter()
                .find(|e| e.hash == hash && self.ops.eq(&e.key, key))
                .map(|e| &e.value),
        }
    }

    /// Insert or overwrite; returns the previous value when the key was
    /// already present (no growth happens in that case).
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.put_hashed(self.ops.hash(&key), key, value)
    }

    /// Insert with a digest the caller already computed.
    pub fn put_hashed(&mut self, hash: u64, key: K, value: V) -> Option<V> {
        match &mut self.repr {
            Repr::Compact(entries) => {
                for e in entries.iter_mut() {
                    if e.hash == hash && self.ops.eq(&e.key, &key) {
                        return Some(std::mem::replace(&mut e.value, value));
                    }
                }
                if entries.len() == entries.capacity() {
                    if entries.len() >= COMPACT_MAX {
                        self.promote();
                        return self.put_hashed(hash, key, value);
                    }
                    let next = tier_for(entries.len() + 1);
                    entries.reserve_exact(next - entries.len());
                }
                entries.push(Entry { hash, key, value });
                self.len += 1;
                None
            }
            Repr::Buckets(buckets) => {
                let idx = bucket_index(hash, buckets.len());
                for e in buckets[idx].iter_mut() {
                    if e.hash == hash && self.ops.eq(&e.key, &key) {
                        return Some(std::mem::replace(&mut e.value, value));
                    }
                }
                buckets[idx].push(Entry { hash, key, value });
                self.len += 1;
                if self.len * LOAD_DEN > buckets.len() * LOAD_NUM {
                    self.grow_buckets();
                }
                None
            }
        }
    }

    /// Remove an entry; no-op when the key is absent.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let hash = self.ops.hash(key);
        match &mut self.repr {
            Repr::Compact(entries) => {
                let pos = entries
                    .iter()
                    .position(|e| e.hash == hash && self.ops.eq(&e.key, key))?;
                self.len -= 1;
                Some(entries.remove(pos).value)
            }
            Repr::Buckets(buckets) => {
                let idx = bucket_index(hash, buckets.len());
                let chain = &mut buckets[idx];
                let pos = chain
                    .iter()
                    .position(|e| e.hash == hash && self.ops.eq(&e.key, key))?;
                self.len -= 1;
                Some(chain.swap_remove(pos).value)
            }
        }
    }

    /// Visit entries until the callback asks to stop. Compact tables iterate
    /// in insertion order; bucketed tables in bucket order. Both orders are
    /// stable for an unmodified table.
    pub fn for_each_until(&self, mut f: impl FnMut(&K, &V) -> bool) -> bool {
        match &self.repr {
            Repr::Compact(entries) => {
                for e in entries {
                    if f(&e.key, &e.value) {
                        return true;
                    }
                }
            }
            Repr::Buckets(buckets) => {
                for chain in buckets {
                    for e in chain {
                        if f(&e.key, &e.value) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Commutative content hash: a wrapping sum of per-entry digests produced
    /// by the caller, so iteration order cannot leak into the result.
    pub fn content_hash(&self, mut entry_hash: impl FnMut(u64, &K, &V) -> u64) -> u64 {
        let mut accum = 0u64;
        self.for_each_until(|k, v| {
            let kh = self.ops.hash(k);
            accum = accum.wrapping_add(entry_hash(kh, k, v));
            false
        });
        accum
    }

    /// Same size and, for every key in self, an equal value in other.
    pub fn equal(&self, other: &Self, mut value_eq: impl FnMut(&V, &V) -> bool) -> bool {
        if self.len != other.len {
            return false;
        }
        !self.for_each_until(|k, v| match other.get(k) {
            Some(ov) => !value_eq(v, ov),
            None => true,
        })
    }

    fn promote(&mut self) {
        let entries = match std::mem::replace(&mut self.repr, Repr::Buckets(Vec::new())) {
            Repr::Compact(entries) => entries,
            Repr::Buckets(_) => unreachable!("promote called on bucketed table"),
        };
        let mut buckets = new_buckets(INITIAL_BUCKETS);
        for e in entries {
            buckets[bucket_index(e.hash, INITIAL_BUCKETS)].push(e);
        }
        self.repr = Repr::Buckets(buckets);
    }

    fn grow_buckets(&mut self) {
        let old = match std::mem::replace(&mut self.repr, Repr::Buckets(Vec::new())) {
            Repr::Buckets(buckets) => buckets,
            Repr::Compact(_) => unreachable!("grow_buckets called on compact table"),
        };
        let n = old.len() * 2;
        let mut buckets = new_buckets(n);
        for chain in old {
            for e in chain {
                buckets[bucket_index(e.hash, n)].push(e);
            }
        }
        self.repr = Repr::Buckets(buckets);
    }

    /// True when the table has promoted out of the compact tier.
    pub fn is_bucketed(&self) -> bool {
        matches!(self.repr, Repr::Buckets(_))
    }

    /// Borrowing iterator over entries, in the same order as
    /// [`Table::for_each_until`].
    pub fn iter(&self) -> Iter<'_, K, V> {
        match &self.repr {
            Repr::Compact(entries) => Iter {
                chain: entries.iter(),
                rest: Default::default(),
            },
            Repr::Buckets(buckets) => Iter {
                chain: Default::default(),
                rest: buckets.iter(),
            },
        }
    }
}

pub struct Iter<'a, K, V> {
    chain: std::slice::Iter<'a, Entry<K, V>>,
    rest: std::slice::Iter<'a, Vec<Entry<K, V>>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.chain.next() {
                return Some((&e.key, &e.value));
            }
            self.chain = self.rest.next()?.iter();
        }
    }
}

impl<K: Clone, V: Clone, O: KeyOps<K> + Clone> Table<K, V, O> {
    /// Shallow copy.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Merge `other` into self; other wins on conflicts.
    pub fn update(&mut self, other: &Self) {
        other.for_each_until(|k, v| {
            self.put(k.clone(), v.clone());
            false
        });
    }
}

fn new_buckets<K, V>(n: usize) -> Vec<Vec<Entry<K, V>>> {
    let mut buckets = Vec::with_capacity(n);
    buckets.resize_with(n, Vec::new);
    buckets
}

fn bucket_index(hash: u64, n: usize) -> usize {
    // n is always a power of two.
    (hash as usize) & (n - 1)
}

fn bucket_count_for(cap: usize) -> usize {
    let mut n = INITIAL_BUCKETS;
    while cap * LOAD_DEN > n * LOAD_NUM {
        n *= 2;
    }
    n
}

fn tier_for(len: usize) -> usize {
    for tier in [2usize, 4, 8, 16] {
        if len <= tier {
            return tier;
        }
    }
    COMPACT_MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct StrOps;

    impl KeyOps<String> for StrOps {
        fn hash(&self, key: &String) -> u64 {
            // Deliberately collision-heavy to exercise chain walks.
            key.len() as u64
        }
        fn eq(&self, a: &String, b: &String) -> bool {
            a == b
        }
    }

    fn key(i: usize) -> String {
        format!("key-{i:04}")
    }

    #[test]
    fn test_put_get_delete() {
        let mut t = Table::new(StrOps);
        assert!(t.put(key(1), 10).is_none());
        assert!(t.put(key(2), 20).is_none());
        assert_eq!(t.put(key(1), 11), Some(10));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&key(1)), Some(&11));
        assert_eq!(t.delete(&key(2)), Some(20));
        assert_eq!(t.delete(&key(2)), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_promotion_preserves_entries() {
        let mut t = Table::new(StrOps);
        for i in 0..40 {
            t.put(key(i), i);
        }
        assert!(t.is_bucketed());
        assert_eq!(t.len(), 40);
        for i in 0..40 {
            assert_eq!(t.get(&key(i)), Some(&i), "lost entry {i}");
        }
    }

    #[test]
    fn test_collisions_resolved_by_eq() {
        // All keys of equal length collide under StrOps.
        let mut t = Table::new(StrOps);
        t.put("aaaa".to_string(), 1);
        t.put("bbbb".to_string(), 2);
        t.put("cccc".to_string(), 3);
        assert_eq!(t.get(&"bbbb".to_string()), Some(&2));
        assert_eq!(t.delete(&"aaaa".to_string()), Some(1));
        assert_eq!(t.get(&"cccc".to_string()), Some(&3));
    }

    #[test]
    fn test_content_hash_order_insensitive() {
        let mut a = Table::new(StrOps);
        let mut b = Table::new(StrOps);
        for i in 0..20 {
            a.put(key(i), i);
        }
        for i in (0..20).rev() {
            b.put(key(i), i);
        }
        let h = |kh: u64, _k: &String, v: &usize| kh ^ (*v as u64);
        assert_eq!(a.content_hash(h), b.content_hash(h));
    }

    #[test]
    fn test_equal_and_update() {
        let mut a = Table::new(StrOps);
        a.put(key(1), 1);
        a.put(key(2), 2);

        let mut b = a.copy();
        assert!(a.equal(&b, |x, y| x == y));

        b.put(key(2), 9);
        assert!(!a.equal(&b, |x, y| x == y));

        a.update(&b);
        assert_eq!(a.get(&key(2)), Some(&9));
    }

    #[test]
    fn test_iteration_stops_on_request() {
        let mut t = Table::new(StrOps);
        for i in 0..8 {
            t.put(key(i), i);
        }
        let mut seen = 0;
        let stopped = t.for_each_until(|_, _| {
            seen += 1;
            seen == 3
        });
        assert!(stopped);
        assert_eq!(seen, 3);
    }
}
