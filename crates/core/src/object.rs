//! Objects
//!
//! An object maps values to values, keys unique by value equality. The
//! concrete representation hides behind an `Arc` handle: small objects are a
//! compact inline array scanned linearly, larger ones promote to chained
//! buckets keyed by the 64-bit content digest. Promotion is invisible to
//! callers because both tiers hash through the same commutative entry
//! operator.
//!
//! Handles are copy-on-write: mutating a shared object forks the backing
//! table, so snapshots taken for `with` overrides stay intact.

use crate::hash::hash_value;
use crate::table::{Iter, KeyOps, Table};
use crate::value::Value;
use std::sync::Arc;

/// Hash/equality plugin for value-keyed tables.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueKeyOps;

impl KeyOps<Value> for ValueKeyOps {
    fn hash(&self, key: &Value) -> u64 {
        hash_value(key)
    }
    fn eq(&self, a: &Value, b: &Value) -> bool {
        a == b
    }
}

#[derive(Clone, Debug)]
pub struct Object {
    table: Arc<Table<Value, Value, ValueKeyOps>>,
}

impl Object {
    pub fn new() -> Self {
        Object {
            table: Arc::new(Table::new(ValueKeyOps)),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Object {
            table: Arc::new(Table::with_capacity(ValueKeyOps, cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.table.get_hashed(hash_value(key), key)
    }

    /// Insert or overwrite. Forks the backing table when the handle is
    /// shared.
    pub fn insert(&mut self, key: Value, value: Value) {
        let hash = hash_value(&key);
        Arc::make_mut(&mut self.table).put_hashed(hash, key, value);
    }

    /// Remove a key; no-op when absent.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        Arc::make_mut(&mut self.table).delete(key)
    }

    pub fn iter(&self) -> Iter<'_, Value, Value> {
        self.table.iter()
    }

    /// Visit entries until the callback asks to stop.
    pub fn for_each_until(&self, f: impl FnMut(&Value, &Value) -> bool) -> bool {
        self.table.for_each_until(f)
    }

    /// Recursive merge: entries of `other` win, except where both sides hold
    /// objects, which merge pointwise.
    pub fn merge(&self, other: &Object) -> Object {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            let merged = match (out.get(k), v) {
                (Some(Value::Object(a)), Value::Object(b)) => Value::Object(a.merge(b)),
                _ => v.clone(),
            };
            out.insert(k.clone(), merged);
        }
        out
    }

    pub(crate) fn table_equal(&self, other: &Object) -> bool {
        if Arc::ptr_eq(&self.table, &other.table) {
            return true;
        }
        self.table.equal(&other.table, |a, b| a == b)
    }

    /// Whether the object has promoted out of the compact representation.
    pub fn is_large(&self) -> bool {
        self.table.is_bucketed()
    }
}

impl Default for Object {
    fn default() -> Self {
        Object::new()
    }
}

impl FromIterator<(Value, Value)> for Object {
    fn from_iter<T: IntoIterator<Item = (Value, Value)>>(iter: T) -> Self {
        let mut obj = Object::new();
        for (k, v) in iter {
            obj.insert(k, v);
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;

    fn num(n: i64) -> Value {
        Value::Number(Number::Int(n))
    }

    #[test]
    fn test_insert_get_overwrite() {
        let mut obj = Object::new();
        obj.insert(Value::string("a"), num(1));
        obj.insert(Value::string("a"), num(2));
        assert_eq!(obj.len(), 1);
        assert_eq!(obj.get(&Value::string("a")), Some(&num(2)));
        assert_eq!(obj.get(&Value::string("b")), None);
    }

    #[test]
    fn test_promotion_preserves_hash_and_equality() {
        let mut compact = Object::new();
        for i in 0..16 {
            compact.insert(num(i), num(i * 10));
        }
        assert!(!compact.is_large());

        let mut promoted = compact.clone();
        promoted.insert(num(99), num(990));
        promoted.remove(&num(99));
        assert!(promoted.is_large());

        assert_eq!(Value::Object(compact.clone()), Value::Object(promoted.clone()));
        assert_eq!(
            hash_value(&Value::Object(compact)),
            hash_value(&Value::Object(promoted))
        );
    }

    #[test]
    fn test_copy_on_write() {
        let mut a = Object::new();
        a.insert(Value::string("k"), num(1));
        let snapshot = a.clone();
        a.insert(Value::string("k"), num(2));
        assert_eq!(snapshot.get(&Value::string("k")), Some(&num(1)));
        assert_eq!(a.get(&Value::string("k")), Some(&num(2)));
    }

    #[test]
    fn test_merge_recursive() {
        let mut inner_a = Object::new();
        inner_a.insert(Value::string("x"), num(1));
        let mut inner_b = Object::new();
        inner_b.insert(Value::string("y"), num(2));

        let mut a = Object::new();
        a.insert(Value::string("nested"), Value::Object(inner_a));
        a.insert(Value::string("keep"), num(7));
        let mut b = Object::new();
        b.insert(Value::string("nested"), Value::Object(inner_b));

        let merged = a.merge(&b);
        assert_eq!(merged.get(&Value::string("keep")), Some(&num(7)));
        let nested = match merged.get(&Value::string("nested")) {
            Some(Value::Object(o)) => o,
            other => panic!("expected object, got {other:?}"),
        };
        assert_eq!(nested.get(&Value::string("x")), Some(&num(1)));
        assert_eq!(nested.get(&Value::string("y")), Some(&num(2)));
    }

    #[test]
    fn test_non_string_keys() {
        let mut obj = Object::new();
        obj.insert(Value::Bool(true), Value::string("t"));
        obj.insert(num(0), Value::string("zero"));
        assert_eq!(obj.get(&Value::Bool(true)), Some(&Value::string("t")));
        // 0 and false are distinct keys.
        assert_eq!(obj.get(&num(0)), Some(&Value::string("zero")));
        assert_eq!(obj.get(&Value::Bool(false)), None);
    }
}
