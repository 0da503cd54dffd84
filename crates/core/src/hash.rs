//! Content hashing for values
//!
//! Every value hashes to a 64-bit digest derived from its content, never its
//! representation. Two rules make the digests usable as map keys across
//! representations:
//!
//! - Each value domain mixes a single type tag byte into its digest, so
//!   `0`, `"0"`, and `false` all hash differently.
//! - Objects and sets fold their entries through a *commutative* accumulator
//!   (a wrapping sum of per-entry digests), so insertion order is irrelevant
//!   and the compact and bucketed object representations agree.
//!
//! The underlying byte hasher is `ahash` with fixed seeds: digests are stable
//! within a process, which is all the in-memory caches require.

use crate::value::Value;
use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// Type tag bytes mixed into every digest.
pub(crate) const TAG_NULL: u8 = 0x01;
pub(crate) const TAG_BOOL: u8 = 0x02;
pub(crate) const TAG_NUMBER: u8 = 0x03;
pub(crate) const TAG_STRING: u8 = 0x04;
pub(crate) const TAG_ARRAY: u8 = 0x05;
pub(crate) const TAG_OBJECT: u8 = 0x06;
pub(crate) const TAG_SET: u8 = 0x07;

/// Tag for a single object entry, shared by every object representation.
const TAG_OBJECT_ENTRY: u8 = 0x16;
/// Tag for a single set element.
const TAG_SET_ENTRY: u8 = 0x17;

// Seeds are arbitrary but fixed: digests must not vary between evaluations
// within one process.
const SEED: (u64, u64, u64, u64) = (
    0x8c84_1c9d_5f1a_7b31,
    0x23a0_9fe6_70cd_4d12,
    0xd6e8_fe5b_8b01_44c7,
    0x4cf5_ad43_2745_937f,
);

fn hasher() -> impl Hasher {
    RandomState::with_seeds(SEED.0, SEED.1, SEED.2, SEED.3).build_hasher()
}

/// Hash an arbitrary byte string under a leading type tag.
fn tagged_bytes(tag: u8, bytes: &[u8]) -> u64 {
    let mut h = hasher();
    h.write_u8(tag);
    h.write(bytes);
    h.finish()
}

/// Content hash of a value.
pub fn hash_value(v: &Value) -> u64 {
    match v {
        Value::Null => tagged_bytes(TAG_NULL, &[]),
        Value::Bool(b) => tagged_bytes(TAG_BOOL, &[u8::from(*b)]),
        // The canonical form of a number is its IEEE-754 double bit pattern,
        // big-endian, so `1` and `1.0` share a digest.
        Value::Number(n) => tagged_bytes(TAG_NUMBER, &n.as_f64().to_bits().to_be_bytes()),
        Value::String(s) => tagged_bytes(TAG_STRING, s.as_bytes()),
        Value::Array(a) => {
            // Order-sensitive fold of element digests.
            let mut h = hasher();
            h.write_u8(TAG_ARRAY);
            for elem in a.iter() {
                h.write_u64(hash_value(elem));
            }
            h.finish()
        }
        Value::Object(o) => {
            let mut accum = 0u64;
            o.for_each_until(|k, val| {
                accum = object_hash_entry(accum, hash_value(k), hash_value(val));
                false
            });
            tagged_bytes(TAG_OBJECT, &accum.to_be_bytes())
        }
        Value::Set(s) => {
            let mut accum = 0u64;
            s.for_each_until(|elem| {
                accum = set_hash_entry(accum, hash_value(elem));
                false
            });
            tagged_bytes(TAG_SET, &accum.to_be_bytes())
        }
    }
}

/// Fold one object entry into the commutative accumulator.
///
/// Every object representation must use this exact operator so that a compact
/// object and its bucketed promotion hash identically. The addition is the
/// commutative step: summing per-entry digests erases iteration order.
pub fn object_hash_entry(accum: u64, key_hash: u64, value_hash: u64) -> u64 {
    let mut h = hasher();
    h.write_u8(TAG_OBJECT_ENTRY);
    h.write_u64(key_hash);
    h.write_u64(value_hash);
    accum.wrapping_add(h.finish())
}

/// Fold one set element into the commutative accumulator.
pub fn set_hash_entry(accum: u64, elem_hash: u64) -> u64 {
    let mut h = hasher();
    h.write_u8(TAG_SET_ENTRY);
    h.write_u64(elem_hash);
    accum.wrapping_add(h.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;
    use crate::object::Object;
    use crate::set::Set;

    #[test]
    fn test_type_tags_distinguish_domains() {
        let zero = Value::Number(Number::Int(0));
        let zero_str = Value::string("0");
        let falsy = Value::Bool(false);
        assert_ne!(hash_value(&zero), hash_value(&zero_str));
        assert_ne!(hash_value(&zero), hash_value(&falsy));
        assert_ne!(hash_value(&zero_str), hash_value(&falsy));
    }

    #[test]
    fn test_int_float_same_digest() {
        let i = Value::Number(Number::Int(1));
        let f = Value::Number(Number::Float(1.0));
        assert_eq!(hash_value(&i), hash_value(&f));
    }

    #[test]
    fn test_array_order_sensitive() {
        let a = Value::Array(vec![Value::Bool(true), Value::Null].into());
        let b = Value::Array(vec![Value::Null, Value::Bool(true)].into());
        assert_ne!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_object_insertion_order_insensitive() {
        let mut a = Object::new();
        a.insert(Value::string("x"), Value::Number(Number::Int(1)));
        a.insert(Value::string("y"), Value::Number(Number::Int(2)));

        let mut b = Object::new();
        b.insert(Value::string("y"), Value::Number(Number::Int(2)));
        b.insert(Value::string("x"), Value::Number(Number::Int(1)));

        assert_eq!(hash_value(&Value::Object(a)), hash_value(&Value::Object(b)));
    }

    #[test]
    fn test_set_insertion_order_insensitive() {
        let mut a = Set::new();
        a.add(Value::string("p"));
        a.add(Value::string("q"));
        a.add(Value::string("r"));

        let mut b = Set::new();
        b.add(Value::string("r"));
        b.add(Value::string("q"));
        b.add(Value::string("p"));

        assert_eq!(hash_value(&Value::Set(a)), hash_value(&Value::Set(b)));
    }

    #[test]
    fn test_empty_object_differs_from_empty_set() {
        assert_ne!(
            hash_value(&Value::Object(Object::new())),
            hash_value(&Value::Set(Set::new()))
        );
    }
}
