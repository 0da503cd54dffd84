//! Verdict Core: the value layer of the verdict policy VM
//!
//! This crate provides the document model the VM evaluates over, independent
//! of any plan format or evaluator:
//!
//! - `value`: the Value enum (Null, Bool, Number, String, Array, Object, Set)
//! - `number`: exact-int / double split with a canonical double hash form
//! - `hash`: 64-bit content hashing with the commutative object/set protocol
//! - `object` / `set`: copy-on-write handles over the two-tier table
//! - `table`: generic hash table with pluggable key hashing and equality
//!
//! Key design principles:
//! - Equality is structural; equal values always produce equal hashes.
//! - Object and set hashes are insertion-order independent, which is the one
//!   invariant that lets the compact and bucketed representations interoperate.

pub mod hash;
pub mod number;
pub mod object;
pub mod set;
pub mod table;
pub mod value;

pub use hash::{hash_value, object_hash_entry, set_hash_entry};
pub use number::Number;
pub use object::{Object, ValueKeyOps};
pub use set::Set;
pub use table::{KeyOps, Table};
pub use value::{Array, Value};
