//! Verdict VM: a register machine for compiled policy plans
//!
//! A plan, the lowered form of a rule-based policy program, is decoded once
//! and shared read-only; each evaluation binds an input and data document
//! into a pooled register file and runs the plan's entrypoint, accumulating
//! result bindings into a set.
//!
//! # Modules
//!
//! - `plan`: wire-format reader and builder for compiled plans
//! - `eval`: the block/statement interpreter with break-index control flow
//! - `builtins`: native fast-path builtins and the host registry
//! - `cache`: inter-query and nondeterministic-builtin caches
//! - `config`: VM configuration with unknown-key warnings
//! - `vm`: the `Vm` entry point, eval cache, and result extraction
//!
//! Evaluation is single-threaded; the plan, the builtin registry, and the
//! inter-query cache are safe to share across concurrent evaluations.

pub mod builtins;
mod bytes;
pub mod cache;
pub mod config;
pub mod error;
mod eval;
pub mod plan;
mod state;
pub mod vm;

pub use builtins::{BuiltinContext, BuiltinDecl, HostBuiltin, HostFunc};
pub use cache::{InterQueryCache, MemoryInterQueryCache, NdbCache};
pub use config::{Config, ConfigError, EvalCacheConfig};
pub use error::{BuiltinError, BuiltinFailure, EvalError};
pub use plan::builder::{BlockBuilder, PlanBuilder};
pub use plan::{FuncRef, Local, Operand, Plan, PlanError, StmtTag, DATA_LOCAL, INPUT_LOCAL};
pub use state::{CancelToken, EvalStats};
pub use vm::{EvalOpts, Evaluation, Vm};
