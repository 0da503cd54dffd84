//! Builtin dispatch
//!
//! A builtin call resolves in two steps. The fast path covers the builtins
//! implemented directly over [`Value`]s in [`native`], with no conversion and no
//! registry lookup. Everything else falls back to the host-provided registry,
//! whose implementations work on `serde_json::Value` (the external AST type)
//! and receive a [`BuiltinContext`] packaging the query-scoped clock, RNG,
//! caches, hooks, and capabilities.
//!
//! Builtins declared nondeterministic are cached per query by name and
//! argument values; relational builtins accumulate their yields into an
//! array result. Non-halt errors are recorded and the call yields undefined.

pub(crate) mod native;

use crate::cache::InterQueryCache;
use crate::error::{BuiltinError, BuiltinFailure, EvalError};
use crate::state::Globals;
use rand::rngs::StdRng;
use rand::RngCore;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::SystemTime;
use verdict_core::{Array, Value};

/// Metadata the dispatcher needs about a host builtin.
#[derive(Clone, Debug)]
pub struct BuiltinDecl {
    pub name: String,
    /// Results may depend on external state; cache per query when an ND
    /// cache is configured.
    pub nondeterministic: bool,
    /// Yields zero or more results, accumulated into an array.
    pub relational: bool,
}

impl BuiltinDecl {
    pub fn new(name: impl Into<String>) -> BuiltinDecl {
        BuiltinDecl {
            name: name.into(),
            nondeterministic: false,
            relational: false,
        }
    }

    pub fn nondeterministic(mut self) -> BuiltinDecl {
        self.nondeterministic = true;
        self
    }

    pub fn relational(mut self) -> BuiltinDecl {
        self.relational = true;
        self
    }
}

/// A functional builtin returns at most one value; a relational builtin
/// yields through the sink it is handed.
#[derive(Clone)]
pub enum HostFunc {
    Function(
        Arc<
            dyn Fn(
                    &mut BuiltinContext<'_>,
                    &[serde_json::Value],
                ) -> Result<Option<serde_json::Value>, BuiltinError>
                + Send
                + Sync,
        >,
    ),
    Relational(
        Arc<
            dyn Fn(
                    &mut BuiltinContext<'_>,
                    &[serde_json::Value],
                    &mut dyn FnMut(serde_json::Value),
                ) -> Result<(), BuiltinError>
                + Send
                + Sync,
        >,
    ),
}

/// A host-registered builtin implementation.
#[derive(Clone)]
pub struct HostBuiltin {
    pub decl: BuiltinDecl,
    pub func: HostFunc,
}

impl HostBuiltin {
    /// Convenience constructor for a plain functional builtin.
    pub fn function<F>(name: impl Into<String>, f: F) -> HostBuiltin
    where
        F: Fn(
                &mut BuiltinContext<'_>,
                &[serde_json::Value],
            ) -> Result<Option<serde_json::Value>, BuiltinError>
            + Send
            + Sync
            + 'static,
    {
        HostBuiltin {
            decl: BuiltinDecl::new(name),
            func: HostFunc::Function(Arc::new(f)),
        }
    }
}

/// Query-scoped services handed to fallback builtin implementations.
pub struct BuiltinContext<'a> {
    time: SystemTime,
    rng: &'a RefCell<StdRng>,
    interquery: Option<&'a dyn InterQueryCache>,
    print_hook: Option<&'a (dyn Fn(&str) + Send + Sync)>,
    capabilities: Option<&'a serde_json::Value>,
}

impl<'a> BuiltinContext<'a> {
    pub(crate) fn new(g: &'a Globals) -> BuiltinContext<'a> {
        BuiltinContext {
            time: g.time,
            rng: &g.rng,
            interquery: g.interquery.as_deref(),
            print_hook: g.print_hook.as_deref(),
            capabilities: g.capabilities.as_ref(),
        }
    }

    /// The evaluation's wall-clock time. Stable for the whole query.
    pub fn now(&self) -> SystemTime {
        self.time
    }

    /// Next value from the seeded per-query RNG.
    pub fn rand_u64(&mut self) -> u64 {
        self.rng.borrow_mut().next_u64()
    }

    /// Cache shared across queries, when the host configured one.
    pub fn inter_query_cache(&self) -> Option<&dyn InterQueryCache> {
        self.interquery
    }

    pub fn print(&self, msg: &str) {
        match self.print_hook {
            Some(hook) => hook(msg),
            None => tracing::debug!(target: "verdict::print", "{msg}"),
        }
    }

    pub fn capabilities(&self) -> Option<&serde_json::Value> {
        self.capabilities
    }
}

/// Execute a builtin call. `Ok(None)` means the call yields undefined; the
/// enclosing block stops without an error.
pub(crate) fn execute(
    g: &Globals,
    name: &str,
    args: &[Option<Value>],
) -> Result<Option<Value>, EvalError> {
    match native::dispatch(g, name, args) {
        Some(Ok(v)) => return Ok(v),
        Some(Err(e)) => return absorb(g, name, e),
        None => {}
    }

    let Some(hb) = g.builtins.get(name) else {
        g.record_builtin_error(BuiltinFailure {
            builtin: name.to_string(),
            message: "unknown builtin".to_string(),
        });
        return Ok(None);
    };

    // Fallback builtins see the external AST type; an undefined argument
    // silently yields undefined.
    let mut json_args = Vec::with_capacity(args.len());
    for a in args {
        match a {
            Some(v) => json_args.push(v.to_json()),
            None => return Ok(None),
        }
    }

    let nd_key = match (&g.ndb, hb.decl.nondeterministic) {
        (Some(_), true) => {
            let mut parts = Vec::with_capacity(args.len() + 1);
            parts.push(Value::string(name));
            parts.extend(args.iter().flatten().cloned());
            Some(Value::Array(parts.into()))
        }
        _ => None,
    };
    if let (Some(key), Some(ndb)) = (&nd_key, &g.ndb) {
        if let Some(cached) = ndb.get(key) {
            let hits = &g.counters.nd_cache_hits;
            hits.set(hits.get() + 1);
            return Ok(Some(cached));
        }
    }

    let mut ctx = BuiltinContext::new(g);
    let outcome = match &hb.func {
        HostFunc::Function(f) => {
            f(&mut ctx, &json_args).map(|out| out.map(|j| Value::from_json(&j)))
        }
        HostFunc::Relational(f) => {
            let mut results = Array::new();
            f(&mut ctx, &json_args, &mut |j| {
                results.push(Value::from_json(&j));
            })
            .map(|()| Some(Value::Array(results)))
        }
    };

    match outcome {
        Ok(v) => {
            if let (Some(key), Some(ndb), Some(val)) = (nd_key, &g.ndb, &v) {
                ndb.insert(key, val.clone());
            }
            Ok(v)
        }
        Err(e) => absorb(g, name, e),
    }
}

fn absorb(g: &Globals, name: &str, e: BuiltinError) -> Result<Option<Value>, EvalError> {
    match e {
        BuiltinError::Halt(m) => Err(EvalError::Halt(m)),
        BuiltinError::Message(m) => {
            g.record_builtin_error(BuiltinFailure {
                builtin: name.to_string(),
                message: m,
            });
            Ok(None)
        }
    }
}
