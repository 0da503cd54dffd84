//! The VM entry point
//!
//! A [`Vm`] binds a decoded plan, a base data document, parsed configuration,
//! and the host's builtin registry; it is cheap to share and each
//! [`Vm::eval`] call is independent. When the eval cache is enabled and an
//! inter-query cache handle is supplied, whole-query results are keyed by the
//! configured input subtrees and reused until their TTL lapses.

use crate::builtins::HostBuiltin;
use crate::cache::{InterQueryCache, MemoryInterQueryCache, NdbCache};
use crate::config::Config;
use crate::error::{BuiltinFailure, EvalError};
use crate::eval::Evaluator;
use crate::plan::{Plan, DATA_LOCAL, INPUT_LOCAL};
use crate::state::{CancelToken, EvalStats, Globals, GlobalsConfig, State};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;
use verdict_core::{hash_value, Array, Object, Value};

/// Per-call options.
#[derive(Default)]
pub struct EvalOpts {
    /// The input document, or none to leave the input local undefined.
    pub input: Option<serde_json::Value>,
    /// Entrypoint name; defaults to the plan's first.
    pub entrypoint: Option<String>,
    /// Wall-clock time for this evaluation. Defaults to now.
    pub time: Option<SystemTime>,
    /// Seed for the per-query RNG handed to builtins.
    pub seed: Option<u64>,
    pub inter_query_cache: Option<Arc<dyn InterQueryCache>>,
    pub nd_cache: Option<Arc<NdbCache>>,
    pub print_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Statement budget; zero is unlimited.
    pub instruction_limit: u64,
    pub cancel: Option<CancelToken>,
    /// Per-call builtin overrides, shadowing the VM registry by name.
    pub builtins: HashMap<String, HostBuiltin>,
}

/// A finished evaluation: the rendered result set, any non-fatal builtin
/// errors, and the counter snapshot.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub result: Value,
    pub errors: Vec<BuiltinFailure>,
    pub stats: EvalStats,
}

pub struct Vm {
    plan: Arc<Plan>,
    data: Value,
    config: Config,
    builtins: HashMap<String, HostBuiltin>,
    /// Default inter-query cache, provisioned from the configured byte
    /// budget and shared by every eval that does not bring its own handle.
    default_interquery: Option<Arc<MemoryInterQueryCache>>,
}

impl Vm {
    pub fn new(plan: Arc<Plan>, data: Value, config: Config) -> Vm {
        let default_interquery = (config.interquery_cache_max_bytes > 0)
            .then(|| Arc::new(MemoryInterQueryCache::new(config.interquery_cache_max_bytes)));
        Vm {
            plan,
            data,
            config,
            builtins: HashMap::new(),
            default_interquery,
        }
    }

    /// Register a host builtin, replacing any previous one of the same name.
    pub fn register_builtin(&mut self, b: HostBuiltin) {
        self.builtins.insert(b.decl.name.clone(), b);
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn eval(&self, opts: EvalOpts) -> Result<Evaluation, EvalError> {
        let time = opts.time.unwrap_or_else(SystemTime::now);
        let entry = self.plan.entrypoint(opts.entrypoint.as_deref())?;

        let ec = &self.config.eval_cache;
        let cache: Option<Arc<dyn InterQueryCache>> = opts
            .inter_query_cache
            .clone()
            .or_else(|| {
                self.default_interquery
                    .clone()
                    .map(|c| c as Arc<dyn InterQueryCache>)
            });
        let cache_key = match (&cache, ec.enabled) {
            (Some(_), true) => Some(eval_cache_key(
                entry.name,
                opts.input.as_ref(),
                &ec.input_paths,
            )),
            _ => None,
        };
        if let (Some(key), Some(c)) = (&cache_key, &cache) {
            if let Some(hit) = c.get(key, time) {
                tracing::debug!(entrypoint = entry.name, "eval cache hit");
                return Ok(Evaluation {
                    result: hit,
                    errors: Vec::new(),
                    stats: EvalStats {
                        eval_cache_hits: 1,
                        ..EvalStats::default()
                    },
                });
            }
        }

        let mut builtins = self.builtins.clone();
        builtins.extend(opts.builtins);

        let globals = Globals::new(GlobalsConfig {
            cancel: opts.cancel.unwrap_or_default(),
            time,
            seed: opts.seed.unwrap_or(0),
            instruction_limit: opts.instruction_limit,
            builtins,
            interquery: cache.clone(),
            ndb: opts.nd_cache.or_else(|| {
                (self.config.ndb_cache_max_bytes > 0)
                    .then(|| Arc::new(NdbCache::new(self.config.ndb_cache_max_bytes)))
            }),
            print_hook: opts.print_hook,
            capabilities: self.config.capabilities.clone(),
        });
        if cache_key.is_some() {
            globals.counters.eval_cache_misses.set(1);
        }

        tracing::debug!(entrypoint = entry.name, "evaluating");
        let mut st = State::new(Rc::clone(&globals), self.plan.max_local() as usize + 1);
        if let Some(input) = &opts.input {
            st.set_value(INPUT_LOCAL, Value::from_json(input));
        }
        st.set_value(DATA_LOCAL, self.data.clone());
        st.mark_data_rooted(DATA_LOCAL);

        Evaluator::new(&self.plan).eval_entry(&mut st, entry.blocks)?;
        drop(st);

        let result = {
            let rs = globals.result_set.borrow();
            let mut arr = Array::with_capacity(rs.len());
            for v in rs.iter() {
                let mut obj = Object::new();
                obj.insert(Value::string("result"), v.clone());
                arr.push(Value::Object(obj));
            }
            Value::Array(arr)
        };

        if let (Some(key), Some(c)) = (cache_key, cache) {
            c.insert(&key, result.clone(), Some(time + ec.ttl));
        }

        Ok(Evaluation {
            errors: globals.builtin_errors.borrow().clone(),
            stats: globals.counters.snapshot(),
            result,
        })
    }
}

/// Cache key over the configured input subtrees. Each selected pointer
/// contributes its path, whether it resolved, and the resolved subtree, so
/// "absent" and "null" key differently.
fn eval_cache_key(entry: &str, input: Option<&serde_json::Value>, paths: &[String]) -> String {
    let mut parts = Vec::with_capacity(paths.len());
    for p in paths {
        let sub = input.and_then(|i| i.pointer(p));
        parts.push(Value::Array(
            vec![
                Value::string(p.as_str()),
                Value::Bool(sub.is_some()),
                sub.map(Value::from_json).unwrap_or(Value::Null),
            ]
            .into(),
        ));
    }
    let digest = hash_value(&Value::Array(parts.into()));
    format!("evalcache:{entry}:{digest:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_distinguishes_absent_from_null() {
        let paths = vec!["/key".to_string()];
        let null_input = json!({"key": null});
        let empty_input = json!({});
        let a = eval_cache_key("main", Some(&null_input), &paths);
        let b = eval_cache_key("main", Some(&empty_input), &paths);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_ignores_unselected_subtrees() {
        let paths = vec!["/key".to_string()];
        let a = eval_cache_key("main", Some(&json!({"key": "a", "version": 1})), &paths);
        let b = eval_cache_key("main", Some(&json!({"key": "a", "version": 2})), &paths);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_key_varies_by_entrypoint() {
        let paths = vec!["/key".to_string()];
        let input = json!({"key": "a"});
        let a = eval_cache_key("main", Some(&input), &paths);
        let b = eval_cache_key("other", Some(&input), &paths);
        assert_ne!(a, b);
    }
}
