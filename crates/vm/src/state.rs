//! Evaluation state
//!
//! A [`State`] is one call frame: a vector of value registers (locals), a
//! parallel bitset marking which locals are rooted in the data document, and
//! a return register. Frames are pooled per evaluation: dropping a `State`
//! hands its storage back for the next call.
//!
//! [`Globals`] is everything shared across the whole call tree of one
//! evaluation: the cancellation token, clock and RNG, caches, hooks, the
//! result set, counters, and the memoization stack (`with` pushes a frame,
//! so overrides never observe results computed outside them).

use crate::builtins::HostBuiltin;
use crate::cache::{InterQueryCache, NdbCache};
use crate::error::{BuiltinFailure, EvalError};
use crate::plan::{Local, Operand, Plan};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use verdict_core::{hash_value, KeyOps, Set, Table, Value};

/// Signals a running evaluation to stop at its next checkpoint.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter snapshot returned beside every evaluation result.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct EvalStats {
    /// Statements charged against the instruction budget.
    pub instructions: u64,
    /// Memoized function-call hits.
    pub virtual_cache_hits: u64,
    /// Function calls that ran their blocks.
    pub virtual_cache_misses: u64,
    /// Whole-query eval-cache hits.
    pub eval_cache_hits: u64,
    /// Whole-query eval-cache misses.
    pub eval_cache_misses: u64,
    /// Nondeterministic-builtin cache hits.
    pub nd_cache_hits: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub instructions: Cell<u64>,
    pub virtual_cache_hits: Cell<u64>,
    pub virtual_cache_misses: Cell<u64>,
    pub eval_cache_hits: Cell<u64>,
    pub eval_cache_misses: Cell<u64>,
    pub nd_cache_hits: Cell<u64>,
}

impl Counters {
    pub fn snapshot(&self) -> EvalStats {
        EvalStats {
            instructions: self.instructions.get(),
            virtual_cache_hits: self.virtual_cache_hits.get(),
            virtual_cache_misses: self.virtual_cache_misses.get(),
            eval_cache_hits: self.eval_cache_hits.get(),
            eval_cache_misses: self.eval_cache_misses.get(),
            nd_cache_hits: self.nd_cache_hits.get(),
        }
    }
}

/// Memoization key: function index plus scalar-argument fingerprint.
type MemoKey = (u32, u64);

#[derive(Clone, Copy, Debug, Default)]
struct MemoKeyOps;

impl KeyOps<MemoKey> for MemoKeyOps {
    fn hash(&self, key: &MemoKey) -> u64 {
        // The fingerprint is already a digest; fold the function index in.
        key.1 ^ (u64::from(key.0)).wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }
    fn eq(&self, a: &MemoKey, b: &MemoKey) -> bool {
        a == b
    }
}

type MemoFrame = Table<MemoKey, Option<Value>, MemoKeyOps>;

/// Shared context for one evaluation's whole call tree.
pub(crate) struct Globals {
    pub cancel: CancelToken,
    pub time: SystemTime,
    pub rng: RefCell<StdRng>,
    pub instruction_limit: u64,
    pub counters: Counters,
    pub result_set: RefCell<Set>,
    pub builtin_errors: RefCell<Vec<BuiltinFailure>>,
    pub builtins: HashMap<String, HostBuiltin>,
    pub interquery: Option<Arc<dyn InterQueryCache>>,
    pub ndb: Option<Arc<NdbCache>>,
    pub print_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub capabilities: Option<serde_json::Value>,
    memo: RefCell<Vec<MemoFrame>>,
    pool: RefCell<Vec<Frame>>,
}

pub(crate) struct GlobalsConfig {
    pub cancel: CancelToken,
    pub time: SystemTime,
    pub seed: u64,
    pub instruction_limit: u64,
    pub builtins: HashMap<String, HostBuiltin>,
    pub interquery: Option<Arc<dyn InterQueryCache>>,
    pub ndb: Option<Arc<NdbCache>>,
    pub print_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub capabilities: Option<serde_json::Value>,
}

impl Globals {
    pub fn new(cfg: GlobalsConfig) -> Rc<Globals> {
        Rc::new(Globals {
            cancel: cfg.cancel,
            time: cfg.time,
            rng: RefCell::new(StdRng::seed_from_u64(cfg.seed)),
            instruction_limit: cfg.instruction_limit,
            counters: Counters::default(),
            result_set: RefCell::new(Set::new()),
            builtin_errors: RefCell::new(Vec::new()),
            builtins: cfg.builtins,
            interquery: cfg.interquery,
            ndb: cfg.ndb,
            print_hook: cfg.print_hook,
            capabilities: cfg.capabilities,
            memo: RefCell::new(vec![MemoFrame::new(MemoKeyOps)]),
            pool: RefCell::new(Vec::new()),
        })
    }

    /// Push a fresh memoization frame (entering a `with` override).
    pub fn memoize_push(&self) {
        self.memo.borrow_mut().push(MemoFrame::new(MemoKeyOps));
    }

    pub fn memoize_pop(&self) {
        let mut memo = self.memo.borrow_mut();
        // The root frame stays.
        if memo.len() > 1 {
            memo.pop();
        }
    }

    /// Walk the memo stack top-down. `Some(None)` is a cached undefined.
    pub fn memoize_get(&self, func: u32, fingerprint: u64) -> Option<Option<Value>> {
        let memo = self.memo.borrow();
        for frame in memo.iter().rev() {
            if let Some(v) = frame.get(&(func, fingerprint)) {
                return Some(v.clone());
            }
        }
        None
    }

    pub fn memoize_insert(&self, func: u32, fingerprint: u64, value: Option<Value>) {
        let mut memo = self.memo.borrow_mut();
        if let Some(frame) = memo.last_mut() {
            frame.put((func, fingerprint), value);
        }
    }

    pub fn add_result(&self, v: Value) {
        self.result_set.borrow_mut().add(v);
    }

    pub fn record_builtin_error(&self, failure: BuiltinFailure) {
        tracing::debug!(builtin = %failure.builtin, message = %failure.message, "builtin error");
        self.builtin_errors.borrow_mut().push(failure);
    }

    /// Charge `n` statements; errs when the budget is gone or cancellation
    /// fired. This is the single cancellation checkpoint.
    pub fn instr(&self, n: u64) -> Result<(), EvalError> {
        let total = self.counters.instructions.get().saturating_add(n);
        self.counters.instructions.set(total);
        if self.instruction_limit != 0 && total > self.instruction_limit {
            return Err(EvalError::InstructionLimitExceeded);
        }
        if self.cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        Ok(())
    }
}

/// One frame's storage, recycled through the per-evaluation pool.
#[derive(Default)]
struct Frame {
    locals: Vec<Option<Value>>,
    data_bits: Vec<u64>,
    ret: Option<Local>,
}

impl Frame {
    fn reset(&mut self, num_locals: usize) {
        self.locals.clear();
        self.locals.resize(num_locals, None);
        self.data_bits.clear();
        self.data_bits.resize(num_locals.div_ceil(64), 0);
        self.ret = None;
    }
}

/// A call frame bound to its evaluation's globals.
pub(crate) struct State {
    frame: Frame,
    globals: Rc<Globals>,
}

impl State {
    /// Borrow a frame from the pool, sized for `num_locals` registers.
    pub fn new(globals: Rc<Globals>, num_locals: usize) -> State {
        let mut frame = globals.pool.borrow_mut().pop().unwrap_or_default();
        frame.reset(num_locals);
        State { frame, globals }
    }

    /// Borrow a child frame sharing this state's globals.
    pub fn child(&self, num_locals: usize) -> State {
        State::new(Rc::clone(&self.globals), num_locals)
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn local(&self, l: Local) -> Option<&Value> {
        self.frame.locals.get(l as usize).and_then(|v| v.as_ref())
    }

    pub fn local_mut(&mut self, l: Local) -> Option<&mut Value> {
        self.frame
            .locals
            .get_mut(l as usize)
            .and_then(|v| v.as_mut())
    }

    pub fn set_value(&mut self, l: Local, v: Value) {
        let frame = &mut self.frame;
        if frame.locals.len() <= l as usize {
            frame.locals.resize(l as usize + 1, None);
            frame.data_bits.resize((l as usize + 1).div_ceil(64), 0);
        }
        frame.locals[l as usize] = Some(v);
        clear_bit(&mut frame.data_bits, l);
    }

    pub fn set_optional(&mut self, l: Local, v: Option<Value>) {
        match v {
            Some(v) => self.set_value(l, v),
            None => self.unset(l),
        }
    }

    /// Aliasing move: copy another local's value and data-rootedness.
    pub fn set_local(&mut self, target: Local, source: Local) {
        let v = self.local(source).cloned();
        let rooted = self.is_data_rooted(source);
        self.set_optional(target, v);
        if rooted {
            self.mark_data_rooted(target);
        }
    }

    pub fn unset(&mut self, l: Local) {
        let frame = &mut self.frame;
        if let Some(slot) = frame.locals.get_mut(l as usize) {
            *slot = None;
        }
        clear_bit(&mut frame.data_bits, l);
    }

    /// Resolve an operand to a value: a register read or an inline constant.
    pub fn resolve(&self, op: Operand, plan: &Plan) -> Result<Option<Value>, EvalError> {
        Ok(match op {
            Operand::Local(l) => self.local(l).cloned(),
            Operand::Bool(b) => Some(Value::Bool(b)),
            Operand::StringIndex(i) => Some(Value::String(Arc::clone(plan.string(i)?))),
            Operand::Int(n) => Some(Value::int(n)),
        })
    }

    pub fn mark_data_rooted(&mut self, l: Local) {
        let frame = &mut self.frame;
        if frame.data_bits.len() <= (l / 64) as usize {
            frame.data_bits.resize((l / 64) as usize + 1, 0);
        }
        frame.data_bits[(l / 64) as usize] |= 1 << (l % 64);
    }

    pub fn is_data_rooted(&self, l: Local) -> bool {
        self.frame
            .data_bits
            .get((l / 64) as usize)
            .is_some_and(|w| w & (1 << (l % 64)) != 0)
    }

    pub fn set_return(&mut self, l: Local) {
        self.frame.ret = Some(l);
    }

    /// The dynamically set return register, if a `returnLocal` ran.
    pub fn return_register(&self) -> Option<Local> {
        self.frame.ret
    }
}

impl Drop for State {
    fn drop(&mut self) {
        let mut frame = std::mem::take(&mut self.frame);
        frame.locals.clear();
        frame.data_bits.clear();
        frame.ret = None;
        self.globals.pool.borrow_mut().push(frame);
    }
}

fn clear_bit(bits: &mut [u64], l: Local) {
    if let Some(w) = bits.get_mut((l / 64) as usize) {
        *w &= !(1 << (l % 64));
    }
}

/// Fingerprint of a call's own arguments (past the input/data pair), defined
/// only when every argument is a defined scalar and the arity is small.
/// Compound arguments skip memoization entirely.
pub(crate) fn fingerprint(args: &[Option<Value>]) -> Option<u64> {
    if args.len() > 9 {
        return None;
    }
    let mut fp = 0xcbf2_9ce4_8422_2325u64;
    for arg in args {
        let v = arg.as_ref()?;
        if !v.is_scalar() {
            return None;
        }
        fp = fp.rotate_left(13) ^ hash_value(v);
    }
    Some(fp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals() -> Rc<Globals> {
        Globals::new(GlobalsConfig {
            cancel: CancelToken::new(),
            time: SystemTime::UNIX_EPOCH,
            seed: 0,
            instruction_limit: 0,
            builtins: HashMap::new(),
            interquery: None,
            ndb: None,
            print_hook: None,
            capabilities: None,
        })
    }

    #[test]
    fn test_locals_set_get_unset() {
        let mut st = State::new(globals(), 4);
        assert!(st.local(2).is_none());
        st.set_value(2, Value::int(5));
        assert_eq!(st.local(2), Some(&Value::int(5)));
        st.unset(2);
        assert!(st.local(2).is_none());
    }

    #[test]
    fn test_data_bits_follow_aliasing() {
        let mut st = State::new(globals(), 4);
        st.set_value(1, Value::Null);
        st.mark_data_rooted(1);
        st.set_local(3, 1);
        assert!(st.is_data_rooted(3));
        // A plain write clears the bit.
        st.set_value(3, Value::int(1));
        assert!(!st.is_data_rooted(3));
    }

    #[test]
    fn test_pool_reuses_frames() {
        let g = globals();
        {
            let mut st = State::new(Rc::clone(&g), 8);
            st.set_value(7, Value::int(1));
        }
        // The released frame comes back cleared.
        let st = State::new(Rc::clone(&g), 8);
        assert!(st.local(7).is_none());
    }

    #[test]
    fn test_memoize_frames_shadow() {
        let g = globals();
        g.memoize_insert(1, 42, Some(Value::int(1)));
        g.memoize_push();
        assert_eq!(g.memoize_get(1, 42), Some(Some(Value::int(1))));
        g.memoize_insert(1, 42, Some(Value::int(2)));
        assert_eq!(g.memoize_get(1, 42), Some(Some(Value::int(2))));
        g.memoize_pop();
        assert_eq!(g.memoize_get(1, 42), Some(Some(Value::int(1))));
    }

    #[test]
    fn test_memoized_undefined_distinct_from_absent() {
        let g = globals();
        assert_eq!(g.memoize_get(9, 7), None);
        g.memoize_insert(9, 7, None);
        assert_eq!(g.memoize_get(9, 7), Some(None));
    }

    #[test]
    fn test_instruction_limit() {
        let g = Globals::new(GlobalsConfig {
            instruction_limit: 10,
            cancel: CancelToken::new(),
            time: SystemTime::UNIX_EPOCH,
            seed: 0,
            builtins: HashMap::new(),
            interquery: None,
            ndb: None,
            print_hook: None,
            capabilities: None,
        });
        assert!(g.instr(10).is_ok());
        assert!(matches!(
            g.instr(1),
            Err(EvalError::InstructionLimitExceeded)
        ));
    }

    #[test]
    fn test_cancellation() {
        let g = globals();
        assert!(g.instr(1).is_ok());
        g.cancel.cancel();
        assert!(matches!(g.instr(1), Err(EvalError::Cancelled)));
    }

    #[test]
    fn test_fingerprint_rules() {
        let scalars = vec![Some(Value::int(1)), Some(Value::string("x"))];
        assert!(fingerprint(&scalars).is_some());

        // Order matters.
        let swapped = vec![Some(Value::string("x")), Some(Value::int(1))];
        assert_ne!(fingerprint(&scalars), fingerprint(&swapped));

        // Undefined and compound arguments are not fingerprintable.
        assert!(fingerprint(&[None]).is_none());
        let compound = vec![Some(Value::Array(vec![].into()))];
        assert!(fingerprint(&compound).is_none());

        // Arity cap.
        let many: Vec<_> = (0..10).map(|i| Some(Value::int(i))).collect();
        assert!(fingerprint(&many).is_none());
    }
}
