//! The evaluator
//!
//! Executes statements linearly within a block, recursing through the block
//! structure. Non-local exits travel as a break index instead of unwinding:
//! every statement reports `Continue` or `Break(n)`, and each block boundary
//! consumes a zero index or decrements a positive one. `blockStmt` and
//! `with` forward whatever their inner blocks report; `scan` stops iterating
//! on an escaping break; `not` inverts its block's outcome.
//!
//! A statement that merely fails to produce a value (an undefined lookup, a
//! failed comparison, a mismatched type test) breaks with index zero. Errors
//! are reserved for the conflicts and halts of the error taxonomy.

use crate::builtins;
use crate::error::EvalError;
use crate::plan::{
    Block, BlockSeq, DecodedStmt, FuncRef, Local, Operand, OperandSeq, Plan, PlanError,
    DATA_LOCAL,
};
use crate::state::{fingerprint, State};
use std::sync::Arc;
use verdict_core::{Array, Number, Object, Set, Value};

/// Statement outcome: fall through, or terminate `n + 1` enclosing blocks.
pub(crate) enum Ctrl {
    Continue,
    Break(u32),
}

/// Block outcome, as seen by the construct that ran the block. A break with
/// index zero is consumed at the block boundary (`Broke`); a larger index
/// crosses the boundary decremented.
enum BlockResult {
    Completed,
    Broke,
    Break(u32),
}

pub(crate) struct Evaluator<'p> {
    plan: &'p Plan,
}

impl<'p> Evaluator<'p> {
    pub fn new(plan: &'p Plan) -> Evaluator<'p> {
        Evaluator { plan }
    }

    fn num_locals(&self) -> usize {
        self.plan.max_local() as usize + 1
    }

    /// Run an entrypoint's blocks. Escaping breaks end the entrypoint.
    pub fn eval_entry(&self, st: &mut State, blocks: BlockSeq<'p>) -> Result<(), EvalError> {
        self.eval_block_seq(st, blocks)?;
        Ok(())
    }

    fn eval_block_seq(&self, st: &mut State, blocks: BlockSeq<'p>) -> Result<Ctrl, EvalError> {
        for block in blocks.iter() {
            match self.eval_block(st, block?)? {
                BlockResult::Completed | BlockResult::Broke => {}
                BlockResult::Break(i) => return Ok(Ctrl::Break(i)),
            }
        }
        Ok(Ctrl::Continue)
    }

    fn eval_block(&self, st: &mut State, block: Block<'p>) -> Result<BlockResult, EvalError> {
        st.globals().instr(1)?;
        let mut executed = 0u32;
        for stmt in block.iter() {
            executed += 1;
            if executed % 32 == 0 {
                st.globals().instr(32)?;
            }
            match self.eval_stmt(st, stmt?.decode()?)? {
                Ctrl::Continue => {}
                Ctrl::Break(0) => return Ok(BlockResult::Broke),
                Ctrl::Break(i) => return Ok(BlockResult::Break(i - 1)),
            }
        }
        Ok(BlockResult::Completed)
    }

    fn eval_stmt(&self, st: &mut State, stmt: DecodedStmt<'p>) -> Result<Ctrl, EvalError> {
        match stmt {
            DecodedStmt::Nop => Ok(Ctrl::Continue),

            DecodedStmt::AssignInt { value, target } => {
                st.set_value(target, Value::int(value));
                Ok(Ctrl::Continue)
            }

            DecodedStmt::AssignVar { source, target } => {
                match source {
                    Operand::Local(src) => st.set_local(target, src),
                    other => {
                        let v = st.resolve(other, self.plan)?;
                        st.set_optional(target, v);
                    }
                }
                Ok(Ctrl::Continue)
            }

            DecodedStmt::AssignVarOnce { source, target } => {
                let Some(v) = st.resolve(source, self.plan)? else {
                    return Ok(Ctrl::Continue);
                };
                match st.local(target) {
                    Some(old) if *old != v => Err(EvalError::VarAssignConflict),
                    Some(_) => Ok(Ctrl::Continue),
                    None => {
                        st.set_value(target, v);
                        Ok(Ctrl::Continue)
                    }
                }
            }

            DecodedStmt::MakeNull { target } => {
                st.set_value(target, Value::Null);
                Ok(Ctrl::Continue)
            }

            DecodedStmt::MakeNumberInt { value, target } => {
                st.set_value(target, Value::int(value));
                Ok(Ctrl::Continue)
            }

            DecodedStmt::MakeNumberRef { index, target } => {
                let lit = self.plan.string(index)?;
                let n = Number::parse(lit)
                    .ok_or_else(|| PlanError::BadNumberLiteral(lit.to_string()))?;
                st.set_value(target, Value::Number(n));
                Ok(Ctrl::Continue)
            }

            DecodedStmt::MakeArray { capacity, target } => {
                st.set_value(target, Value::Array(Array::with_capacity(capacity as usize)));
                Ok(Ctrl::Continue)
            }

            DecodedStmt::MakeObject { target } => {
                st.set_value(target, Value::Object(Object::new()));
                Ok(Ctrl::Continue)
            }

            DecodedStmt::MakeSet { target } => {
                st.set_value(target, Value::Set(Set::new()));
                Ok(Ctrl::Continue)
            }

            DecodedStmt::ArrayAppend { value, array } => {
                let Some(v) = st.resolve(value, self.plan)? else {
                    return Ok(Ctrl::Break(0));
                };
                match st.local_mut(array) {
                    Some(Value::Array(a)) => {
                        a.push(v);
                        Ok(Ctrl::Continue)
                    }
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::SetAdd { value, set } => {
                let Some(v) = st.resolve(value, self.plan)? else {
                    return Ok(Ctrl::Break(0));
                };
                match st.local_mut(set) {
                    Some(Value::Set(s)) => {
                        s.add(v);
                        Ok(Ctrl::Continue)
                    }
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::ObjectInsert { key, value, object } => {
                let (Some(k), Some(v)) = (
                    st.resolve(key, self.plan)?,
                    st.resolve(value, self.plan)?,
                ) else {
                    return Ok(Ctrl::Break(0));
                };
                match st.local_mut(object) {
                    Some(Value::Object(obj)) => {
                        obj.insert(k, v);
                        Ok(Ctrl::Continue)
                    }
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::ObjectInsertOnce { key, value, object } => {
                let (Some(k), Some(v)) = (
                    st.resolve(key, self.plan)?,
                    st.resolve(value, self.plan)?,
                ) else {
                    return Ok(Ctrl::Break(0));
                };
                match st.local_mut(object) {
                    Some(Value::Object(obj)) => {
                        if obj.get(&k).is_some_and(|old| *old != v) {
                            return Err(EvalError::ObjectInsertConflict);
                        }
                        obj.insert(k, v);
                        Ok(Ctrl::Continue)
                    }
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::ObjectMerge { a, b, target } => {
                let (Some(Value::Object(left)), Some(Value::Object(right))) =
                    (st.local(a).cloned(), st.local(b).cloned())
                else {
                    return Err(EvalError::ObjectInsertConflict);
                };
                st.set_value(target, Value::Object(left.merge(&right)));
                Ok(Ctrl::Continue)
            }

            DecodedStmt::Len { source, target } => {
                let v = st.resolve(source, self.plan)?;
                match v.as_ref().and_then(Value::length) {
                    Some(n) => {
                        st.set_value(target, Value::int(n as i64));
                        Ok(Ctrl::Continue)
                    }
                    None => {
                        st.unset(target);
                        Ok(Ctrl::Break(0))
                    }
                }
            }

            DecodedStmt::Dot {
                source,
                key,
                target,
            } => self.eval_dot(st, source, key, target),

            DecodedStmt::Equal { a, b } => {
                let (va, vb) = (st.resolve(a, self.plan)?, st.resolve(b, self.plan)?);
                match (va, vb) {
                    (None, None) => Ok(Ctrl::Continue),
                    (Some(x), Some(y)) if x == y => Ok(Ctrl::Continue),
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::NotEqual { a, b } => {
                let (va, vb) = (st.resolve(a, self.plan)?, st.resolve(b, self.plan)?);
                match (va, vb) {
                    (None, None) => Ok(Ctrl::Continue),
                    (Some(x), Some(y)) if x != y => Ok(Ctrl::Continue),
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::IsArray { source } => {
                match st.resolve(source, self.plan)? {
                    Some(Value::Array(_)) => Ok(Ctrl::Continue),
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::IsObject { source } => {
                match st.resolve(source, self.plan)? {
                    Some(Value::Object(_)) => Ok(Ctrl::Continue),
                    _ => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::IsDefined { source } => {
                if st.local(source).is_some() {
                    Ok(Ctrl::Continue)
                } else {
                    Ok(Ctrl::Break(0))
                }
            }

            DecodedStmt::IsUndefined { source } => {
                if st.local(source).is_none() {
                    Ok(Ctrl::Continue)
                } else {
                    Ok(Ctrl::Break(0))
                }
            }

            DecodedStmt::BreakStmt { index } => Ok(Ctrl::Break(index)),

            DecodedStmt::BlockStmt { blocks } => self.eval_block_seq(st, blocks),

            DecodedStmt::Not { block } => match self.eval_block(st, block)? {
                // The body ran to completion: the negated goal held, so the
                // enclosing block fails.
                BlockResult::Completed => Ok(Ctrl::Break(0)),
                BlockResult::Broke => Ok(Ctrl::Continue),
                BlockResult::Break(i) => Ok(Ctrl::Break(i)),
            },

            DecodedStmt::Scan {
                source,
                key,
                value,
                block,
            } => self.eval_scan(st, source, key, value, block),

            DecodedStmt::With {
                target,
                path,
                value,
                block,
            } => {
                let Some(v) = st.resolve(value, self.plan)? else {
                    return Ok(Ctrl::Break(0));
                };
                let mut segs = Vec::with_capacity(path.len());
                for s in path.iter() {
                    segs.push(Arc::clone(self.plan.string(s?)?));
                }
                let snapshot = st.local(target).cloned();
                let was_rooted = st.is_data_rooted(target);
                let updated = upsert(snapshot.as_ref(), &segs, v);
                st.set_value(target, updated);
                if was_rooted {
                    st.mark_data_rooted(target);
                }
                st.globals().memoize_push();

                let outcome = self.eval_block(st, block);

                // Restore on every exit path, errors included.
                st.globals().memoize_pop();
                st.set_optional(target, snapshot);
                if was_rooted {
                    st.mark_data_rooted(target);
                }

                match outcome? {
                    BlockResult::Completed | BlockResult::Broke => Ok(Ctrl::Continue),
                    BlockResult::Break(i) => Ok(Ctrl::Break(i)),
                }
            }

            DecodedStmt::Call { func, args, result } => {
                let argv = self.resolve_args(st, args)?;
                let out = match func {
                    FuncRef::Plan(idx) => self.call_func(st, idx, &argv)?,
                    FuncRef::Builtin(sidx) => {
                        let name = Arc::clone(self.plan.string(sidx)?);
                        builtins::execute(st.globals(), &name, &argv)?
                    }
                };
                match out {
                    Some(v) => {
                        st.set_value(result, v);
                        Ok(Ctrl::Continue)
                    }
                    None => Ok(Ctrl::Break(0)),
                }
            }

            DecodedStmt::CallDynamic { args, path, result } => {
                self.eval_call_dynamic(st, args, path, result)
            }

            DecodedStmt::ResultSetAdd { value } => {
                if let Some(v) = st.local(value) {
                    st.globals().add_result(v.clone());
                }
                Ok(Ctrl::Continue)
            }

            DecodedStmt::ReturnLocal { source } => {
                st.set_return(source);
                Ok(Ctrl::Continue)
            }

            DecodedStmt::ResetLocal { target } => {
                st.unset(target);
                Ok(Ctrl::Continue)
            }
        }
    }

    fn eval_dot(
        &self,
        st: &mut State,
        source: Operand,
        key: Operand,
        target: Local,
    ) -> Result<Ctrl, EvalError> {
        let rooted = match source {
            Operand::Local(l) => st.is_data_rooted(l),
            // Constants are scalars; member access on them is undefined.
            _ => {
                st.unset(target);
                return Ok(Ctrl::Break(0));
            }
        };
        let (Some(src), Some(k)) = (
            st.resolve(source, self.plan)?,
            st.resolve(key, self.plan)?,
        ) else {
            st.unset(target);
            return Ok(Ctrl::Break(0));
        };
        let found = match &src {
            Value::Object(o) => o.get(&k).cloned(),
            Value::Array(a) => k
                .as_number()
                .and_then(Number::as_i64)
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| a.get(i).cloned()),
            // Member access on a set is membership: it yields the element.
            Value::Set(s) => s.contains(&k).then_some(k),
            _ => None,
        };
        match found {
            Some(v) => {
                st.set_value(target, v);
                if rooted {
                    st.mark_data_rooted(target);
                }
                Ok(Ctrl::Continue)
            }
            None => {
                st.unset(target);
                Ok(Ctrl::Break(0))
            }
        }
    }

    fn eval_scan(
        &self,
        st: &mut State,
        source: Local,
        key: Local,
        value: Local,
        block: Block<'p>,
    ) -> Result<Ctrl, EvalError> {
        // Clone the handle: the body may rebind the source local, and
        // copy-on-write keeps this iteration's snapshot intact.
        let Some(src) = st.local(source).cloned() else {
            return Ok(Ctrl::Break(0));
        };
        match src {
            Value::Array(a) => {
                for (idx, elem) in a.iter().enumerate() {
                    st.globals().instr(1)?;
                    st.set_value(key, Value::int(idx as i64));
                    st.set_value(value, elem.clone());
                    match self.eval_block(st, block)? {
                        BlockResult::Completed | BlockResult::Broke => {}
                        BlockResult::Break(i) => return Ok(Ctrl::Break(i)),
                    }
                }
            }
            Value::Object(o) => {
                for (k, v) in o.iter() {
                    st.globals().instr(1)?;
                    st.set_value(key, k.clone());
                    st.set_value(value, v.clone());
                    match self.eval_block(st, block)? {
                        BlockResult::Completed | BlockResult::Broke => {}
                        BlockResult::Break(i) => return Ok(Ctrl::Break(i)),
                    }
                }
            }
            Value::Set(s) => {
                for elem in s.iter() {
                    st.globals().instr(1)?;
                    st.set_value(key, elem.clone());
                    st.set_value(value, elem.clone());
                    match self.eval_block(st, block)? {
                        BlockResult::Completed | BlockResult::Broke => {}
                        BlockResult::Break(i) => return Ok(Ctrl::Break(i)),
                    }
                }
            }
            _ => return Ok(Ctrl::Break(0)),
        }
        Ok(Ctrl::Continue)
    }

    fn eval_call_dynamic(
        &self,
        st: &mut State,
        args: OperandSeq<'p>,
        path: OperandSeq<'p>,
        result: Local,
    ) -> Result<Ctrl, EvalError> {
        let argv = self.resolve_args(st, args)?;
        let mut segs = Vec::with_capacity(path.len());
        for p in path.iter() {
            match st.resolve(p?, self.plan)? {
                Some(Value::String(s)) => segs.push(s.to_string()),
                _ => return Ok(Ctrl::Break(0)),
            }
        }

        if let Some(idx) = self.plan.func_by_path(&segs) {
            return match self.call_func(st, idx, &argv)? {
                Some(v) => {
                    st.set_value(result, v);
                    Ok(Ctrl::Continue)
                }
                // The rule exists but produced nothing: skip the three
                // blocks that consume a defined result.
                None => Ok(Ctrl::Break(3)),
            };
        }

        // No such function: resolve through the data document instead.
        let mut cur = st.local(DATA_LOCAL).cloned();
        for seg in &segs {
            cur = match cur {
                Some(Value::Object(o)) => o.get(&Value::string(seg.as_str())).cloned(),
                _ => None,
            };
        }
        match cur {
            Some(v) => {
                // With just the two implicit arguments this is a plain data
                // reference; anything more expected a function here.
                if argv.len() > 2 {
                    return Err(EvalError::FunctionCallToData(segs.join("/")));
                }
                st.set_value(result, v);
                Ok(Ctrl::Continue)
            }
            None => Ok(Ctrl::Break(0)),
        }
    }

    fn call_func(
        &self,
        st: &mut State,
        idx: u32,
        args: &[Option<Value>],
    ) -> Result<Option<Value>, EvalError> {
        let f = self.plan.function(idx)?;
        st.globals().instr(1)?;

        // Only the function's own arguments fingerprint; the leading
        // input/data pair is ambient.
        let own = if args.len() > 2 { &args[2..] } else { &[][..] };
        let fp = fingerprint(own);
        if let Some(fpv) = fp {
            if let Some(cached) = st.globals().memoize_get(idx, fpv) {
                let hits = &st.globals().counters.virtual_cache_hits;
                hits.set(hits.get() + 1);
                return Ok(cached);
            }
        }
        let misses = &st.globals().counters.virtual_cache_misses;
        misses.set(misses.get() + 1);

        let mut child = st.child(self.num_locals());
        for (i, a) in args.iter().take(f.num_params() as usize).enumerate() {
            child.set_optional(i as u32, a.clone());
        }
        if f.num_params() > DATA_LOCAL {
            child.mark_data_rooted(DATA_LOCAL);
        }
        self.eval_block_seq(&mut child, f.blocks())?;
        let out = match child.return_register() {
            Some(l) => child.local(l).cloned(),
            None => child.local(f.return_local()).cloned(),
        };
        drop(child);

        if let Some(fpv) = fp {
            st.globals().memoize_insert(idx, fpv, out.clone());
        }
        Ok(out)
    }

    fn resolve_args(
        &self,
        st: &State,
        args: OperandSeq<'p>,
    ) -> Result<Vec<Option<Value>>, EvalError> {
        let mut out = Vec::with_capacity(args.len());
        for a in args.iter() {
            out.push(st.resolve(a?, self.plan)?);
        }
        Ok(out)
    }
}

/// Shallow copy-on-write upsert along a path of string keys. Intermediate
/// objects fork one level at a time; untouched children stay shared.
fn upsert(base: Option<&Value>, path: &[Arc<str>], leaf: Value) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return leaf;
    };
    let mut obj = match base {
        Some(Value::Object(o)) => o.clone(),
        _ => Object::new(),
    };
    let key = Value::String(Arc::clone(head));
    let existing = obj.get(&key).cloned();
    let child = upsert(existing.as_ref(), rest, leaf);
    obj.insert(key, child);
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::builder::{BlockBuilder, PlanBuilder};
    use crate::state::{CancelToken, EvalStats, Globals, GlobalsConfig};
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::time::SystemTime;

    struct Run {
        results: Vec<Value>,
        stats: EvalStats,
    }

    fn run(pb: PlanBuilder) -> Result<Run, EvalError> {
        run_with_data(pb, Value::Object(Object::new()))
    }

    fn run_with_data(pb: PlanBuilder, data: Value) -> Result<Run, EvalError> {
        let plan = Plan::decode(pb.finish()).expect("plan must validate");
        let globals = Globals::new(GlobalsConfig {
            cancel: CancelToken::new(),
            time: SystemTime::UNIX_EPOCH,
            seed: 0,
            instruction_limit: 0,
            builtins: HashMap::new(),
            interquery: None,
            ndb: None,
            print_hook: None,
            capabilities: None,
        });
        let mut st = State::new(Rc::clone(&globals), plan.max_local() as usize + 1);
        st.set_value(DATA_LOCAL, data);
        st.mark_data_rooted(DATA_LOCAL);
        let entry = plan.entrypoint(None).expect("entrypoint");
        Evaluator::new(&plan).eval_entry(&mut st, entry.blocks)?;
        drop(st);
        let results = globals.result_set.borrow().iter().cloned().collect();
        Ok(Run {
            results,
            stats: globals.counters.snapshot(),
        })
    }

    #[test]
    fn test_break_terminates_exactly_n_plus_one_blocks() {
        // Innermost block breaks out of itself and one more level; the
        // statement after the outer blockStmt still runs.
        let mut inner = BlockBuilder::new();
        inner.break_stmt(1);
        inner.assign_int(111, 2); // never runs

        let mut middle = BlockBuilder::new();
        middle.block_stmt(vec![inner]);
        middle.assign_int(222, 3); // skipped: break crossed this block

        let mut outer = BlockBuilder::new();
        outer.block_stmt(vec![middle]);
        outer.assign_int(7, 4); // runs: the break stopped two levels below
        outer.make_object(5);
        outer.object_insert(Operand::Local(9), Operand::Local(9), 5); // undefined operands end this block

        let mut pb = PlanBuilder::new();
        let mut entry = BlockBuilder::new();
        entry.block_stmt(vec![outer]);
        entry.assign_int(1, 6);
        entry.make_set(7);
        entry.set_add(Operand::Local(6), 7);
        entry.result_set_add(7);
        pb.add_entrypoint("main", vec![entry]);

        let out = run(pb).unwrap();
        assert_eq!(out.results.len(), 1);
    }

    #[test]
    fn test_not_inverts_block_outcome() {
        // not { 1 == 2 } succeeds; not { 1 == 1 } stops the block.
        let mut failing = BlockBuilder::new();
        failing.equal(Operand::Int(1), Operand::Int(2));
        let mut succeeding = BlockBuilder::new();
        succeeding.equal(Operand::Int(1), Operand::Int(1));

        let mut entry = BlockBuilder::new();
        entry.not(failing);
        entry.assign_int(10, 2);
        entry.result_set_add(2);
        entry.not(succeeding);
        entry.assign_int(20, 3);
        entry.result_set_add(3); // unreachable

        let mut pb = PlanBuilder::new();
        pb.add_entrypoint("main", vec![entry]);
        let out = run(pb).unwrap();
        assert_eq!(out.results, vec![Value::int(10)]);
    }

    #[test]
    fn test_scan_visits_every_pair() {
        let mut pb = PlanBuilder::new();
        let mut body = BlockBuilder::new();
        body.array_append(Operand::Local(3), 4);

        let mut entry = BlockBuilder::new();
        entry.make_array(0, 2);
        entry.array_append(Operand::Int(5), 2);
        entry.array_append(Operand::Int(6), 2);
        entry.array_append(Operand::Int(7), 2);
        entry.make_array(0, 4);
        entry.scan(2, 5, 3, body);
        entry.result_set_add(4);
        pb.add_entrypoint("main", vec![entry]);

        let out = run(pb).unwrap();
        let expected = Value::Array(vec![Value::int(5), Value::int(6), Value::int(7)].into());
        assert_eq!(out.results, vec![expected]);
    }

    #[test]
    fn test_scan_early_break() {
        // Body breaks past the loop after the first element.
        let mut body = BlockBuilder::new();
        body.array_append(Operand::Local(3), 4);
        body.break_stmt(1);

        let mut pb = PlanBuilder::new();
        let mut inner_blk = BlockBuilder::new();
        inner_blk.make_array(0, 2);
        inner_blk.array_append(Operand::Int(1), 2);
        inner_blk.array_append(Operand::Int(2), 2);
        inner_blk.make_array(0, 4);
        inner_blk.scan(2, 5, 3, body);
        inner_blk.assign_int(99, 6); // skipped by the escaping break

        let mut entry = BlockBuilder::new();
        entry.block_stmt(vec![inner_blk]);
        entry.result_set_add(4);
        pb.add_entrypoint("main", vec![entry]);

        let out = run(pb).unwrap();
        assert_eq!(
            out.results,
            vec![Value::Array(vec![Value::int(1)].into())]
        );
    }

    #[test]
    fn test_assign_var_once_conflict() {
        let mut entry = BlockBuilder::new();
        entry.assign_var_once(Operand::Int(1), 2);
        entry.assign_var_once(Operand::Int(1), 2); // same value: fine
        entry.assign_var_once(Operand::Int(2), 2); // conflict
        let mut pb = PlanBuilder::new();
        pb.add_entrypoint("main", vec![entry]);
        assert!(matches!(run(pb), Err(EvalError::VarAssignConflict)));
    }

    #[test]
    fn test_object_insert_once_conflict() {
        let mut pb = PlanBuilder::new();
        let k = pb.string("k");
        let mut entry = BlockBuilder::new();
        entry.make_object(2);
        entry.object_insert_once(Operand::StringIndex(k), Operand::Int(1), 2);
        entry.object_insert_once(Operand::StringIndex(k), Operand::Int(2), 2);
        pb.add_entrypoint("main", vec![entry]);
        assert!(matches!(run(pb), Err(EvalError::ObjectInsertConflict)));
    }

    #[test]
    fn test_object_merge_requires_objects() {
        let mut entry = BlockBuilder::new();
        entry.make_object(2);
        entry.assign_int(1, 3);
        entry.object_merge(2, 3, 4);
        let mut pb = PlanBuilder::new();
        pb.add_entrypoint("main", vec![entry]);
        assert!(matches!(run(pb), Err(EvalError::ObjectInsertConflict)));
    }

    #[test]
    fn test_with_restores_on_exit() {
        let mut pb = PlanBuilder::new();
        let key = pb.string("k");

        // Body records the overridden value.
        let mut body = BlockBuilder::new();
        body.dot(Operand::Local(2), Operand::StringIndex(key), 3);
        body.result_set_add(3);

        let mut entry = BlockBuilder::new();
        entry.make_object(2);
        entry.object_insert(Operand::StringIndex(key), Operand::Int(1), 2);
        entry.with(2, &[key], Operand::Int(99), body);
        // After the with, the original binding is visible again.
        entry.dot(Operand::Local(2), Operand::StringIndex(key), 4);
        entry.result_set_add(4);
        pb.add_entrypoint("main", vec![entry]);

        let out = run(pb).unwrap();
        assert_eq!(out.results, vec![Value::int(99), Value::int(1)]);
    }

    #[test]
    fn test_function_memoization_hits() {
        let mut pb = PlanBuilder::new();
        // fn f(input, data, x) { return x }
        let mut fblk = BlockBuilder::new();
        fblk.assign_var(Operand::Local(2), 3);
        fblk.return_local(3);
        let f = pb.add_function(&["pkg", "f"], 3, 3, vec![fblk]);

        let mut entry = BlockBuilder::new();
        let args = [
            Operand::Local(0),
            Operand::Local(1),
            Operand::Int(42),
        ];
        entry.call(FuncRef::Plan(f), &args, 4);
        entry.call(FuncRef::Plan(f), &args, 5);
        entry.result_set_add(5);
        pb.add_entrypoint("main", vec![entry]);

        let out = run(pb).unwrap();
        assert_eq!(out.results, vec![Value::int(42)]);
        assert_eq!(out.stats.virtual_cache_hits, 1);
        assert_eq!(out.stats.virtual_cache_misses, 1);
    }

    #[test]
    fn test_compound_args_skip_memoization() {
        let mut pb = PlanBuilder::new();
        let mut fblk = BlockBuilder::new();
        fblk.assign_var(Operand::Local(2), 3);
        fblk.return_local(3);
        let f = pb.add_function(&["pkg", "g"], 3, 3, vec![fblk]);

        let mut entry = BlockBuilder::new();
        entry.make_array(0, 2);
        let args = [Operand::Local(0), Operand::Local(1), Operand::Local(2)];
        entry.call(FuncRef::Plan(f), &args, 4);
        entry.call(FuncRef::Plan(f), &args, 5);
        pb.add_entrypoint("main", vec![entry]);

        let out = run(pb).unwrap();
        assert_eq!(out.stats.virtual_cache_hits, 0);
        assert_eq!(out.stats.virtual_cache_misses, 2);
    }

    #[test]
    fn test_call_dynamic_returns_data_with_implicit_args() {
        let mut pb = PlanBuilder::new();
        let seg = pb.string("roles");
        let mut entry = BlockBuilder::new();
        entry.call_dynamic(
            &[Operand::Local(0), Operand::Local(1)],
            &[Operand::StringIndex(seg)],
            2,
        );
        entry.result_set_add(2);
        pb.add_entrypoint("main", vec![entry]);

        let mut data = Object::new();
        data.insert(Value::string("roles"), Value::string("admin"));
        let out = run_with_data(pb, Value::Object(data)).unwrap();
        assert_eq!(out.results, vec![Value::string("admin")]);
    }

    #[test]
    fn test_call_dynamic_extra_args_into_data_errors() {
        let mut pb = PlanBuilder::new();
        let seg = pb.string("roles");
        let mut entry = BlockBuilder::new();
        entry.call_dynamic(
            &[Operand::Local(0), Operand::Local(1), Operand::Int(1)],
            &[Operand::StringIndex(seg)],
            2,
        );
        pb.add_entrypoint("main", vec![entry]);

        let mut data = Object::new();
        data.insert(Value::string("roles"), Value::string("admin"));
        assert!(matches!(
            run_with_data(pb, Value::Object(data)),
            Err(EvalError::FunctionCallToData(path)) if path == "roles"
        ));
    }

    #[test]
    fn test_dot_undefined_paths_stop() {
        let mut pb = PlanBuilder::new();
        let missing = pb.string("missing");
        let mut entry = BlockBuilder::new();
        entry.dot(Operand::Local(1), Operand::StringIndex(missing), 2);
        entry.result_set_add(2); // unreachable
        pb.add_entrypoint("main", vec![entry]);
        let out = run(pb).unwrap();
        assert!(out.results.is_empty());
    }

    #[test]
    fn test_upsert_shares_untouched_children() {
        let mut shared = Object::new();
        shared.insert(Value::string("deep"), Value::int(1));
        let mut base = Object::new();
        base.insert(Value::string("a"), Value::Object(shared));
        base.insert(Value::string("b"), Value::int(2));

        let path = [Arc::<str>::from("b")];
        let updated = upsert(Some(&Value::Object(base.clone())), &path, Value::int(9));
        let Value::Object(updated) = updated else { panic!() };
        assert_eq!(updated.get(&Value::string("b")), Some(&Value::int(9)));
        // The sibling subtree is the same shared handle's contents.
        assert_eq!(
            updated.get(&Value::string("a")),
            base.get(&Value::string("a"))
        );
    }
}
