//! Plan encoder
//!
//! The write side of the wire format, for hosts that lower policies
//! themselves and for tests. The builder interns strings, assigns function
//! indices at declaration time (so call statements can reference functions
//! that get their bodies later), and assembles the byte stream in
//! [`PlanBuilder::finish`].

use super::{FuncRef, Local, Operand, StmtTag};
use crate::bytes::{write_ivarint, write_uvarint};
use std::collections::HashMap;

#[derive(Default)]
pub struct PlanBuilder {
    strings: Vec<String>,
    ids: HashMap<String, u32>,
    funcs: Vec<FuncDef>,
    entrypoints: Vec<(u32, Vec<BlockBuilder>)>,
}

struct FuncDef {
    path: Vec<u32>,
    num_params: u32,
    return_local: Local,
    blocks: Vec<BlockBuilder>,
}

impl PlanBuilder {
    pub fn new() -> PlanBuilder {
        PlanBuilder::default()
    }

    /// Intern a string, returning its pool index.
    pub fn string(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }

    /// Declare a function and get its index; the body arrives via
    /// [`PlanBuilder::set_function_blocks`]. Parameters occupy locals
    /// `0..num_params`, with input and data at the first two.
    pub fn declare_function(
        &mut self,
        path: &[&str],
        num_params: u32,
        return_local: Local,
    ) -> u32 {
        let path = path.iter().map(|s| self.string(s)).collect();
        let idx = self.funcs.len() as u32;
        self.funcs.push(FuncDef {
            path,
            num_params,
            return_local,
            blocks: Vec::new(),
        });
        idx
    }

    pub fn set_function_blocks(&mut self, idx: u32, blocks: Vec<BlockBuilder>) {
        self.funcs[idx as usize].blocks = blocks;
    }

    /// Declare a function and its body in one step.
    pub fn add_function(
        &mut self,
        path: &[&str],
        num_params: u32,
        return_local: Local,
        blocks: Vec<BlockBuilder>,
    ) -> u32 {
        let idx = self.declare_function(path, num_params, return_local);
        self.set_function_blocks(idx, blocks);
        idx
    }

    pub fn add_entrypoint(&mut self, name: &str, blocks: Vec<BlockBuilder>) {
        let name = self.string(name);
        self.entrypoints.push((name, blocks));
    }

    /// Assemble the plan byte stream.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(super::MAGIC);
        out.push(super::VERSION);

        write_uvarint(&mut out, self.strings.len() as u64);
        for s in &self.strings {
            write_uvarint(&mut out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }

        write_uvarint(&mut out, self.funcs.len() as u64);
        for f in &self.funcs {
            write_uvarint(&mut out, f.path.len() as u64);
            for &seg in &f.path {
                write_uvarint(&mut out, seg.into());
            }
            write_uvarint(&mut out, f.num_params.into());
            write_uvarint(&mut out, f.return_local.into());
            encode_blocks(&mut out, &f.blocks);
        }

        write_uvarint(&mut out, self.entrypoints.len() as u64);
        for (name, blocks) in &self.entrypoints {
            write_uvarint(&mut out, (*name).into());
            encode_blocks(&mut out, blocks);
        }
        out
    }
}

fn encode_blocks(out: &mut Vec<u8>, blocks: &[BlockBuilder]) {
    write_uvarint(out, blocks.len() as u64);
    for b in blocks {
        b.encode_into(out);
    }
}

/// Accumulates encoded statements for one block.
#[derive(Clone, Default)]
pub struct BlockBuilder {
    count: u32,
    buf: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> BlockBuilder {
        BlockBuilder::default()
    }

    fn stmt(&mut self, tag: StmtTag, body: &[u8]) {
        write_uvarint(&mut self.buf, (tag as u64) | ((body.len() as u64) << 6));
        self.buf.extend_from_slice(body);
        self.count += 1;
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        write_uvarint(out, self.count.into());
        out.extend_from_slice(&self.buf);
    }

    pub fn nop(&mut self) {
        self.stmt(StmtTag::Nop, &[]);
    }

    pub fn array_append(&mut self, value: Operand, array: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, value);
        write_uvarint(&mut b, array.into());
        self.stmt(StmtTag::ArrayAppend, &b);
    }

    pub fn assign_int(&mut self, value: i64, target: Local) {
        let mut b = Vec::new();
        write_ivarint(&mut b, value);
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::AssignInt, &b);
    }

    pub fn assign_var(&mut self, source: Operand, target: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, source);
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::AssignVar, &b);
    }

    pub fn assign_var_once(&mut self, source: Operand, target: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, source);
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::AssignVarOnce, &b);
    }

    pub fn block_stmt(&mut self, blocks: Vec<BlockBuilder>) {
        let mut b = Vec::new();
        encode_blocks(&mut b, &blocks);
        self.stmt(StmtTag::BlockStmt, &b);
    }

    pub fn break_stmt(&mut self, index: u32) {
        let mut b = Vec::new();
        write_uvarint(&mut b, index.into());
        self.stmt(StmtTag::BreakStmt, &b);
    }

    pub fn call(&mut self, func: FuncRef, args: &[Operand], result: Local) {
        let mut b = Vec::new();
        match func {
            FuncRef::Plan(i) => {
                b.push(0);
                write_uvarint(&mut b, i.into());
            }
            FuncRef::Builtin(s) => {
                b.push(1);
                write_uvarint(&mut b, s.into());
            }
        }
        put_operands(&mut b, args);
        write_uvarint(&mut b, result.into());
        self.stmt(StmtTag::Call, &b);
    }

    pub fn call_dynamic(&mut self, args: &[Operand], path: &[Operand], result: Local) {
        let mut b = Vec::new();
        put_operands(&mut b, args);
        put_operands(&mut b, path);
        write_uvarint(&mut b, result.into());
        self.stmt(StmtTag::CallDynamic, &b);
    }

    pub fn dot(&mut self, source: Operand, key: Operand, target: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, source);
        put_operand(&mut b, key);
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::Dot, &b);
    }

    pub fn equal(&mut self, a: Operand, b_op: Operand) {
        let mut b = Vec::new();
        put_operand(&mut b, a);
        put_operand(&mut b, b_op);
        self.stmt(StmtTag::Equal, &b);
    }

    pub fn not_equal(&mut self, a: Operand, b_op: Operand) {
        let mut b = Vec::new();
        put_operand(&mut b, a);
        put_operand(&mut b, b_op);
        self.stmt(StmtTag::NotEqual, &b);
    }

    pub fn is_array(&mut self, source: Operand) {
        let mut b = Vec::new();
        put_operand(&mut b, source);
        self.stmt(StmtTag::IsArray, &b);
    }

    pub fn is_object(&mut self, source: Operand) {
        let mut b = Vec::new();
        put_operand(&mut b, source);
        self.stmt(StmtTag::IsObject, &b);
    }

    pub fn is_defined(&mut self, source: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, source.into());
        self.stmt(StmtTag::IsDefined, &b);
    }

    pub fn is_undefined(&mut self, source: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, source.into());
        self.stmt(StmtTag::IsUndefined, &b);
    }

    pub fn len(&mut self, source: Operand, target: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, source);
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::Len, &b);
    }

    pub fn make_array(&mut self, capacity: u32, target: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, capacity.into());
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::MakeArray, &b);
    }

    pub fn make_null(&mut self, target: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::MakeNull, &b);
    }

    pub fn make_number_int(&mut self, value: i64, target: Local) {
        let mut b = Vec::new();
        write_ivarint(&mut b, value);
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::MakeNumberInt, &b);
    }

    pub fn make_number_ref(&mut self, index: u32, target: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, index.into());
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::MakeNumberRef, &b);
    }

    pub fn make_object(&mut self, target: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::MakeObject, &b);
    }

    pub fn make_set(&mut self, target: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::MakeSet, &b);
    }

    pub fn not(&mut self, block: BlockBuilder) {
        let mut b = Vec::new();
        block.encode_into(&mut b);
        self.stmt(StmtTag::Not, &b);
    }

    pub fn object_insert(&mut self, key: Operand, value: Operand, object: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, key);
        put_operand(&mut b, value);
        write_uvarint(&mut b, object.into());
        self.stmt(StmtTag::ObjectInsert, &b);
    }

    pub fn object_insert_once(&mut self, key: Operand, value: Operand, object: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, key);
        put_operand(&mut b, value);
        write_uvarint(&mut b, object.into());
        self.stmt(StmtTag::ObjectInsertOnce, &b);
    }

    pub fn object_merge(&mut self, a: Local, b_local: Local, target: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, a.into());
        write_uvarint(&mut b, b_local.into());
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::ObjectMerge, &b);
    }

    pub fn reset_local(&mut self, target: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, target.into());
        self.stmt(StmtTag::ResetLocal, &b);
    }

    pub fn result_set_add(&mut self, value: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, value.into());
        self.stmt(StmtTag::ResultSetAdd, &b);
    }

    pub fn return_local(&mut self, source: Local) {
        let mut b = Vec::new();
        write_uvarint(&mut b, source.into());
        self.stmt(StmtTag::ReturnLocal, &b);
    }

    pub fn scan(&mut self, source: Local, key: Local, value: Local, block: BlockBuilder) {
        let mut b = Vec::new();
        write_uvarint(&mut b, source.into());
        write_uvarint(&mut b, key.into());
        write_uvarint(&mut b, value.into());
        block.encode_into(&mut b);
        self.stmt(StmtTag::Scan, &b);
    }

    pub fn set_add(&mut self, value: Operand, set: Local) {
        let mut b = Vec::new();
        put_operand(&mut b, value);
        write_uvarint(&mut b, set.into());
        self.stmt(StmtTag::SetAdd, &b);
    }

    pub fn with(&mut self, target: Local, path: &[u32], value: Operand, block: BlockBuilder) {
        let mut b = Vec::new();
        write_uvarint(&mut b, target.into());
        write_uvarint(&mut b, path.len() as u64);
        for &seg in path {
            write_uvarint(&mut b, seg.into());
        }
        put_operand(&mut b, value);
        block.encode_into(&mut b);
        self.stmt(StmtTag::With, &b);
    }
}

fn put_operand(out: &mut Vec<u8>, op: Operand) {
    match op {
        Operand::Local(l) => {
            out.push(0);
            write_uvarint(out, l.into());
        }
        Operand::Bool(v) => {
            out.push(1);
            out.push(u8::from(v));
        }
        Operand::StringIndex(s) => {
            out.push(2);
            write_uvarint(out, s.into());
        }
        Operand::Int(i) => {
            out.push(3);
            write_ivarint(out, i);
        }
    }
}

fn put_operands(out: &mut Vec<u8>, ops: &[Operand]) {
    write_uvarint(out, ops.len() as u64);
    for &op in ops {
        put_operand(out, op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;

    #[test]
    fn test_string_interning_dedups() {
        let mut pb = PlanBuilder::new();
        let a = pb.string("x");
        let b = pb.string("y");
        let c = pb.string("x");
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_nested_blocks_encode() {
        let mut pb = PlanBuilder::new();
        let mut inner = BlockBuilder::new();
        inner.break_stmt(1);
        let mut outer = BlockBuilder::new();
        outer.block_stmt(vec![inner]);
        outer.make_null(2);
        pb.add_entrypoint("main", vec![outer]);
        // Round-trips through the validator.
        Plan::decode(pb.finish()).unwrap();
    }

    #[test]
    fn test_empty_plan_decodes() {
        let pb = PlanBuilder::new();
        let plan = Plan::decode(pb.finish()).unwrap();
        assert!(matches!(
            plan.entrypoint(None),
            Err(crate::plan::PlanError::NoEntrypoints)
        ));
    }
}
