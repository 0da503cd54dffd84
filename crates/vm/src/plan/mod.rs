//! Compiled plan reader
//!
//! A plan is the lowered form of a policy program, produced once by an
//! external compiler and shared read-only across evaluations. The decoder
//! validates the whole byte stream up front; after that, block and statement
//! accessors are zero-copy views into the original buffer.
//!
//! # Wire format
//!
//! All integers are LEB128 varints; signed values are zigzag-encoded.
//!
//! ```text
//! plan        := "VPLN" version:u8 strings functions entrypoints
//! strings     := count { len bytes }            # UTF-8 string pool
//! functions   := count { function }
//! function    := path-len { string-index }      # name path, for dynamic calls
//!                num-params                     # params occupy locals 0..n
//!                return-local
//!                blocks
//! entrypoints := count { name:string-index blocks }
//! blocks      := count { block }
//! block       := count { stmt }
//! stmt        := header:varint body             # header = tag | size << 6
//! ```
//!
//! The statement header packs the type tag into the low six bits and the
//! body's byte length above them, so a reader can skip any statement without
//! understanding it. Operands are a tag byte followed by their payload:
//! `0` local, `1` bool, `2` string-pool index, `3` inline int.

pub mod builder;

use crate::bytes::{read_ivarint, read_uvarint};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Register index into a state's local slots.
pub type Local = u32;

/// The local holding the query input document.
pub const INPUT_LOCAL: Local = 0;
/// The local holding the base data document.
pub const DATA_LOCAL: Local = 1;

const MAGIC: &[u8; 4] = b"VPLN";
const VERSION: u8 = 1;

/// Statement type tags, in the order fixed by the wire format.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StmtTag {
    ArrayAppend = 0,
    AssignInt = 1,
    AssignVar = 2,
    AssignVarOnce = 3,
    BlockStmt = 4,
    BreakStmt = 5,
    Call = 6,
    CallDynamic = 7,
    Dot = 8,
    Equal = 9,
    IsArray = 10,
    IsDefined = 11,
    IsObject = 12,
    IsUndefined = 13,
    Len = 14,
    MakeArray = 15,
    MakeNull = 16,
    MakeNumberInt = 17,
    MakeNumberRef = 18,
    MakeObject = 19,
    MakeSet = 20,
    Nop = 21,
    Not = 22,
    NotEqual = 23,
    ObjectInsert = 24,
    ObjectInsertOnce = 25,
    ObjectMerge = 26,
    ResetLocal = 27,
    ResultSetAdd = 28,
    ReturnLocal = 29,
    Scan = 30,
    SetAdd = 31,
    With = 32,
}

impl StmtTag {
    fn from_u8(v: u8) -> Option<StmtTag> {
        if v <= StmtTag::With as u8 {
            // Tags are contiguous from 0.
            Some(unsafe { std::mem::transmute::<u8, StmtTag>(v) })
        } else {
            None
        }
    }
}

/// Decoding/validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    UnexpectedEof,
    BadMagic,
    UnsupportedVersion(u8),
    BadUtf8,
    BadStatementTag(u8),
    BadOperandTag(u8),
    StatementOverrun(StmtTag),
    StringIndexOutOfRange(u32),
    FunctionIndexOutOfRange(u32),
    BadNumberLiteral(String),
    TrailingBytes,
    NoEntrypoints,
    UnknownEntrypoint(String),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::UnexpectedEof => write!(f, "unexpected end of plan"),
            PlanError::BadMagic => write!(f, "bad magic bytes"),
            PlanError::UnsupportedVersion(v) => write!(f, "unsupported plan version {v}"),
            PlanError::BadUtf8 => write!(f, "string pool entry is not UTF-8"),
            PlanError::BadStatementTag(t) => write!(f, "unknown statement tag {t}"),
            PlanError::BadOperandTag(t) => write!(f, "unknown operand tag {t}"),
            PlanError::StatementOverrun(tag) => {
                write!(f, "{tag:?} statement fields exceed its declared size")
            }
            PlanError::StringIndexOutOfRange(i) => write!(f, "string index {i} out of range"),
            PlanError::FunctionIndexOutOfRange(i) => {
                write!(f, "function index {i} out of range")
            }
            PlanError::BadNumberLiteral(s) => write!(f, "bad number literal {s:?}"),
            PlanError::TrailingBytes => write!(f, "trailing bytes after plan"),
            PlanError::NoEntrypoints => write!(f, "plan has no entrypoints"),
            PlanError::UnknownEntrypoint(name) => write!(f, "unknown entrypoint {name:?}"),
        }
    }
}

impl std::error::Error for PlanError {}

/// A call target: a plan function by index, or a builtin by pooled name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FuncRef {
    Plan(u32),
    Builtin(u32),
}

/// A local register or an inline constant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Local(Local),
    Bool(bool),
    StringIndex(u32),
    Int(i64),
}

struct FuncMeta {
    path: Vec<u32>,
    num_params: u32,
    return_local: Local,
    blocks: Region,
}

struct EntryMeta {
    name: u32,
    blocks: Region,
}

/// Byte span of a block sequence within the plan buffer, after its count.
#[derive(Copy, Clone)]
struct Region {
    start: usize,
    end: usize,
    count: u32,
}

pub struct Plan {
    buf: Arc<[u8]>,
    strings: Vec<Arc<str>>,
    funcs: Vec<FuncMeta>,
    entrypoints: Vec<EntryMeta>,
    path_index: HashMap<Vec<String>, u32>,
    max_local: Local,
}

impl Plan {
    /// Decode and validate a compiled plan. The buffer is retained; all
    /// later accessors borrow from it.
    pub fn decode(bytes: impl Into<Arc<[u8]>>) -> Result<Plan, PlanError> {
        let buf: Arc<[u8]> = bytes.into();
        let mut cur = Cursor::new(&buf);

        if cur.take(4)? != MAGIC {
            return Err(PlanError::BadMagic);
        }
        let version = cur.u8()?;
        if version != VERSION {
            return Err(PlanError::UnsupportedVersion(version));
        }

        let nstrings = cur.u32()?;
        let mut strings = Vec::with_capacity(nstrings as usize);
        for _ in 0..nstrings {
            let len = cur.u32()? as usize;
            let raw = cur.take(len)?;
            let s = std::str::from_utf8(raw).map_err(|_| PlanError::BadUtf8)?;
            strings.push(Arc::<str>::from(s));
        }

        let nfuncs = cur.u32()?;
        let mut funcs = Vec::with_capacity(nfuncs as usize);
        for _ in 0..nfuncs {
            let plen = cur.u32()?;
            let mut path = Vec::with_capacity(plen as usize);
            for _ in 0..plen {
                path.push(cur.u32()?);
            }
            let num_params = cur.u32()?;
            let return_local = cur.u32()?;
            let blocks = cur.block_region()?;
            funcs.push(FuncMeta {
                path,
                num_params,
                return_local,
                blocks,
            });
        }

        let nentries = cur.u32()?;
        let mut entrypoints = Vec::with_capacity(nentries as usize);
        for _ in 0..nentries {
            let name = cur.u32()?;
            let blocks = cur.block_region()?;
            entrypoints.push(EntryMeta { name, blocks });
        }

        if !cur.at_end() {
            return Err(PlanError::TrailingBytes);
        }

        let mut plan = Plan {
            buf,
            strings,
            funcs,
            entrypoints,
            path_index: HashMap::new(),
            max_local: 0,
        };
        plan.validate()?;

        let mut path_index = HashMap::with_capacity(plan.funcs.len());
        for (i, f) in plan.funcs.iter().enumerate() {
            let path: Result<Vec<String>, PlanError> = f
                .path
                .iter()
                .map(|&s| plan.string(s).map(|s| s.to_string()))
                .collect();
            path_index.insert(path?, i as u32);
        }
        plan.path_index = path_index;
        Ok(plan)
    }

    pub fn num_functions(&self) -> usize {
        self.funcs.len()
    }

    pub fn function(&self, idx: u32) -> Result<Function<'_>, PlanError> {
        let meta = self
            .funcs
            .get(idx as usize)
            .ok_or(PlanError::FunctionIndexOutOfRange(idx))?;
        Ok(Function {
            plan: self,
            idx,
            meta,
        })
    }

    pub fn string(&self, idx: u32) -> Result<&Arc<str>, PlanError> {
        self.strings
            .get(idx as usize)
            .ok_or(PlanError::StringIndexOutOfRange(idx))
    }

    /// All entrypoint names, in plan order.
    pub fn entrypoint_names(&self) -> impl Iterator<Item = &str> {
        self.entrypoints
            .iter()
            .filter_map(|e| self.strings.get(e.name as usize).map(|s| &**s))
    }

    /// Look up an entrypoint; `None` picks the first.
    pub fn entrypoint(&self, name: Option<&str>) -> Result<Entrypoint<'_>, PlanError> {
        let meta = match name {
            None => self.entrypoints.first().ok_or(PlanError::NoEntrypoints)?,
            Some(want) => self
                .entrypoints
                .iter()
                .find(|e| {
                    self.strings
                        .get(e.name as usize)
                        .is_some_and(|s| &**s == want)
                })
                .ok_or_else(|| PlanError::UnknownEntrypoint(want.to_string()))?,
        };
        Ok(Entrypoint {
            name: self.string(meta.name)?.as_ref(),
            blocks: self.region_blocks(meta.blocks),
        })
    }

    pub(crate) fn func_by_path(&self, path: &[String]) -> Option<u32> {
        self.path_index.get(path).copied()
    }

    /// Highest local referenced anywhere in the plan; states size their
    /// register files from this.
    pub fn max_local(&self) -> Local {
        self.max_local
    }

    fn region_blocks(&self, r: Region) -> BlockSeq<'_> {
        BlockSeq {
            buf: &self.buf[r.start..r.end],
            count: r.count,
        }
    }

    /// Full structural walk: every statement decodes, every index is in
    /// range, every number literal parses.
    fn validate(&mut self) -> Result<(), PlanError> {
        let mut max_local = 0;
        let regions: Vec<Region> = self
            .funcs
            .iter()
            .map(|f| f.blocks)
            .chain(self.entrypoints.iter().map(|e| e.blocks))
            .collect();
        for f in &self.funcs {
            for &s in &f.path {
                self.check_string(s)?;
            }
            max_local = max_local.max(f.return_local).max(f.num_params);
        }
        for e in &self.entrypoints {
            self.check_string(e.name)?;
        }
        for r in regions {
            self.validate_blocks(self.region_blocks(r), &mut max_local)?;
        }
        self.max_local = max_local;
        Ok(())
    }

    fn validate_blocks(&self, blocks: BlockSeq<'_>, max_local: &mut Local) -> Result<(), PlanError> {
        for block in blocks.iter() {
            for stmt in block?.iter() {
                self.validate_stmt(stmt?.decode()?, max_local)?;
            }
        }
        Ok(())
    }

    fn validate_stmt(&self, stmt: DecodedStmt<'_>, max: &mut Local) -> Result<(), PlanError> {
        match stmt {
            DecodedStmt::Nop | DecodedStmt::BreakStmt { .. } => {}
            DecodedStmt::AssignInt { target, .. }
            | DecodedStmt::MakeArray { target, .. }
            | DecodedStmt::MakeNull { target }
            | DecodedStmt::MakeNumberInt { target, .. }
            | DecodedStmt::MakeObject { target }
            | DecodedStmt::MakeSet { target }
            | DecodedStmt::ResetLocal { target } => bump(max, target),
            DecodedStmt::MakeNumberRef { index, target } => {
                let lit = self.string(index)?;
                verdict_core::Number::parse(lit)
                    .ok_or_else(|| PlanError::BadNumberLiteral(lit.to_string()))?;
                bump(max, target);
            }
            DecodedStmt::AssignVar { source, target }
            | DecodedStmt::AssignVarOnce { source, target }
            | DecodedStmt::Len { source, target } => {
                self.check_operand(source, max)?;
                bump(max, target);
            }
            DecodedStmt::ArrayAppend { value, array } => {
                self.check_operand(value, max)?;
                bump(max, array);
            }
            DecodedStmt::SetAdd { value, set } => {
                self.check_operand(value, max)?;
                bump(max, set);
            }
            DecodedStmt::BlockStmt { blocks } => self.validate_blocks(blocks, max)?,
            DecodedStmt::Call { func, args, result } => {
                match func {
                    FuncRef::Plan(i) => {
                        if i as usize >= self.funcs.len() {
                            return Err(PlanError::FunctionIndexOutOfRange(i));
                        }
                    }
                    FuncRef::Builtin(s) => self.check_string(s)?,
                }
                for a in args.iter() {
                    self.check_operand(a?, max)?;
                }
                bump(max, result);
            }
            DecodedStmt::CallDynamic { args, path, result } => {
                for a in args.iter() {
                    self.check_operand(a?, max)?;
                }
                for p in path.iter() {
                    self.check_operand(p?, max)?;
                }
                bump(max, result);
            }
            DecodedStmt::Dot {
                source,
                key,
                target,
            } => {
                self.check_operand(source, max)?;
                self.check_operand(key, max)?;
                bump(max, target);
            }
            DecodedStmt::Equal { a, b } | DecodedStmt::NotEqual { a, b } => {
                self.check_operand(a, max)?;
                self.check_operand(b, max)?;
            }
            DecodedStmt::IsArray { source } | DecodedStmt::IsObject { source } => {
                self.check_operand(source, max)?;
            }
            DecodedStmt::IsDefined { source } | DecodedStmt::IsUndefined { source } => {
                bump(max, source);
            }
            DecodedStmt::Not { block } => {
                for stmt in block.iter() {
                    self.validate_stmt(stmt?.decode()?, max)?;
                }
            }
            DecodedStmt::ObjectInsert { key, value, object }
            | DecodedStmt::ObjectInsertOnce { key, value, object } => {
                self.check_operand(key, max)?;
                self.check_operand(value, max)?;
                bump(max, object);
            }
            DecodedStmt::ObjectMerge { a, b, target } => {
                bump(max, a);
                bump(max, b);
                bump(max, target);
            }
            DecodedStmt::ResultSetAdd { value } => bump(max, value),
            DecodedStmt::ReturnLocal { source } => bump(max, source),
            DecodedStmt::Scan {
                source,
                key,
                value,
                block,
            } => {
                bump(max, source);
                bump(max, key);
                bump(max, value);
                for stmt in block.iter() {
                    self.validate_stmt(stmt?.decode()?, max)?;
                }
            }
            DecodedStmt::With {
                target,
                path,
                value,
                block,
            } => {
                bump(max, target);
                for p in path.iter() {
                    self.check_string(p?)?;
                }
                self.check_operand(value, max)?;
                for stmt in block.iter() {
                    self.validate_stmt(stmt?.decode()?, max)?;
                }
            }
        }
        Ok(())
    }

    fn check_operand(&self, op: Operand, max: &mut Local) -> Result<(), PlanError> {
        match op {
            Operand::Local(l) => bump(max, l),
            Operand::StringIndex(s) => self.check_string(s)?,
            Operand::Bool(_) | Operand::Int(_) => {}
        }
        Ok(())
    }

    fn check_string(&self, idx: u32) -> Result<(), PlanError> {
        if (idx as usize) < self.strings.len() {
            Ok(())
        } else {
            Err(PlanError::StringIndexOutOfRange(idx))
        }
    }
}

fn bump(max: &mut Local, l: Local) {
    *max = (*max).max(l);
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("strings", &self.strings.len())
            .field("functions", &self.funcs.len())
            .field("entrypoints", &self.entrypoints.len())
            .finish()
    }
}

/// A plan function: fixed parameter positions, a return register, and a
/// sequence of blocks.
#[derive(Copy, Clone)]
pub struct Function<'p> {
    plan: &'p Plan,
    idx: u32,
    meta: &'p FuncMeta,
}

impl<'p> Function<'p> {
    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn num_params(&self) -> u32 {
        self.meta.num_params
    }

    pub fn return_local(&self) -> Local {
        self.meta.return_local
    }

    pub fn blocks(&self) -> BlockSeq<'p> {
        self.plan.region_blocks(self.meta.blocks)
    }
}

pub struct Entrypoint<'p> {
    pub name: &'p str,
    pub blocks: BlockSeq<'p>,
}

/// A counted sequence of blocks, lazily walked.
#[derive(Copy, Clone)]
pub struct BlockSeq<'p> {
    buf: &'p [u8],
    count: u32,
}

impl<'p> BlockSeq<'p> {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> BlockIter<'p> {
        BlockIter {
            cur: Cursor::new(self.buf),
            remaining: self.count,
        }
    }
}

pub struct BlockIter<'p> {
    cur: Cursor<'p>,
    remaining: u32,
}

impl<'p> Iterator for BlockIter<'p> {
    type Item = Result<Block<'p>, PlanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.cur.block())
    }
}

/// A counted sequence of statements.
#[derive(Copy, Clone)]
pub struct Block<'p> {
    buf: &'p [u8],
    count: u32,
}

impl<'p> Block<'p> {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> StmtIter<'p> {
        StmtIter {
            cur: Cursor::new(self.buf),
            remaining: self.count,
        }
    }
}

pub struct StmtIter<'p> {
    cur: Cursor<'p>,
    remaining: u32,
}

impl<'p> Iterator for StmtIter<'p> {
    type Item = Result<Stmt<'p>, PlanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.cur.stmt())
    }
}

/// One statement: a tag plus its undecoded body bytes.
#[derive(Copy, Clone)]
pub struct Stmt<'p> {
    tag: StmtTag,
    body: &'p [u8],
}

impl<'p> Stmt<'p> {
    /// The statement's type tag and total body size in bytes.
    pub fn ty(&self) -> (StmtTag, usize) {
        (self.tag, self.body.len())
    }

    /// Parse the statement's fields.
    pub fn decode(&self) -> Result<DecodedStmt<'p>, PlanError> {
        let mut c = Cursor::new(self.body);
        let stmt = match self.tag {
            StmtTag::Nop => DecodedStmt::Nop,
            StmtTag::ArrayAppend => DecodedStmt::ArrayAppend {
                value: c.operand()?,
                array: c.u32()?,
            },
            StmtTag::AssignInt => DecodedStmt::AssignInt {
                value: c.i64()?,
                target: c.u32()?,
            },
            StmtTag::AssignVar => DecodedStmt::AssignVar {
                source: c.operand()?,
                target: c.u32()?,
            },
            StmtTag::AssignVarOnce => DecodedStmt::AssignVarOnce {
                source: c.operand()?,
                target: c.u32()?,
            },
            StmtTag::BlockStmt => DecodedStmt::BlockStmt {
                blocks: c.block_seq()?,
            },
            StmtTag::BreakStmt => DecodedStmt::BreakStmt { index: c.u32()? },
            StmtTag::Call => {
                let kind = c.u8()?;
                let idx = c.u32()?;
                let func = match kind {
                    0 => FuncRef::Plan(idx),
                    1 => FuncRef::Builtin(idx),
                    other => return Err(PlanError::BadOperandTag(other)),
                };
                DecodedStmt::Call {
                    func,
                    args: c.operand_seq()?,
                    result: c.u32()?,
                }
            }
            StmtTag::CallDynamic => DecodedStmt::CallDynamic {
                args: c.operand_seq()?,
                path: c.operand_seq()?,
                result: c.u32()?,
            },
            StmtTag::Dot => DecodedStmt::Dot {
                source: c.operand()?,
                key: c.operand()?,
                target: c.u32()?,
            },
            StmtTag::Equal => DecodedStmt::Equal {
                a: c.operand()?,
                b: c.operand()?,
            },
            StmtTag::NotEqual => DecodedStmt::NotEqual {
                a: c.operand()?,
                b: c.operand()?,
            },
            StmtTag::IsArray => DecodedStmt::IsArray {
                source: c.operand()?,
            },
            StmtTag::IsObject => DecodedStmt::IsObject {
                source: c.operand()?,
            },
            StmtTag::IsDefined => DecodedStmt::IsDefined { source: c.u32()? },
            StmtTag::IsUndefined => DecodedStmt::IsUndefined { source: c.u32()? },
            StmtTag::Len => DecodedStmt::Len {
                source: c.operand()?,
                target: c.u32()?,
            },
            StmtTag::MakeArray => DecodedStmt::MakeArray {
                capacity: c.u32()?,
                target: c.u32()?,
            },
            StmtTag::MakeNull => DecodedStmt::MakeNull { target: c.u32()? },
            StmtTag::MakeNumberInt => DecodedStmt::MakeNumberInt {
                value: c.i64()?,
                target: c.u32()?,
            },
            StmtTag::MakeNumberRef => DecodedStmt::MakeNumberRef {
                index: c.u32()?,
                target: c.u32()?,
            },
            StmtTag::MakeObject => DecodedStmt::MakeObject { target: c.u32()? },
            StmtTag::MakeSet => DecodedStmt::MakeSet { target: c.u32()? },
            StmtTag::Not => DecodedStmt::Not { block: c.block()? },
            StmtTag::ObjectInsert => DecodedStmt::ObjectInsert {
                key: c.operand()?,
                value: c.operand()?,
                object: c.u32()?,
            },
            StmtTag::ObjectInsertOnce => DecodedStmt::ObjectInsertOnce {
                key: c.operand()?,
                value: c.operand()?,
                object: c.u32()?,
            },
            StmtTag::ObjectMerge => DecodedStmt::ObjectMerge {
                a: c.u32()?,
                b: c.u32()?,
                target: c.u32()?,
            },
            StmtTag::ResetLocal => DecodedStmt::ResetLocal { target: c.u32()? },
            StmtTag::ResultSetAdd => DecodedStmt::ResultSetAdd { value: c.u32()? },
            StmtTag::ReturnLocal => DecodedStmt::ReturnLocal { source: c.u32()? },
            StmtTag::Scan => DecodedStmt::Scan {
                source: c.u32()?,
                key: c.u32()?,
                value: c.u32()?,
                block: c.block()?,
            },
            StmtTag::SetAdd => DecodedStmt::SetAdd {
                value: c.operand()?,
                set: c.u32()?,
            },
            StmtTag::With => {
                let target = c.u32()?;
                let path = c.string_seq()?;
                DecodedStmt::With {
                    target,
                    path,
                    value: c.operand()?,
                    block: c.block()?,
                }
            }
        };
        if !c.at_end() {
            return Err(PlanError::StatementOverrun(self.tag));
        }
        Ok(stmt)
    }
}

/// Fully parsed statement. Nested blocks and operand lists stay lazy.
#[derive(Copy, Clone)]
pub enum DecodedStmt<'p> {
    Nop,
    ArrayAppend { value: Operand, array: Local },
    AssignInt { value: i64, target: Local },
    AssignVar { source: Operand, target: Local },
    AssignVarOnce { source: Operand, target: Local },
    BlockStmt { blocks: BlockSeq<'p> },
    BreakStmt { index: u32 },
    Call { func: FuncRef, args: OperandSeq<'p>, result: Local },
    CallDynamic { args: OperandSeq<'p>, path: OperandSeq<'p>, result: Local },
    Dot { source: Operand, key: Operand, target: Local },
    Equal { a: Operand, b: Operand },
    NotEqual { a: Operand, b: Operand },
    IsArray { source: Operand },
    IsObject { source: Operand },
    IsDefined { source: Local },
    IsUndefined { source: Local },
    Len { source: Operand, target: Local },
    MakeArray { capacity: u32, target: Local },
    MakeNull { target: Local },
    MakeNumberInt { value: i64, target: Local },
    MakeNumberRef { index: u32, target: Local },
    MakeObject { target: Local },
    MakeSet { target: Local },
    Not { block: Block<'p> },
    ObjectInsert { key: Operand, value: Operand, object: Local },
    ObjectInsertOnce { key: Operand, value: Operand, object: Local },
    ObjectMerge { a: Local, b: Local, target: Local },
    ResetLocal { target: Local },
    ResultSetAdd { value: Local },
    ReturnLocal { source: Local },
    Scan { source: Local, key: Local, value: Local, block: Block<'p> },
    SetAdd { value: Operand, set: Local },
    With { target: Local, path: StringSeq<'p>, value: Operand, block: Block<'p> },
}

/// Lazy operand list.
#[derive(Copy, Clone)]
pub struct OperandSeq<'p> {
    buf: &'p [u8],
    count: u32,
}

impl<'p> OperandSeq<'p> {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> OperandIter<'p> {
        OperandIter {
            cur: Cursor::new(self.buf),
            remaining: self.count,
        }
    }
}

pub struct OperandIter<'p> {
    cur: Cursor<'p>,
    remaining: u32,
}

impl Iterator for OperandIter<'_> {
    type Item = Result<Operand, PlanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.cur.operand())
    }
}

/// Lazy list of string-pool indices.
#[derive(Copy, Clone)]
pub struct StringSeq<'p> {
    buf: &'p [u8],
    count: u32,
}

impl<'p> StringSeq<'p> {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> StringSeqIter<'p> {
        StringSeqIter {
            cur: Cursor::new(self.buf),
            remaining: self.count,
        }
    }
}

pub struct StringSeqIter<'p> {
    cur: Cursor<'p>,
    remaining: u32,
}

impl Iterator for StringSeqIter<'_> {
    type Item = Result<u32, PlanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.cur.u32())
    }
}

/// Reading head over a byte slice.
struct Cursor<'p> {
    buf: &'p [u8],
    pos: usize,
}

impl<'p> Cursor<'p> {
    fn new(buf: &'p [u8]) -> Cursor<'p> {
        Cursor { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn u8(&mut self) -> Result<u8, PlanError> {
        let b = *self.buf.get(self.pos).ok_or(PlanError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn u64(&mut self) -> Result<u64, PlanError> {
        read_uvarint(self.buf, &mut self.pos).ok_or(PlanError::UnexpectedEof)
    }

    fn u32(&mut self) -> Result<u32, PlanError> {
        u32::try_from(self.u64()?).map_err(|_| PlanError::UnexpectedEof)
    }

    fn i64(&mut self) -> Result<i64, PlanError> {
        read_ivarint(self.buf, &mut self.pos).ok_or(PlanError::UnexpectedEof)
    }

    fn take(&mut self, n: usize) -> Result<&'p [u8], PlanError> {
        let end = self.pos.checked_add(n).ok_or(PlanError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(PlanError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn operand(&mut self) -> Result<Operand, PlanError> {
        match self.u8()? {
            0 => Ok(Operand::Local(self.u32()?)),
            1 => Ok(Operand::Bool(self.u8()? != 0)),
            2 => Ok(Operand::StringIndex(self.u32()?)),
            3 => Ok(Operand::Int(self.i64()?)),
            other => Err(PlanError::BadOperandTag(other)),
        }
    }

    fn operand_seq(&mut self) -> Result<OperandSeq<'p>, PlanError> {
        let count = self.u32()?;
        let start = self.pos;
        for _ in 0..count {
            self.operand()?;
        }
        Ok(OperandSeq {
            buf: &self.buf[start..self.pos],
            count,
        })
    }

    fn string_seq(&mut self) -> Result<StringSeq<'p>, PlanError> {
        let count = self.u32()?;
        let start = self.pos;
        for _ in 0..count {
            self.u32()?;
        }
        Ok(StringSeq {
            buf: &self.buf[start..self.pos],
            count,
        })
    }

    /// Read a statement: header varint, then its body as an opaque slice.
    fn stmt(&mut self) -> Result<Stmt<'p>, PlanError> {
        let header = self.u64()?;
        let raw_tag = (header & 0x3f) as u8;
        let size = usize::try_from(header >> 6).map_err(|_| PlanError::UnexpectedEof)?;
        let tag = StmtTag::from_u8(raw_tag).ok_or(PlanError::BadStatementTag(raw_tag))?;
        let body = self.take(size)?;
        Ok(Stmt { tag, body })
    }

    /// Read a block: statement count, then the statements, skipped flatly by
    /// their declared sizes.
    fn block(&mut self) -> Result<Block<'p>, PlanError> {
        let count = self.u32()?;
        let start = self.pos;
        for _ in 0..count {
            self.stmt()?;
        }
        Ok(Block {
            buf: &self.buf[start..self.pos],
            count,
        })
    }

    fn block_seq(&mut self) -> Result<BlockSeq<'p>, PlanError> {
        let count = self.u32()?;
        let start = self.pos;
        for _ in 0..count {
            self.block()?;
        }
        Ok(BlockSeq {
            buf: &self.buf[start..self.pos],
            count,
        })
    }

    /// Like [`Cursor::block_seq`] but records the absolute span, for plan
    /// regions referenced after decoding.
    fn block_region(&mut self) -> Result<Region, PlanError> {
        let count = self.u32()?;
        let start = self.pos;
        for _ in 0..count {
            self.block()?;
        }
        Ok(Region {
            start,
            end: self.pos,
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::builder::{BlockBuilder, PlanBuilder};
    use super::*;

    #[test]
    fn test_decode_round_trip() {
        let mut pb = PlanBuilder::new();
        let key = pb.string("key");
        let mut blk = BlockBuilder::new();
        blk.make_object(2);
        blk.object_insert(Operand::StringIndex(key), Operand::Int(1), 2);
        blk.result_set_add(2);
        pb.add_entrypoint("main", vec![blk]);

        let bytes = pb.finish();
        let plan = Plan::decode(bytes).unwrap();
        assert_eq!(plan.num_functions(), 0);

        let entry = plan.entrypoint(Some("main")).unwrap();
        assert_eq!(entry.blocks.len(), 1);
        let block = entry.blocks.iter().next().unwrap().unwrap();
        assert_eq!(block.len(), 3);

        let tags: Vec<StmtTag> = block
            .iter()
            .map(|s| s.unwrap().ty().0)
            .collect();
        assert_eq!(
            tags,
            vec![StmtTag::MakeObject, StmtTag::ObjectInsert, StmtTag::ResultSetAdd]
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert_eq!(
            Plan::decode(&b"NOPE\x01\x00\x00\x00"[..]).unwrap_err(),
            PlanError::BadMagic
        );
    }

    #[test]
    fn test_unknown_entrypoint() {
        let mut pb = PlanBuilder::new();
        pb.add_entrypoint("main", vec![BlockBuilder::new()]);
        let plan = Plan::decode(pb.finish()).unwrap();
        assert!(matches!(
            plan.entrypoint(Some("absent")),
            Err(PlanError::UnknownEntrypoint(_))
        ));
    }

    #[test]
    fn test_string_index_validated() {
        let mut pb = PlanBuilder::new();
        let mut blk = BlockBuilder::new();
        // Index 7 is never interned.
        blk.assign_var(Operand::StringIndex(7), 2);
        pb.add_entrypoint("main", vec![blk]);
        assert_eq!(
            Plan::decode(pb.finish()).unwrap_err(),
            PlanError::StringIndexOutOfRange(7)
        );
    }

    #[test]
    fn test_function_paths_indexed() {
        let mut pb = PlanBuilder::new();
        let f = pb.declare_function(&["pkg", "allow"], 2, 2);
        pb.set_function_blocks(f, vec![BlockBuilder::new()]);
        pb.add_entrypoint("pkg/allow", vec![BlockBuilder::new()]);
        let plan = Plan::decode(pb.finish()).unwrap();
        let path = vec!["pkg".to_string(), "allow".to_string()];
        assert_eq!(plan.func_by_path(&path), Some(0));
        assert_eq!(plan.func_by_path(&path[..1].to_vec()), None);
    }

    #[test]
    fn test_max_local_tracked() {
        let mut pb = PlanBuilder::new();
        let mut blk = BlockBuilder::new();
        blk.make_null(41);
        pb.add_entrypoint("main", vec![blk]);
        let plan = Plan::decode(pb.finish()).unwrap();
        assert_eq!(plan.max_local(), 41);
    }
}
