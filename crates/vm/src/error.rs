//! Evaluation errors
//!
//! Two families: [`EvalError`] aborts an evaluation and reaches the caller;
//! [`BuiltinFailure`] records a non-fatal builtin error: the offending call
//! yields undefined, evaluation continues, and the caller sees the collected
//! failures beside the result.

use crate::plan::PlanError;
use std::fmt;

#[derive(Debug)]
pub enum EvalError {
    /// `assignVarOnce` target already held a different value.
    VarAssignConflict,
    /// `objectInsertOnce` key already mapped to a different value, or an
    /// `objectMerge` operand was not an object.
    ObjectInsertConflict,
    /// A dynamic call resolved into the data document but carried call
    /// arguments; the payload is the offending path.
    FunctionCallToData(String),
    /// A builtin demanded the evaluation stop.
    Halt(String),
    /// The cancellation token fired.
    Cancelled,
    /// The configured instruction budget ran out.
    InstructionLimitExceeded,
    /// The plan failed to decode or referenced something out of range.
    InvalidPlan(PlanError),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::VarAssignConflict => write!(f, "var assignment conflict"),
            EvalError::ObjectInsertConflict => write!(f, "object insert conflict"),
            EvalError::FunctionCallToData(path) => {
                write!(f, "called function at data path: {path}")
            }
            EvalError::Halt(msg) => write!(f, "evaluation halted: {msg}"),
            EvalError::Cancelled => write!(f, "evaluation cancelled"),
            EvalError::InstructionLimitExceeded => write!(f, "instruction limit exceeded"),
            EvalError::InvalidPlan(e) => write!(f, "invalid plan: {e}"),
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvalError::InvalidPlan(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PlanError> for EvalError {
    fn from(e: PlanError) -> Self {
        EvalError::InvalidPlan(e)
    }
}

/// A recorded non-fatal builtin error.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BuiltinFailure {
    /// Builtin name as it appears in the plan.
    pub builtin: String,
    pub message: String,
}

impl fmt::Display for BuiltinFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.builtin, self.message)
    }
}

/// Error returned by a builtin implementation.
#[derive(Debug)]
pub enum BuiltinError {
    /// Fatal: aborts the evaluation as [`EvalError::Halt`].
    Halt(String),
    /// Non-fatal: recorded as a [`BuiltinFailure`], the call yields undefined.
    Message(String),
}

impl BuiltinError {
    pub fn msg(m: impl Into<String>) -> BuiltinError {
        BuiltinError::Message(m.into())
    }
}

impl fmt::Display for BuiltinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinError::Halt(m) => write!(f, "halt: {m}"),
            BuiltinError::Message(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for BuiltinError {}
