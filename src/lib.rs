//! Docexpr: an expression compiler and byte-code VM for document queries.
//!
//! Expression trees built by a query translator are compiled into flat
//! [`CodeFragment`]s and executed by a stack based [`Vm`] against per-row
//! slot accessors and a shared [`RuntimeEnvironment`].
//!
//! # Architecture
//! - Tagged value model (`Value`, `TypeTag`) with explicit copy/release/compare
//! - Code fragments with static stack-depth tracking and local-frame fix-ups
//! - Expression nodes compiled with jump based short-circuit logic
//! - Compile context resolving slots through correlated bindings and the environment
//! - Runtime environment with copy-on-fork semantics for parallel branches
//! - Byte-code interpreter with builtin and instruction-table functions

mod arith;
mod builtins;
mod compiler;
mod context;
mod datetime;
mod env;
mod expr;
mod filter;
mod functions;
mod ir;
mod slot;
mod types;
mod vm;

pub use arith::*;
pub use compiler::*;
pub use context::*;
pub use datetime::*;
pub use env::*;
pub use expr::*;
pub use filter::*;
pub use functions::*;
pub use ir::*;
pub use slot::*;
pub use types::*;
pub use vm::*;

use thiserror::Error;

/// Unified error type for compilation and execution.
///
/// Every variant carries a stable numeric code, see [`Error::code`].
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("the function '{name}' has wrong number of arguments: {arity}")]
    BuiltinArity { name: String, arity: usize },
    #[error("aggregate function '{name}' called outside of an aggregate expression")]
    BuiltinAggregateContext { name: String },
    #[error("the instruction '{name}' has wrong number of arguments: {arity}")]
    InstructionArity { name: String, arity: usize },
    #[error("aggregate instruction '{name}' called outside of an aggregate expression")]
    InstructionAggregateContext { name: String },
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("if/then/else branches leave different stack sizes: {then_size} vs {else_size}")]
    UnbalancedBranches { then_size: i32, else_size: i32 },
    #[error("local variable access outside of its frame at offset {0}")]
    LocalOutOfFrame(i32),
    #[error("byte-code left {0} values on the stack, expected exactly one")]
    StackImbalance(usize),
    #[error("slot already registered: {0}")]
    SlotAlreadyRegistered(String),
    #[error("undefined slot name: {0}")]
    SlotNotRegistered(String),
    #[error("undefined slot id: {0}")]
    UndefinedSlot(u64),
    #[error("undefined slot accessor: {0}")]
    UndefinedAccessor(u64),
    #[error("cannot reset slot {0} of an environment shared by parallel branches")]
    ParallelReset(u64),
    #[error("can't $divide by zero")]
    DivideByZero,
    #[error("can't $mod by zero")]
    ModByZero,
    #[error("date overflow in arithmetic")]
    DateOverflow,
    #[error("only one date allowed in an $add expression")]
    MultipleDates,
    #[error("numeric conversion of {value} to {target} loses precision")]
    LossyConversion { value: String, target: String },
    #[error("invalid bit test arguments: {0}")]
    InvalidBitTest(String),
    #[error("unsupported key string component type: {0}")]
    UnsupportedKeyPart(String),
    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),
    #[error("{message}")]
    Fail { code: i64, message: String },
}

impl Error {
    /// Stable machine checkable code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Error::BuiltinArity { .. } => 4822843,
            Error::BuiltinAggregateContext { .. } => 4822844,
            Error::InstructionArity { .. } => 4822845,
            Error::InstructionAggregateContext { .. } => 4822846,
            Error::UnknownFunction(_) => 4822847,
            Error::UnbalancedBranches { .. } => 4822848,
            Error::LocalOutOfFrame(_) => 4822849,
            Error::StackImbalance(_) => 4822801,
            Error::SlotAlreadyRegistered(_) => 4946303,
            Error::SlotNotRegistered(_) => 4946305,
            Error::UndefinedSlot(_) => 4946300,
            Error::UndefinedAccessor(_) => 4946301,
            Error::ParallelReset(_) => 4946304,
            Error::DivideByZero => 4848401,
            Error::ModByZero => 4848403,
            Error::DateOverflow => 15,
            Error::MultipleDates => 4848404,
            Error::LossyConversion { .. } => 4822850,
            Error::InvalidBitTest(_) => 4822851,
            Error::UnsupportedKeyPart(_) => 4822802,
            Error::InvalidRegex(_) => 4822852,
            Error::Fail { code, .. } => *code,
        }
    }

    /// True for errors raised while compiling an expression tree.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Error::BuiltinArity { .. }
                | Error::BuiltinAggregateContext { .. }
                | Error::InstructionArity { .. }
                | Error::InstructionAggregateContext { .. }
                | Error::UnknownFunction(_)
                | Error::UnbalancedBranches { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::BuiltinArity { name: "split".into(), arity: 1 }.code(), 4822843);
        assert_eq!(Error::UnknownFunction("nope".into()).code(), 4822847);
        assert_eq!(Error::StackImbalance(2).code(), 4822801);
        assert_eq!(Error::DivideByZero.code(), 4848401);
        assert_eq!(Error::UnsupportedKeyPart("array".into()).code(), 4822802);
        assert_eq!(Error::Fail { code: 77, message: "boom".into() }.code(), 77);
    }

    #[test]
    fn test_error_display() {
        let err = Error::Fail { code: 1, message: "custom failure".into() };
        assert_eq!(err.to_string(), "custom failure");
        let err = Error::SlotAlreadyRegistered("timeZoneDB".into());
        assert_eq!(err.to_string(), "slot already registered: timeZoneDB");
    }

    #[test]
    fn test_compile_error_classification() {
        assert!(Error::UnknownFunction("x".into()).is_compile_error());
        assert!(!Error::DivideByZero.is_compile_error());
    }
}
