//! Functions module: the named-function tables consulted by the compiler.
//!
//! A function call in an expression tree resolves either to a builtin, run
//! through the generic [`Instruction::Function`], or to a dedicated
//! instruction. Both tables are generated by the macros below.

use crate::ir::{Builtin, Instruction};
use std::fmt;

/// Accepted argument counts of a named function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    OneOf(usize, usize),
    Even,
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::OneOf(a, b) => n == a || n == b,
            Arity::Even => n % 2 == 0,
        }
    }
}

/// Entry of the builtin table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinFn {
    pub builtin: Builtin,
    pub arity: Arity,
    /// Aggregate builtins also receive the accumulator.
    pub aggregate: bool,
}

/// Entry of the instruction table.
#[derive(Debug, Clone)]
pub struct InstructionFn {
    pub instruction: Instruction,
    pub arity: usize,
    /// Aggregate instructions read the accumulator before their arguments.
    pub aggregate: bool,
}

macro_rules! builtin_functions {
    (@agg aggregate) => { true };
    (@agg) => { false };
    ($( $name:literal => $builtin:ident, $arity:expr $(, $agg:ident)? );* $(;)?) => {
        /// Looks up a builtin by the name used in expression trees.
        pub fn lookup_builtin(name: &str) -> Option<BuiltinFn> {
            match name {
                $(
                    $name => Some(BuiltinFn {
                        builtin: Builtin::$builtin,
                        arity: $arity,
                        aggregate: builtin_functions!(@agg $($agg)?),
                    }),
                )*
                _ => None,
            }
        }

        impl Builtin {
            pub fn name(self) -> &'static str {
                match self {
                    $( Builtin::$builtin => $name, )*
                }
            }
        }
    };
}

macro_rules! instruction_functions {
    (@agg aggregate) => { true };
    (@agg) => { false };
    ($( $name:literal => $instr:ident / $arity:literal $(, $agg:ident)? );* $(;)?) => {
        /// Looks up a function implemented by a dedicated instruction.
        pub fn lookup_instruction(name: &str) -> Option<InstructionFn> {
            match name {
                $(
                    $name => Some(InstructionFn {
                        instruction: Instruction::$instr,
                        arity: $arity,
                        aggregate: instruction_functions!(@agg $($agg)?),
                    }),
                )*
                _ => None,
            }
        }
    };
}

builtin_functions! {
    "split" => Split, Arity::Exact(2);
    "regexCompile" => RegexCompile, Arity::Exact(2);
    "regexMatch" => RegexMatch, Arity::Exact(2);
    "dropFields" => DropFields, Arity::AtLeast(1);
    "newObj" => NewObj, Arity::Even;
    "ksToString" => KsToString, Arity::Exact(1);
    "ks" => NewKs, Arity::AtLeast(3);
    "abs" => Abs, Arity::Exact(1);
    "ceil" => Ceil, Arity::Exact(1);
    "floor" => Floor, Arity::Exact(1);
    "trunc" => Trunc, Arity::Exact(1);
    "exp" => Exp, Arity::Exact(1);
    "ln" => Ln, Arity::Exact(1);
    "log10" => Log10, Arity::Exact(1);
    "sqrt" => Sqrt, Arity::Exact(1);
    "addToArray" => AddToArray, Arity::Exact(1), aggregate;
    "addToSet" => AddToSet, Arity::Exact(1), aggregate;
    "doubleDoubleSum" => DoubleDoubleSum, Arity::AtLeast(1);
    "bitTestZero" => BitTestZero, Arity::Exact(2);
    "bitTestMask" => BitTestMask, Arity::Exact(2);
    "bitTestPosition" => BitTestPosition, Arity::Exact(3);
    "toUpper" => ToUpper, Arity::Exact(1);
    "toLower" => ToLower, Arity::Exact(1);
    "coerceToString" => CoerceToString, Arity::Exact(1);
    "acos" => Acos, Arity::Exact(1);
    "acosh" => Acosh, Arity::Exact(1);
    "asin" => Asin, Arity::Exact(1);
    "asinh" => Asinh, Arity::Exact(1);
    "atan" => Atan, Arity::Exact(1);
    "atanh" => Atanh, Arity::Exact(1);
    "atan2" => Atan2, Arity::Exact(2);
    "cos" => Cos, Arity::Exact(1);
    "cosh" => Cosh, Arity::Exact(1);
    "degreesToRadians" => DegreesToRadians, Arity::Exact(1);
    "radiansToDegrees" => RadiansToDegrees, Arity::Exact(1);
    "sin" => Sin, Arity::Exact(1);
    "sinh" => Sinh, Arity::Exact(1);
    "tan" => Tan, Arity::Exact(1);
    "tanh" => Tanh, Arity::Exact(1);
    "concat" => Concat, Arity::AtLeast(1);
    "isMember" => IsMember, Arity::Exact(2);
    "indexOfBytes" => IndexOfBytes, Arity::OneOf(3, 4);
    "indexOfCP" => IndexOfCP, Arity::OneOf(3, 4);
    "isTimezone" => IsTimezone, Arity::Exact(2);
    "dateToParts" => DateToParts, Arity::OneOf(3, 4);
    "isoDateToParts" => IsoDateToParts, Arity::OneOf(3, 4);
}

instruction_functions! {
    "getField" => GetField / 2;
    "getElement" => GetElement / 2;
    "fillEmpty" => FillEmpty / 2;
    "exists" => Exists / 1;
    "isNull" => IsNull / 1;
    "isObject" => IsObject / 1;
    "isArray" => IsArray / 1;
    "isString" => IsString / 1;
    "isNumber" => IsNumber / 1;
    "isBinData" => IsBinData / 1;
    "isDate" => IsDate / 1;
    "isNaN" => IsNaN / 1;
    "mod" => Mod / 2;
    "sum" => AggSum / 1, aggregate;
    "min" => AggMin / 1, aggregate;
    "max" => AggMax / 1, aggregate;
    "first" => AggFirst / 1, aggregate;
    "last" => AggLast / 1, aggregate;
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
