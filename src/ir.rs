//! Intermediate Representation (IR) for the expression VM.
//!
//! This module defines the byte-code instructions and the [`CodeFragment`]
//! container that tracks the static stack effect of a code sequence and the
//! local-variable offsets that still need fixing up.

use crate::slot::{FrameId, SlotAccessor};
use crate::types::{TypeTag, Value};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Native functions reachable through the generic [`Instruction::Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Builtin {
    Split,
    RegexCompile,
    RegexMatch,
    DropFields,
    NewObj,
    KsToString,
    NewKs,
    Abs,
    Ceil,
    Floor,
    Trunc,
    Exp,
    Ln,
    Log10,
    Sqrt,
    AddToArray,
    AddToSet,
    DoubleDoubleSum,
    BitTestZero,
    BitTestMask,
    BitTestPosition,
    ToUpper,
    ToLower,
    CoerceToString,
    Acos,
    Acosh,
    Asin,
    Asinh,
    Atan,
    Atanh,
    Atan2,
    Cos,
    Cosh,
    DegreesToRadians,
    RadiansToDegrees,
    Sin,
    Sinh,
    Tan,
    Tanh,
    Concat,
    IsMember,
    IndexOfBytes,
    IndexOfCP,
    IsTimezone,
    DateToParts,
    IsoDateToParts,
}

/// A single VM instruction.
///
/// Jump offsets count instructions and are relative to the instruction that
/// follows the jump.
#[derive(Clone)]
#[non_exhaustive]
pub enum Instruction {
    PushConstVal(Value),
    PushAccessVal(Arc<dyn SlotAccessor>),
    PushMoveVal(Arc<dyn SlotAccessor>),
    /// Push a view of the stack entry `offset` positions below the top.
    PushLocalVal(i32),
    Pop,
    Swap,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Negate,
    NumConvert(TypeTag),

    LogicNot,

    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    Neq,
    Cmp3w,

    FillEmpty,
    GetField,
    GetElement,

    AggSum,
    AggMin,
    AggMax,
    AggFirst,
    AggLast,

    Exists,
    IsNull,
    IsObject,
    IsArray,
    IsString,
    IsNumber,
    IsBinData,
    IsDate,
    IsNaN,
    TypeMatch(u32),

    Function { builtin: Builtin, arity: usize },

    Jmp(i32),
    JmpTrue(i32),
    JmpNothing(i32),

    /// Pops a message and a numeric code and aborts execution.
    Fail,
}

impl Instruction {
    /// Net change of the operand stack depth caused by this instruction.
    pub fn stack_offset(&self) -> i32 {
        use Instruction::*;
        match self {
            PushConstVal(_) | PushAccessVal(_) | PushMoveVal(_) | PushLocalVal(_) => 1,
            Pop => -1,
            Swap => 0,
            Add | Sub | Mul | Div | Mod => -1,
            Negate | NumConvert(_) | LogicNot => 0,
            Less | LessEq | Greater | GreaterEq | Eq | Neq | Cmp3w => -1,
            FillEmpty | GetField | GetElement => -1,
            AggSum | AggMin | AggMax | AggFirst | AggLast => -1,
            Exists | IsNull | IsObject | IsArray | IsString | IsNumber | IsBinData | IsDate
            | IsNaN | TypeMatch(_) => 0,
            Function { arity, .. } => 1 - *arity as i32,
            Jmp(_) | JmpNothing(_) => 0,
            JmpTrue(_) => -1,
            Fail => -1,
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            PushConstVal(v) => write!(f, "pushConstVal({})", v),
            PushAccessVal(a) => write!(f, "pushAccessVal({:p})", Arc::as_ptr(a)),
            PushMoveVal(a) => write!(f, "pushMoveVal({:p})", Arc::as_ptr(a)),
            PushLocalVal(offset) => write!(f, "pushLocalVal({})", offset),
            NumConvert(tag) => write!(f, "numConvert({})", tag),
            TypeMatch(mask) => write!(f, "typeMatch({:#x})", mask),
            Function { builtin, arity } => write!(f, "function({}, {})", builtin, arity),
            Jmp(offset) => write!(f, "jmp({})", offset),
            JmpTrue(offset) => write!(f, "jmpTrue({})", offset),
            JmpNothing(offset) => write!(f, "jmpNothing({})", offset),
            other => {
                let name = match other {
                    Pop => "pop",
                    Swap => "swap",
                    Add => "add",
                    Sub => "sub",
                    Mul => "mul",
                    Div => "div",
                    Mod => "mod",
                    Negate => "negate",
                    LogicNot => "logicNot",
                    Less => "less",
                    LessEq => "lessEq",
                    Greater => "greater",
                    GreaterEq => "greaterEq",
                    Eq => "eq",
                    Neq => "neq",
                    Cmp3w => "cmp3w",
                    FillEmpty => "fillEmpty",
                    GetField => "getField",
                    GetElement => "getElement",
                    AggSum => "aggSum",
                    AggMin => "aggMin",
                    AggMax => "aggMax",
                    AggFirst => "aggFirst",
                    AggLast => "aggLast",
                    Exists => "exists",
                    IsNull => "isNull",
                    IsObject => "isObject",
                    IsArray => "isArray",
                    IsString => "isString",
                    IsNumber => "isNumber",
                    IsBinData => "isBinData",
                    IsDate => "isDate",
                    IsNaN => "isNaN",
                    _ => "fail",
                };
                f.write_str(name)
            }
        }
    }
}

/// Jump flavours understood by [`CodeFragment::append_jump_over`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Always,
    /// Pops the top value and jumps when it is Boolean `true`.
    IfTrue,
    /// Jumps when the top value is `Nothing`, leaving it in place.
    IfNothing,
}

/// A `PushLocalVal` whose offset is relative to a frame not yet closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixUp {
    pub frame: FrameId,
    pub index: usize,
}

/// An append-only instruction buffer with its static stack effect.
#[derive(Debug, Clone, Default)]
pub struct CodeFragment {
    instrs: Vec<Instruction>,
    stack_size: i32,
    fixups: Vec<FixUp>,
}

impl CodeFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instrs(&self) -> &[Instruction] {
        &self.instrs
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Net stack depth change when executed from an empty stack.
    pub fn stack_size(&self) -> i32 {
        self.stack_size
    }

    pub fn fixups(&self) -> &[FixUp] {
        &self.fixups
    }

    /// Appends a single instruction and accounts for its stack effect.
    pub fn append_instr(&mut self, instr: Instruction) {
        self.stack_size += instr.stack_offset();
        self.instrs.push(instr);
    }

    /// Splices `code` after this fragment. Pending local offsets inside
    /// `code` are shifted by the values this fragment leaves on the stack.
    pub fn append(&mut self, mut code: CodeFragment) {
        code.fixup(self.stack_size);
        self.copy_code_and_fixups(code.instrs, code.fixups);
        self.stack_size += code.stack_size;
    }

    /// Splices two alternative branches of which exactly one executes at run
    /// time. Both must have the same stack effect.
    pub fn append_branches(&mut self, mut lhs: CodeFragment, mut rhs: CodeFragment) -> Result<()> {
        if lhs.stack_size != rhs.stack_size {
            return Err(Error::UnbalancedBranches {
                then_size: lhs.stack_size,
                else_size: rhs.stack_size,
            });
        }
        lhs.fixup(self.stack_size);
        rhs.fixup(self.stack_size);
        self.stack_size += lhs.stack_size;
        self.copy_code_and_fixups(lhs.instrs, lhs.fixups);
        self.copy_code_and_fixups(rhs.instrs, rhs.fixups);
        Ok(())
    }

    fn copy_code_and_fixups(&mut self, instrs: Vec<Instruction>, fixups: Vec<FixUp>) {
        let base = self.instrs.len();
        self.fixups
            .extend(fixups.into_iter().map(|f| FixUp { frame: f.frame, index: f.index + base }));
        self.instrs.extend(instrs);
    }

    fn fixup(&mut self, offset: i32) {
        if offset == 0 {
            return;
        }
        for f in &self.fixups {
            if let Some(Instruction::PushLocalVal(slot)) = self.instrs.get_mut(f.index) {
                *slot += offset;
            }
        }
    }

    /// Drops the pending fix-ups of a closed frame.
    pub fn remove_fixup(&mut self, frame: FrameId) {
        self.fixups.retain(|f| f.frame != frame);
    }

    pub fn append_const_val(&mut self, value: Value) {
        self.append_instr(Instruction::PushConstVal(value));
    }

    pub fn append_access_val(&mut self, accessor: Arc<dyn SlotAccessor>) {
        self.append_instr(Instruction::PushAccessVal(accessor));
    }

    pub fn append_move_val(&mut self, accessor: Arc<dyn SlotAccessor>) {
        self.append_instr(Instruction::PushMoveVal(accessor));
    }

    /// Pushes local `offset` of `frame`; the offset is shifted as the
    /// fragment is spliced into enclosing code.
    pub fn append_local_val(&mut self, frame: FrameId, offset: i32) {
        self.fixups.push(FixUp { frame, index: self.instrs.len() });
        self.append_instr(Instruction::PushLocalVal(offset));
    }

    pub fn append_pop(&mut self) {
        self.append_instr(Instruction::Pop);
    }

    pub fn append_swap(&mut self) {
        self.append_instr(Instruction::Swap);
    }

    pub fn append_numeric_convert(&mut self, target: TypeTag) {
        self.append_instr(Instruction::NumConvert(target));
    }

    pub fn append_type_match(&mut self, mask: u32) {
        self.append_instr(Instruction::TypeMatch(mask));
    }

    pub fn append_function(&mut self, builtin: Builtin, arity: usize) {
        self.append_instr(Instruction::Function { builtin, arity });
    }

    pub fn append_fail(&mut self) {
        self.append_instr(Instruction::Fail);
    }

    pub fn append_jump(&mut self, kind: JumpKind, offset: i32) {
        self.append_instr(match kind {
            JumpKind::Always => Instruction::Jmp(offset),
            JumpKind::IfTrue => Instruction::JmpTrue(offset),
            JumpKind::IfNothing => Instruction::JmpNothing(offset),
        });
    }

    /// Emits a jump whose target is the instruction right after `skipped`,
    /// assuming `skipped` is appended immediately after the jump.
    pub fn append_jump_over(&mut self, kind: JumpKind, skipped: &CodeFragment) {
        self.append_jump(kind, skipped.len() as i32);
    }
}
