//! Expression (AST) module: the expression tree consumed by the compiler.
//!
//! Nodes own their children exclusively. [`EExpression::debug_print`] renders
//! a node as a list of [`Block`]s that [`DebugPrinter`] joins into text.

use crate::slot::{FrameId, SlotId};
use crate::types::{copy_value, TypeTag, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EExpression {
    Constant(Value),
    /// A named slot, or position `slot` of local frame `frame`.
    Variable {
        slot: SlotId,
        frame: Option<FrameId>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<EExpression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<EExpression>,
        rhs: Box<EExpression>,
    },
    Function {
        name: String,
        args: Vec<EExpression>,
    },
    If {
        cond: Box<EExpression>,
        then_branch: Box<EExpression>,
        else_branch: Box<EExpression>,
    },
    LocalBind {
        frame: FrameId,
        binds: Vec<EExpression>,
        body: Box<EExpression>,
    },
    Fail {
        code: i64,
        message: String,
    },
    NumericConvert {
        operand: Box<EExpression>,
        target: TypeTag,
    },
    TypeMatch {
        operand: Box<EExpression>,
        mask: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum UnaryOp {
    Negate,
    LogicNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    Neq,
    Cmp3w,
    LogicAnd,
    LogicOr,
    FillEmpty,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Negate => "-",
            UnaryOp::LogicNot => "!",
        }
    }
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Cmp3w => "<=>",
            BinaryOp::LogicAnd => "&&",
            BinaryOp::LogicOr => "||",
            BinaryOp::FillEmpty => "?:",
        }
    }
}

impl EExpression {
    pub fn constant(value: impl Into<Value>) -> Self {
        EExpression::Constant(value.into())
    }

    pub fn nothing() -> Self {
        EExpression::Constant(Value::Nothing)
    }

    pub fn slot(slot: SlotId) -> Self {
        EExpression::Variable { slot, frame: None }
    }

    /// Reference to the `position`-th binding of local frame `frame`.
    pub fn local(frame: FrameId, position: SlotId) -> Self {
        EExpression::Variable { slot: position, frame: Some(frame) }
    }

    pub fn unary(op: UnaryOp, operand: EExpression) -> Self {
        EExpression::Unary { op, operand: Box::new(operand) }
    }

    pub fn binary(op: BinaryOp, lhs: EExpression, rhs: EExpression) -> Self {
        EExpression::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn function(name: impl Into<String>, args: Vec<EExpression>) -> Self {
        EExpression::Function { name: name.into(), args }
    }

    pub fn if_then_else(cond: EExpression, then_branch: EExpression, else_branch: EExpression) -> Self {
        EExpression::If {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    pub fn local_bind(frame: FrameId, binds: Vec<EExpression>, body: EExpression) -> Self {
        EExpression::LocalBind { frame, binds, body: Box::new(body) }
    }

    pub fn fail(code: i64, message: impl Into<String>) -> Self {
        EExpression::Fail { code, message: message.into() }
    }

    pub fn numeric_convert(operand: EExpression, target: TypeTag) -> Self {
        EExpression::NumericConvert { operand: Box::new(operand), target }
    }

    pub fn type_match(operand: EExpression, mask: u32) -> Self {
        EExpression::TypeMatch { operand: Box::new(operand), mask }
    }

    /// Direct children in evaluation-independent declaration order.
    pub fn children(&self) -> Vec<&EExpression> {
        match self {
            EExpression::Constant(_) | EExpression::Variable { .. } | EExpression::Fail { .. } => vec![],
            EExpression::Unary { operand, .. }
            | EExpression::NumericConvert { operand, .. }
            | EExpression::TypeMatch { operand, .. } => vec![operand],
            EExpression::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            EExpression::Function { args, .. } => args.iter().collect(),
            EExpression::If { cond, then_branch, else_branch } => vec![cond, then_branch, else_branch],
            EExpression::LocalBind { binds, body, .. } => {
                binds.iter().chain(std::iter::once(body.as_ref())).collect()
            }
        }
    }

    pub fn debug_print(&self) -> Vec<Block> {
        let mut ret = Vec::new();
        match self {
            EExpression::Constant(v) => ret.push(Block::Token(v.to_string())),
            EExpression::Variable { slot, frame: Some(frame) } => ret.push(Block::local(*frame, *slot)),
            EExpression::Variable { slot, frame: None } => ret.push(Block::slot(*slot)),
            EExpression::Unary { op, operand } => {
                ret.push(Block::Prefix(op.symbol()));
                ret.extend(operand.debug_print());
            }
            EExpression::Binary { op, lhs, rhs } => {
                ret.extend(lhs.debug_print());
                ret.push(Block::Token(op.symbol().to_string()));
                ret.extend(rhs.debug_print());
            }
            EExpression::Function { name, args } => {
                ret.push(Block::Keyword(name.clone()));
                push_call_args(&mut ret, args.iter());
            }
            EExpression::If { cond, then_branch, else_branch } => {
                ret.push(Block::Keyword("if".into()));
                push_call_args(&mut ret, [cond.as_ref(), then_branch.as_ref(), else_branch.as_ref()].into_iter());
            }
            EExpression::LocalBind { frame, binds, body } => {
                ret.push(Block::Token("let".into()));
                ret.push(Block::Open("["));
                for (idx, bind) in binds.iter().enumerate() {
                    if idx != 0 {
                        ret.push(Block::Comma);
                    }
                    ret.push(Block::local(*frame, idx as SlotId));
                    ret.push(Block::Token("=".into()));
                    ret.extend(bind.debug_print());
                }
                ret.push(Block::Close("]"));
                ret.extend(body.debug_print());
            }
            EExpression::Fail { code, message } => {
                ret.push(Block::Keyword("fail".into()));
                ret.push(Block::Open("("));
                ret.push(Block::Token(code.to_string()));
                ret.push(Block::Comma);
                ret.push(Block::Token(message.clone()));
                ret.push(Block::Close(")"));
            }
            EExpression::NumericConvert { operand, target } => {
                ret.push(Block::Keyword("convert".into()));
                ret.push(Block::Open("("));
                ret.extend(operand.debug_print());
                ret.push(Block::Comma);
                ret.push(Block::Token(convert_target_name(*target).to_string()));
                ret.push(Block::Close(")"));
            }
            EExpression::TypeMatch { operand, mask } => {
                ret.push(Block::Keyword("typeMatch".into()));
                ret.push(Block::Open("("));
                ret.extend(operand.debug_print());
                ret.push(Block::Comma);
                ret.push(Block::Token(format!("{:#x}", mask)));
                ret.push(Block::Close(")"));
            }
        }
        ret
    }
}

fn push_call_args<'a>(ret: &mut Vec<Block>, args: impl Iterator<Item = &'a EExpression>) {
    ret.push(Block::Open("("));
    for (idx, arg) in args.enumerate() {
        if idx != 0 {
            ret.push(Block::Comma);
        }
        ret.extend(arg.debug_print());
    }
    ret.push(Block::Close(")"));
}

fn convert_target_name(target: TypeTag) -> &'static str {
    match target {
        TypeTag::NumberInt32 => "int32",
        TypeTag::NumberInt64 => "int64",
        TypeTag::NumberDouble => "double",
        TypeTag::NumberDecimal => "decimal",
        _ => "unknown",
    }
}

/// Cloning deep-copies constants so the copy never shares heap payloads
/// with the original tree.
impl Clone for EExpression {
    fn clone(&self) -> Self {
        match self {
            EExpression::Constant(v) => EExpression::Constant(copy_value(v)),
            EExpression::Variable { slot, frame } => EExpression::Variable { slot: *slot, frame: *frame },
            EExpression::Unary { op, operand } => EExpression::Unary { op: *op, operand: operand.clone() },
            EExpression::Binary { op, lhs, rhs } => {
                EExpression::Binary { op: *op, lhs: lhs.clone(), rhs: rhs.clone() }
            }
            EExpression::Function { name, args } => {
                EExpression::Function { name: name.clone(), args: args.clone() }
            }
            EExpression::If { cond, then_branch, else_branch } => EExpression::If {
                cond: cond.clone(),
                then_branch: then_branch.clone(),
                else_branch: else_branch.clone(),
            },
            EExpression::LocalBind { frame, binds, body } => {
                EExpression::LocalBind { frame: *frame, binds: binds.clone(), body: body.clone() }
            }
            EExpression::Fail { code, message } => EExpression::Fail { code: *code, message: message.clone() },
            EExpression::NumericConvert { operand, target } => {
                EExpression::NumericConvert { operand: operand.clone(), target: *target }
            }
            EExpression::TypeMatch { operand, mask } => {
                EExpression::TypeMatch { operand: operand.clone(), mask: *mask }
            }
        }
    }
}

impl fmt::Display for EExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&DebugPrinter::print(&self.debug_print()))
    }
}

/// A unit of debug output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Token(String),
    /// Function-like keyword, joined to the following `(`.
    Keyword(String),
    /// Prefix operator, joined to its operand.
    Prefix(&'static str),
    Open(&'static str),
    Close(&'static str),
    Comma,
}

impl Block {
    pub fn slot(slot: SlotId) -> Block {
        Block::Token(format!("s{}", slot))
    }

    pub fn local(frame: FrameId, position: SlotId) -> Block {
        Block::Token(format!("l{}.{}", frame, position))
    }

    fn text(&self) -> &str {
        match self {
            Block::Token(s) | Block::Keyword(s) => s,
            Block::Prefix(s) | Block::Open(s) | Block::Close(s) => s,
            Block::Comma => ",",
        }
    }

    fn joins_next(&self) -> bool {
        matches!(self, Block::Keyword(_) | Block::Prefix(_) | Block::Open(_))
    }

    fn joins_previous(&self) -> bool {
        matches!(self, Block::Close(_) | Block::Comma)
    }
}

/// Joins [`Block`]s into a single line.
pub struct DebugPrinter;

impl DebugPrinter {
    pub fn print(blocks: &[Block]) -> String {
        let mut out = String::new();
        let mut prev: Option<&Block> = None;
        for block in blocks {
            if let Some(p) = prev {
                // A keyword only sticks to an opening bracket.
                let keyword_spaced = matches!(p, Block::Keyword(_)) && !matches!(block, Block::Open(_));
                if keyword_spaced || !(p.joins_next() || block.joins_previous()) {
                    out.push(' ');
                }
            }
            out.push_str(block.text());
            prev = Some(block);
        }
        out
    }
}
