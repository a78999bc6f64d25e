//! VM module: the byte-code interpreter.
//!
//! The operand stack holds values paired with an ownership flag. A run
//! starts from an empty stack and must end with exactly one value, which is
//! handed to the caller.

use crate::arith::{
    generic_add, generic_cmp3w, generic_compare, generic_div, generic_mod, generic_mul, generic_negate,
    generic_not, generic_num_convert, generic_sub, CompareOp,
};
use crate::ir::{CodeFragment, Instruction};
use crate::types::{compare_value, copy_value, TypeTag, Value, ARRAY_MASK};
use crate::{Error, Result};
use std::cmp::Ordering;
use tracing::{debug, instrument, trace};

/// Stack based interpreter. One instance per execution branch; a compiled
/// fragment may be shared by many instances.
#[derive(Debug, Default)]
pub struct Vm {
    stack: Vec<(bool, Value)>,
}

impl Vm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpreter whose operand stack is preallocated for `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { stack: Vec::with_capacity(capacity) }
    }

    /// Runs `code` to completion and returns the single resulting value with
    /// its ownership flag.
    #[instrument(level = "trace", skip_all, fields(instrs = code.len()))]
    pub fn run(&mut self, code: &CodeFragment) -> Result<(bool, Value)> {
        self.stack.clear();
        if let Err(e) = self.run_internal(code) {
            debug!(code = e.code(), error = %e, "byte-code execution failed");
            self.stack.clear();
            return Err(e);
        }
        if self.stack.len() != 1 {
            let depth = self.stack.len();
            self.stack.clear();
            return Err(Error::StackImbalance(depth));
        }
        let result = self.stack.pop().unwrap_or_default();
        trace!(result = %result.1, "byte-code execution finished");
        Ok(result)
    }

    /// Runs `code` and reports whether it produced Boolean `true`.
    pub fn run_predicate(&mut self, code: &CodeFragment) -> Result<bool> {
        let (_, value) = self.run(code)?;
        Ok(matches!(value, Value::Boolean(true)))
    }

    /// Current operand stack depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The entry `offset` positions below the top of the stack.
    pub(crate) fn get_from_stack(&self, offset: usize) -> Result<&(bool, Value)> {
        self.stack
            .len()
            .checked_sub(offset + 1)
            .and_then(|idx| self.stack.get(idx))
            .ok_or(Error::LocalOutOfFrame(offset as i32))
    }

    pub(crate) fn pop_stack(&mut self) -> Result<(bool, Value)> {
        self.stack.pop().ok_or(Error::StackImbalance(0))
    }

    /// Moves the entry `offset` positions below the top out of the stack,
    /// leaving an unowned `Nothing` in its place.
    pub(crate) fn take_from_stack(&mut self, offset: usize) -> Result<(bool, Value)> {
        let idx = self
            .stack
            .len()
            .checked_sub(offset + 1)
            .ok_or(Error::LocalOutOfFrame(offset as i32))?;
        Ok(std::mem::take(&mut self.stack[idx]))
    }

    pub(crate) fn push_stack(&mut self, owned: bool, value: Value) {
        self.stack.push((owned, value));
    }

    /// Pushes a freshly produced value; only heap payloads count as owned.
    fn push_result(&mut self, value: Value) {
        let owned = value.is_heap();
        self.stack.push((owned, value));
    }

    fn top(&self) -> Result<&Value> {
        self.get_from_stack(0).map(|(_, v)| v)
    }

    fn run_internal(&mut self, code: &CodeFragment) -> Result<()> {
        let instrs = code.instrs();
        let mut pc = 0usize;
        while let Some(instr) = instrs.get(pc) {
            pc += 1;
            match instr {
                Instruction::PushConstVal(v) => self.push_stack(false, v.clone()),
                Instruction::PushAccessVal(accessor) => self.push_stack(false, accessor.get_view_of_value()),
                Instruction::PushMoveVal(accessor) => {
                    let (owned, value) = accessor.copy_or_move_value();
                    self.push_stack(owned, value);
                }
                Instruction::PushLocalVal(offset) => {
                    let offset = usize::try_from(*offset).map_err(|_| Error::LocalOutOfFrame(*offset))?;
                    let value = self.get_from_stack(offset)?.1.clone();
                    self.push_stack(false, value);
                }
                Instruction::Pop => {
                    self.pop_stack()?;
                }
                Instruction::Swap => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(Error::StackImbalance(len));
                    }
                    self.stack.swap(len - 1, len - 2);
                }

                Instruction::Add => self.binary_op(generic_add)?,
                Instruction::Sub => self.binary_op(generic_sub)?,
                Instruction::Mul => self.binary_op(generic_mul)?,
                Instruction::Div => self.binary_op(generic_div)?,
                Instruction::Mod => self.binary_op(generic_mod)?,
                Instruction::Negate => {
                    let (_, operand) = self.pop_stack()?;
                    self.push_result(generic_negate(&operand)?);
                }
                Instruction::NumConvert(target) => {
                    let (_, operand) = self.pop_stack()?;
                    self.push_result(generic_num_convert(&operand, *target)?);
                }
                Instruction::LogicNot => {
                    let (_, operand) = self.pop_stack()?;
                    self.push_result(generic_not(&operand));
                }

                Instruction::Less => self.compare_op(CompareOp::Less)?,
                Instruction::LessEq => self.compare_op(CompareOp::LessEq)?,
                Instruction::Greater => self.compare_op(CompareOp::Greater)?,
                Instruction::GreaterEq => self.compare_op(CompareOp::GreaterEq)?,
                Instruction::Eq => self.compare_op(CompareOp::Eq)?,
                Instruction::Neq => self.compare_op(CompareOp::Neq)?,
                Instruction::Cmp3w => self.binary_op(|l, r| Ok(generic_cmp3w(l, r)))?,

                Instruction::FillEmpty => {
                    let rhs = self.pop_stack()?;
                    let lhs = self.pop_stack()?;
                    let (owned, value) = if lhs.1.is_nothing() { rhs } else { lhs };
                    self.push_stack(owned, value);
                }
                Instruction::GetField => self.get_field()?,
                Instruction::GetElement => self.get_element()?,

                Instruction::AggSum => self.aggregate(|acc, field| match acc {
                    Value::Nothing => generic_add(&Value::Int64(0), field),
                    _ => generic_add(acc, field),
                })?,
                Instruction::AggMin => self.aggregate(|acc, field| {
                    Ok(match compare_value(acc, field) {
                        Some(Ordering::Less) if !acc.is_nothing() => copy_value(acc),
                        _ => copy_value(field),
                    })
                })?,
                Instruction::AggMax => self.aggregate(|acc, field| {
                    Ok(match compare_value(acc, field) {
                        Some(Ordering::Greater) if !acc.is_nothing() => copy_value(acc),
                        _ => copy_value(field),
                    })
                })?,
                Instruction::AggFirst => self.aggregate(|acc, field| {
                    Ok(if acc.is_nothing() { copy_value(field) } else { copy_value(acc) })
                })?,
                Instruction::AggLast => self.aggregate(|_, field| Ok(copy_value(field)))?,

                Instruction::Exists => {
                    let (_, operand) = self.pop_stack()?;
                    self.push_result(Value::Boolean(!operand.is_nothing()));
                }
                Instruction::IsNull => self.type_test(|v| matches!(v, Value::Null))?,
                Instruction::IsObject => self.type_test(|v| v.tag().is_object())?,
                Instruction::IsArray => self.type_test(|v| v.tag().mask() & ARRAY_MASK != 0)?,
                Instruction::IsString => self.type_test(Value::is_string)?,
                Instruction::IsNumber => self.type_test(Value::is_number)?,
                Instruction::IsBinData => self.type_test(|v| v.tag() == TypeTag::BinData)?,
                Instruction::IsDate => self.type_test(|v| v.tag() == TypeTag::Date)?,
                Instruction::IsNaN => self.type_test(|v| matches!(v, Value::Double(d) if d.is_nan()))?,
                Instruction::TypeMatch(mask) => {
                    let mask = *mask;
                    self.type_test(move |v| v.tag().mask() & mask != 0)?
                }

                Instruction::Function { builtin, arity } => {
                    let (owned, result) = self.dispatch_builtin(*builtin, *arity)?;
                    for _ in 0..*arity {
                        self.pop_stack()?;
                    }
                    self.push_stack(owned, result);
                }

                Instruction::Jmp(offset) => pc = jump_target(pc, *offset),
                Instruction::JmpTrue(offset) => {
                    let (_, cond) = self.pop_stack()?;
                    if matches!(cond, Value::Boolean(true)) {
                        pc = jump_target(pc, *offset);
                    }
                }
                Instruction::JmpNothing(offset) => {
                    if self.top()?.is_nothing() {
                        pc = jump_target(pc, *offset);
                    }
                }
                Instruction::Fail => {
                    let (_, message) = self.pop_stack()?;
                    let (_, code) = self.pop_stack()?;
                    let code = match code {
                        Value::Int32(c) => i64::from(c),
                        Value::Int64(c) => c,
                        _ => 0,
                    };
                    let message = message.as_str().unwrap_or_default().to_string();
                    return Err(Error::Fail { code, message });
                }
            }
        }
        Ok(())
    }

    fn binary_op<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&Value, &Value) -> Result<Value>,
    {
        let (_, rhs) = self.pop_stack()?;
        let (_, lhs) = self.pop_stack()?;
        if lhs.is_nothing() || rhs.is_nothing() {
            self.push_result(Value::Nothing);
            return Ok(());
        }
        let result = op(&lhs, &rhs)?;
        self.push_result(result);
        Ok(())
    }

    fn compare_op(&mut self, op: CompareOp) -> Result<()> {
        self.binary_op(|l, r| Ok(generic_compare(op, l, r)))
    }

    /// Replaces the top value with a Boolean test result; `Nothing` stays.
    fn type_test<F>(&mut self, test: F) -> Result<()>
    where
        F: FnOnce(&Value) -> bool,
    {
        let (_, operand) = self.pop_stack()?;
        let result = if operand.is_nothing() { Value::Nothing } else { Value::Boolean(test(&operand)) };
        self.push_result(result);
        Ok(())
    }

    fn get_field(&mut self) -> Result<()> {
        let (_, name) = self.pop_stack()?;
        let (owned, object) = self.pop_stack()?;
        let field = match name.as_str() {
            Some(name) => object.get_field(name).cloned().unwrap_or_default(),
            None => Value::Nothing,
        };
        let field_owned = owned && field.is_heap();
        self.push_stack(field_owned, field);
        Ok(())
    }

    fn get_element(&mut self) -> Result<()> {
        let (_, index) = self.pop_stack()?;
        let (owned, array) = self.pop_stack()?;
        let element = match (array.as_array(), index) {
            (Some(items), Value::Int32(idx)) => {
                let len = items.len() as i64;
                let idx = if idx < 0 { len + i64::from(idx) } else { i64::from(idx) };
                usize::try_from(idx).ok().and_then(|i| items.get(i)).cloned().unwrap_or_default()
            }
            _ => Value::Nothing,
        };
        let element_owned = owned && element.is_heap();
        self.push_stack(element_owned, element);
        Ok(())
    }

    /// Accumulator instructions: the accumulator sits below the new value.
    /// A `Nothing` field leaves the accumulator unchanged.
    fn aggregate<F>(&mut self, step: F) -> Result<()>
    where
        F: FnOnce(&Value, &Value) -> Result<Value>,
    {
        let (_, field) = self.pop_stack()?;
        let (_, acc) = self.pop_stack()?;
        let result = if field.is_nothing() { copy_value(&acc) } else { step(&acc, &field)? };
        self.push_stack(true, result);
        Ok(())
    }
}

fn jump_target(pc: usize, offset: i32) -> usize {
    pc.saturating_add_signed(offset as isize)
}
