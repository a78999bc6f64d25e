//! Compiler module: lowers an [`EExpression`] tree into a [`CodeFragment`].
//!
//! Every node compiles to a fragment that pushes exactly one value. Logical
//! operators and conditionals are lowered to jumps; a `Nothing` operand
//! skips the jump logic and becomes the result.

use crate::context::CompileCtx;
use crate::expr::{BinaryOp, EExpression, UnaryOp};
use crate::functions::{lookup_builtin, lookup_instruction};
use crate::ir::{CodeFragment, Instruction, JumpKind};
use crate::types::{copy_value, Value};
use crate::{Error, Result};
use tracing::{debug, instrument, trace};

pub struct Compiler;

impl Compiler {
    /// Compiles `expr` into a fragment with a net stack effect of one.
    #[instrument(level = "trace", skip(expr, ctx))]
    pub fn compile(expr: &EExpression, ctx: &mut CompileCtx) -> Result<CodeFragment> {
        let code = expr.compile(ctx).map_err(|e| {
            debug!(code = e.code(), error = %e, "expression failed to compile");
            e
        })?;
        trace!(instrs = code.len(), stack_size = code.stack_size(), "compiled expression");
        Ok(code)
    }
}

impl EExpression {
    pub fn compile(&self, ctx: &mut CompileCtx) -> Result<CodeFragment> {
        match self {
            EExpression::Constant(value) => {
                let mut code = CodeFragment::new();
                code.append_const_val(copy_value(value));
                Ok(code)
            }
            EExpression::Variable { slot, frame } => {
                let mut code = CodeFragment::new();
                match frame {
                    Some(frame) => code.append_local_val(*frame, -(*slot as i32) - 1),
                    None => code.append_access_val(ctx.get_accessor(*slot)?),
                }
                Ok(code)
            }
            EExpression::Unary { op, operand } => {
                let mut code = operand.compile(ctx)?;
                code.append_instr(match op {
                    UnaryOp::Negate => Instruction::Negate,
                    UnaryOp::LogicNot => Instruction::LogicNot,
                });
                Ok(code)
            }
            EExpression::Binary { op, lhs, rhs } => compile_binary(*op, lhs, rhs, ctx),
            EExpression::Function { name, args } => compile_function(name, args, ctx),
            EExpression::If { cond, then_branch, else_branch } => {
                let then_code = then_branch.compile(ctx)?;
                let mut else_code = else_branch.compile(ctx)?;
                // The else branch jumps over the then branch to the merge point.
                else_code.append_jump_over(JumpKind::Always, &then_code);

                let code = cond.compile(ctx)?;
                wrap_nothing_test(code, |mut inner| {
                    inner.append_jump_over(JumpKind::IfTrue, &else_code);
                    inner.append_branches(else_code, then_code)?;
                    Ok(inner)
                })
            }
            EExpression::LocalBind { frame, binds, body } => {
                let mut code = CodeFragment::new();
                for bind in binds {
                    code.append(bind.compile(ctx)?);
                }
                code.append(body.compile(ctx)?);
                // Sink the result below each local and drop the local.
                for _ in binds {
                    code.append_swap();
                    code.append_pop();
                }
                code.remove_fixup(*frame);
                Ok(code)
            }
            EExpression::Fail { code: error_code, message } => {
                let mut code = CodeFragment::new();
                code.append_const_val(Value::Int64(*error_code));
                code.append_const_val(Value::string(message));
                code.append_fail();
                Ok(code)
            }
            EExpression::NumericConvert { operand, target } => {
                let mut code = operand.compile(ctx)?;
                code.append_numeric_convert(*target);
                Ok(code)
            }
            EExpression::TypeMatch { operand, mask } => {
                let mut code = operand.compile(ctx)?;
                code.append_type_match(*mask);
                Ok(code)
            }
        }
    }
}

/// Appends the code built by `body` so that it only runs when the value on
/// top of the stack is not `Nothing`. The inner code must not change the
/// stack depth.
fn wrap_nothing_test<F>(mut code: CodeFragment, body: F) -> Result<CodeFragment>
where
    F: FnOnce(CodeFragment) -> Result<CodeFragment>,
{
    let inner = body(CodeFragment::new())?;
    debug_assert_eq!(inner.stack_size(), 0);
    code.append_jump_over(JumpKind::IfNothing, &inner);
    code.append(inner);
    Ok(code)
}

fn compile_binary(
    op: BinaryOp,
    lhs: &EExpression,
    rhs: &EExpression,
    ctx: &mut CompileCtx,
) -> Result<CodeFragment> {
    let lhs = lhs.compile(ctx)?;
    let mut rhs = rhs.compile(ctx)?;

    let instr = match op {
        BinaryOp::LogicAnd => {
            let mut false_branch = CodeFragment::new();
            false_branch.append_const_val(Value::Boolean(false));
            false_branch.append_jump_over(JumpKind::Always, &rhs);

            return wrap_nothing_test(lhs, |mut inner| {
                inner.append_jump_over(JumpKind::IfTrue, &false_branch);
                inner.append_branches(false_branch, rhs)?;
                Ok(inner)
            });
        }
        BinaryOp::LogicOr => {
            let mut true_branch = CodeFragment::new();
            true_branch.append_const_val(Value::Boolean(true));
            rhs.append_jump_over(JumpKind::Always, &true_branch);

            return wrap_nothing_test(lhs, |mut inner| {
                inner.append_jump_over(JumpKind::IfTrue, &rhs);
                inner.append_branches(rhs, true_branch)?;
                Ok(inner)
            });
        }
        BinaryOp::Add => Instruction::Add,
        BinaryOp::Sub => Instruction::Sub,
        BinaryOp::Mul => Instruction::Mul,
        BinaryOp::Div => Instruction::Div,
        BinaryOp::Less => Instruction::Less,
        BinaryOp::LessEq => Instruction::LessEq,
        BinaryOp::Greater => Instruction::Greater,
        BinaryOp::GreaterEq => Instruction::GreaterEq,
        BinaryOp::Eq => Instruction::Eq,
        BinaryOp::Neq => Instruction::Neq,
        BinaryOp::Cmp3w => Instruction::Cmp3w,
        BinaryOp::FillEmpty => Instruction::FillEmpty,
    };

    let mut code = lhs;
    code.append(rhs);
    code.append_instr(instr);
    Ok(code)
}

fn compile_function(name: &str, args: &[EExpression], ctx: &mut CompileCtx) -> Result<CodeFragment> {
    if let Some(f) = lookup_builtin(name) {
        let mut arity = args.len();
        if !f.arity.accepts(arity) {
            return Err(Error::BuiltinArity { name: name.to_string(), arity });
        }
        let mut code = CodeFragment::new();
        // Builtin arguments are pushed last to first.
        for arg in args.iter().rev() {
            code.append(arg.compile(ctx)?);
        }
        if f.aggregate {
            let accumulator = ctx
                .aggregate_accumulator()
                .ok_or_else(|| Error::BuiltinAggregateContext { name: name.to_string() })?;
            code.append_move_val(accumulator);
            arity += 1;
        }
        code.append_function(f.builtin, arity);
        return Ok(code);
    }

    if let Some(f) = lookup_instruction(name) {
        if f.arity != args.len() {
            return Err(Error::InstructionArity { name: name.to_string(), arity: args.len() });
        }
        let mut code = CodeFragment::new();
        if f.aggregate {
            let accumulator = ctx
                .aggregate_accumulator()
                .ok_or_else(|| Error::InstructionAggregateContext { name: name.to_string() })?;
            code.append_access_val(accumulator);
        }
        // Instruction arguments are pushed first to last.
        for arg in args {
            code.append(arg.compile(ctx)?);
        }
        code.append_instr(f.instruction);
        return Ok(code);
    }

    Err(Error::UnknownFunction(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::RuntimeEnvironment;
    use crate::slot::OwnedValueAccessor;
    use crate::types::TypeTag;
    use std::sync::Arc;

    fn ctx() -> CompileCtx {
        CompileCtx::new(RuntimeEnvironment::new())
    }

    fn names(code: &CodeFragment) -> Vec<String> {
        code.instrs().iter().map(|i| format!("{:?}", i)).collect()
    }

    #[test]
    fn test_every_node_pushes_one_value() {
        let mut ctx = ctx();
        let frame = ctx.new_frame_id();
        let nodes = vec![
            EExpression::constant(1),
            EExpression::unary(UnaryOp::Negate, EExpression::constant(1)),
            EExpression::binary(BinaryOp::Add, EExpression::constant(1), EExpression::constant(2)),
            EExpression::binary(BinaryOp::LogicOr, EExpression::constant(true), EExpression::constant(false)),
            EExpression::function("concat", vec![EExpression::constant("a"), EExpression::constant("b")]),
            EExpression::if_then_else(EExpression::constant(true), EExpression::constant(1), EExpression::constant(2)),
            EExpression::local_bind(frame, vec![EExpression::constant(5)], EExpression::local(frame, 0)),
            EExpression::fail(1, "x"),
            EExpression::numeric_convert(EExpression::constant(1), TypeTag::NumberInt64),
            EExpression::type_match(EExpression::constant(1), 0),
        ];
        for node in nodes {
            let code = Compiler::compile(&node, &mut ctx).unwrap();
            assert_eq!(code.stack_size(), 1, "{}", node);
        }
    }

    #[test]
    fn test_logic_and_shape() {
        let e = EExpression::binary(BinaryOp::LogicAnd, EExpression::constant(true), EExpression::constant(2));
        let code = Compiler::compile(&e, &mut ctx()).unwrap();
        assert_eq!(
            names(&code),
            vec!["pushConstVal(true)", "jmpNothing(4)", "jmpTrue(2)", "pushConstVal(false)", "jmp(1)", "pushConstVal(2)"]
        );
    }

    #[test]
    fn test_logic_or_shape() {
        let e = EExpression::binary(BinaryOp::LogicOr, EExpression::constant(false), EExpression::constant(2));
        let code = Compiler::compile(&e, &mut ctx()).unwrap();
        assert_eq!(
            names(&code),
            vec!["pushConstVal(false)", "jmpNothing(4)", "jmpTrue(2)", "pushConstVal(2)", "jmp(1)", "pushConstVal(true)"]
        );
    }

    #[test]
    fn test_if_shape() {
        let e = EExpression::if_then_else(EExpression::constant(true), EExpression::constant(1), EExpression::constant(2));
        let code = Compiler::compile(&e, &mut ctx()).unwrap();
        assert_eq!(
            names(&code),
            vec!["pushConstVal(true)", "jmpNothing(4)", "jmpTrue(2)", "pushConstVal(2)", "jmp(1)", "pushConstVal(1)"]
        );
    }

    #[test]
    fn test_local_bind_offsets() {
        let mut ctx = ctx();
        let frame = ctx.new_frame_id();
        let e = EExpression::local_bind(
            frame,
            vec![EExpression::constant(10), EExpression::constant(20)],
            EExpression::binary(BinaryOp::Sub, EExpression::local(frame, 0), EExpression::local(frame, 1)),
        );
        let code = Compiler::compile(&e, &mut ctx).unwrap();
        assert_eq!(
            names(&code),
            vec![
                "pushConstVal(10)",
                "pushConstVal(20)",
                "pushLocalVal(1)",
                "pushLocalVal(1)",
                "sub",
                "swap",
                "pop",
                "swap",
                "pop"
            ]
        );
        assert!(code.fixups().is_empty());
        assert_eq!(code.stack_size(), 1);
    }

    #[test]
    fn test_builtin_arguments_are_reversed() {
        let e = EExpression::function("split", vec![EExpression::constant("a,b"), EExpression::constant(",")]);
        let code = Compiler::compile(&e, &mut ctx()).unwrap();
        assert_eq!(names(&code), vec!["pushConstVal(\",\")", "pushConstVal(\"a,b\")", "function(split, 2)"]);
    }

    #[test]
    fn test_instruction_arguments_are_in_order() {
        let e = EExpression::function("getField", vec![EExpression::constant(1), EExpression::constant("a")]);
        let code = Compiler::compile(&e, &mut ctx()).unwrap();
        assert_eq!(names(&code), vec!["pushConstVal(1)", "pushConstVal(\"a\")", "getField"]);
    }

    #[test]
    fn test_arity_errors() {
        let mut ctx = ctx();
        let one = vec![EExpression::constant(1)];
        let err = Compiler::compile(&EExpression::function("getField", one.clone()), &mut ctx).unwrap_err();
        assert_eq!(err.code(), 4822845);
        let err = Compiler::compile(&EExpression::function("split", one), &mut ctx).unwrap_err();
        assert_eq!(err.code(), 4822843);
        let err = Compiler::compile(&EExpression::function("nope", vec![]), &mut ctx).unwrap_err();
        assert_eq!(err.code(), 4822847);
    }

    #[test]
    fn test_aggregate_requires_context() {
        let mut ctx = ctx();
        let sum = EExpression::function("sum", vec![EExpression::constant(1)]);
        let add_to_set = EExpression::function("addToSet", vec![EExpression::constant(1)]);
        assert_eq!(Compiler::compile(&sum, &mut ctx).unwrap_err().code(), 4822846);
        assert_eq!(Compiler::compile(&add_to_set, &mut ctx).unwrap_err().code(), 4822844);

        ctx.begin_aggregate(Arc::new(OwnedValueAccessor::new()));
        let code = Compiler::compile(&sum, &mut ctx).unwrap();
        assert!(matches!(code.instrs()[0], Instruction::PushAccessVal(_)));
        let code = Compiler::compile(&add_to_set, &mut ctx).unwrap();
        assert!(matches!(code.instrs()[1], Instruction::PushMoveVal(_)));
        assert!(matches!(code.instrs()[2], Instruction::Function { arity: 2, .. }));
    }

    #[test]
    fn test_unknown_slot_fails_to_compile() {
        let err = Compiler::compile(&EExpression::slot(42), &mut ctx()).unwrap_err();
        assert_eq!(err.code(), 4946301);
    }
}
