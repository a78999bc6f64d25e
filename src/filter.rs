//! Filter module: wraps compiled expressions and provides the main execution API.
//!
//! A [`CompiledExpr`] is compiled once and then evaluated per row on any
//! number of [`Vm`] instances.

use crate::compiler::Compiler;
use crate::context::CompileCtx;
use crate::expr::EExpression;
use crate::ir::CodeFragment;
use crate::slot::{OwnedValueAccessor, SlotAccessor};
use crate::types::Value;
use crate::vm::Vm;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, instrument};

/// A compiled expression, ready for execution.
pub struct CompiledExpr {
    code: CodeFragment,
    accumulator: Option<Arc<OwnedValueAccessor>>,
}

impl CompiledExpr {
    /// Compiles `expr` against `ctx`. When the context is inside an aggregate
    /// expression the accumulator is captured for [`accumulate`](Self::accumulate).
    #[instrument(level = "debug", skip_all)]
    pub fn compile(expr: &EExpression, ctx: &mut CompileCtx) -> Result<Self> {
        let code = Compiler::compile(expr, ctx)?;
        let accumulator = if ctx.agg_expression() { ctx.accumulator().cloned() } else { None };
        debug!(instrs = code.len(), aggregate = accumulator.is_some(), "compiled expression");
        Ok(Self { code, accumulator })
    }

    pub fn code(&self) -> &CodeFragment {
        &self.code
    }

    /// Evaluates against the current row and returns the owned result.
    pub fn eval(&self, vm: &mut Vm) -> Result<Value> {
        vm.run(&self.code).map(|(_, value)| value)
    }

    /// True only when the expression yields Boolean `true`.
    pub fn eval_predicate(&self, vm: &mut Vm) -> Result<bool> {
        vm.run_predicate(&self.code)
    }

    /// Folds the current row into the accumulator.
    pub fn accumulate(&self, vm: &mut Vm) -> Result<()> {
        let accumulator = self
            .accumulator
            .as_ref()
            .ok_or_else(|| Error::InstructionAggregateContext { name: "accumulate".to_string() })?;
        let (owned, value) = vm.run(&self.code)?;
        accumulator.reset(owned, value);
        Ok(())
    }

    /// Current accumulator value of an aggregate expression.
    pub fn accumulated(&self) -> Option<Value> {
        self.accumulator.as_ref().map(|acc| acc.get_view_of_value())
    }
}
