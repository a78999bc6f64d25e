// Integration tests for docexpr: end-to-end compilation and execution of expression trees

use docexpr::*;
use proptest::prelude::*;
use std::sync::Arc;

const DOC: SlotId = 1;

fn doc_ctx() -> (CompileCtx, Arc<OwnedValueAccessor>) {
    let mut row = SlotTable::new();
    let doc = row.bind(DOC);
    (CompileCtx::new(RuntimeEnvironment::new()).with_root(Arc::new(row)), doc)
}

fn eval(expr: &EExpression) -> Result<Value> {
    let (mut ctx, _) = doc_ctx();
    let code = expr.compile(&mut ctx)?;
    Vm::new().run(&code).map(|(_, v)| v)
}

fn field(obj: EExpression, name: &str) -> EExpression {
    EExpression::function("getField", vec![obj, EExpression::constant(name)])
}

fn document(a: i32, c: Option<i32>) -> Value {
    let b = match c {
        Some(c) => Value::object([("c", Value::Int32(c))]),
        None => Value::object(Vec::<(String, Value)>::new()),
    };
    Value::object([("a", Value::Int32(a)), ("b", b)])
}

/// `a > 1 && (exists(b.c) ? b.c < 10 : fail)`
fn scenario_expr() -> EExpression {
    let b_c = || field(field(EExpression::slot(DOC), "b"), "c");
    EExpression::binary(
        BinaryOp::LogicAnd,
        EExpression::binary(BinaryOp::Greater, field(EExpression::slot(DOC), "a"), EExpression::constant(1)),
        EExpression::if_then_else(
            EExpression::function("exists", vec![b_c()]),
            EExpression::binary(BinaryOp::Less, b_c(), EExpression::constant(10)),
            EExpression::fail(9001, "b.c is missing"),
        ),
    )
}

#[test]
fn test_document_predicate_scenario() {
    let (mut ctx, doc) = doc_ctx();
    let compiled = CompiledExpr::compile(&scenario_expr(), &mut ctx).unwrap();
    let mut vm = Vm::new();

    doc.reset(true, document(2, Some(3)));
    assert_eq!(compiled.eval(&mut vm).unwrap(), Value::Boolean(true));

    doc.reset(true, document(0, Some(3)));
    assert_eq!(compiled.eval(&mut vm).unwrap(), Value::Boolean(false));

    // The failing helper is skipped when the left operand is false.
    doc.reset(true, document(0, None));
    assert_eq!(compiled.eval(&mut vm).unwrap(), Value::Boolean(false));

    doc.reset(true, document(2, None));
    let err = compiled.eval(&mut vm).unwrap_err();
    assert_eq!(err.code(), 9001);
    assert_eq!(err.to_string(), "b.c is missing");
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_every_node_kind_leaves_one_value() {
    let (mut ctx, _) = doc_ctx();
    let frame = ctx.new_frame_id();
    let nodes = vec![
        EExpression::constant(1),
        EExpression::slot(DOC),
        EExpression::unary(UnaryOp::Negate, EExpression::constant(2)),
        EExpression::binary(BinaryOp::Add, EExpression::constant(2), EExpression::constant(3)),
        EExpression::binary(BinaryOp::LogicOr, EExpression::constant(false), EExpression::constant(true)),
        EExpression::function("split", vec![EExpression::constant("a b"), EExpression::constant(" ")]),
        EExpression::function("isNumber", vec![EExpression::constant(4)]),
        EExpression::if_then_else(EExpression::constant(true), EExpression::constant(1), EExpression::constant(2)),
        EExpression::local_bind(frame, vec![EExpression::constant(5)], EExpression::local(frame, 0)),
        EExpression::numeric_convert(EExpression::constant(7), TypeTag::NumberInt64),
        EExpression::type_match(EExpression::constant("s"), STRING_MASK),
    ];
    let mut vm = Vm::new();
    for node in nodes {
        let code = node.compile(&mut ctx).unwrap();
        assert_eq!(code.stack_size(), 1, "{}", node);
        vm.run(&code).unwrap();
        assert_eq!(vm.depth(), 0);
    }
    let fail = EExpression::fail(1, "stop").compile(&mut ctx).unwrap();
    assert_eq!(fail.stack_size(), 1);
}

#[test]
fn test_missing_field_propagates_through_arithmetic() {
    let expr = EExpression::binary(
        BinaryOp::Add,
        field(EExpression::constant(Value::object([("x", Value::Int32(1))])), "missingField"),
        EExpression::constant(5),
    );
    assert!(eval(&expr).unwrap().is_nothing());
}

#[test]
fn test_short_circuit_skips_failure() {
    let and = EExpression::binary(BinaryOp::LogicAnd, EExpression::constant(false), EExpression::fail(42, "never"));
    assert_eq!(eval(&and).unwrap(), Value::Boolean(false));
    let or = EExpression::binary(BinaryOp::LogicOr, EExpression::constant(true), EExpression::fail(42, "never"));
    assert_eq!(eval(&or).unwrap(), Value::Boolean(true));
    let reached = EExpression::binary(BinaryOp::LogicOr, EExpression::constant(false), EExpression::fail(42, "boom"));
    assert_eq!(eval(&reached).unwrap_err().code(), 42);
}

#[test]
fn test_local_bind_scoping() {
    let (mut ctx, _) = doc_ctx();
    let frame = ctx.new_frame_id();
    let expr = EExpression::local_bind(
        frame,
        vec![EExpression::constant(5)],
        EExpression::binary(BinaryOp::Add, EExpression::local(frame, 0), EExpression::constant(1)),
    );
    let code = expr.compile(&mut ctx).unwrap();
    let mut vm = Vm::new();
    assert_eq!(vm.run(&code).unwrap().1, Value::Int32(6));
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_nested_local_binds() {
    let (mut ctx, _) = doc_ctx();
    let outer = ctx.new_frame_id();
    let inner = ctx.new_frame_id();
    // let [x = 10, y = 3] let [z = x - y] z * y
    let expr = EExpression::local_bind(
        outer,
        vec![EExpression::constant(10), EExpression::constant(3)],
        EExpression::local_bind(
            inner,
            vec![EExpression::binary(BinaryOp::Sub, EExpression::local(outer, 0), EExpression::local(outer, 1))],
            EExpression::binary(BinaryOp::Mul, EExpression::local(inner, 0), EExpression::local(outer, 1)),
        ),
    );
    let code = expr.compile(&mut ctx).unwrap();
    assert_eq!(Vm::new().run(&code).unwrap().1, Value::Int32(21));
}

#[test]
fn test_copy_survives_release_of_original() {
    let original = Value::string("a string long enough to live on the heap");
    let copy = copy_value(&original);
    release_value(original);
    assert_eq!(copy.as_str(), Some("a string long enough to live on the heap"));
}

#[test]
fn test_arity_is_enforced_at_compile_time() {
    let (mut ctx, _) = doc_ctx();
    for args in [1, 3] {
        let expr = EExpression::function("getField", vec![EExpression::constant(1); args]);
        let err = expr.compile(&mut ctx).unwrap_err();
        assert_eq!(err.code(), 4822845);
        assert!(err.is_compile_error());
    }
    let err = EExpression::function("split", vec![EExpression::constant("x")]).compile(&mut ctx).unwrap_err();
    assert_eq!(err.code(), 4822843);
}

#[test]
fn test_aggregates_require_aggregate_context() {
    let (mut ctx, _) = doc_ctx();
    let sum = EExpression::function("sum", vec![EExpression::slot(DOC)]);
    assert_eq!(sum.compile(&mut ctx).unwrap_err().code(), 4822846);
    let add_to_set = EExpression::function("addToSet", vec![EExpression::slot(DOC)]);
    assert_eq!(add_to_set.compile(&mut ctx).unwrap_err().code(), 4822844);

    ctx.begin_aggregate(Arc::new(OwnedValueAccessor::new()));
    assert!(sum.compile(&mut ctx).is_ok());
    assert!(add_to_set.compile(&mut ctx).is_ok());
}

#[test]
fn test_lossy_conversion_fails_at_run_time() {
    let expr = EExpression::numeric_convert(EExpression::constant(1e20), TypeTag::NumberInt32);
    let (mut ctx, _) = doc_ctx();
    let code = expr.compile(&mut ctx).unwrap();
    assert_eq!(Vm::new().run(&code).unwrap_err().code(), 4822850);
    let fits = EExpression::numeric_convert(EExpression::constant(12.0), TypeTag::NumberInt32);
    assert_eq!(eval(&fits).unwrap(), Value::Int32(12));
}

#[test]
fn test_environment_slots_and_time_zones() {
    let mut gen = SlotIdGenerator::new();
    let env = RuntimeEnvironment::builder()
        .slot("limit", Value::Int32(10))
        .with_time_zone_db(TimeZoneDatabase::new())
        .build(&mut gen)
        .unwrap();
    let limit = env.get_slot("limit").unwrap();
    let tz = env.get_slot(TIME_ZONE_DB_SLOT).unwrap();
    let mut ctx = CompileCtx::new(env);

    let expr = EExpression::binary(BinaryOp::Less, EExpression::constant(3), EExpression::slot(limit));
    let code = expr.compile(&mut ctx).unwrap();
    let mut vm = Vm::new();
    assert!(vm.run_predicate(&code).unwrap());
    ctx.env().reset_slot(limit, Value::Int32(2), false).unwrap();
    assert!(!vm.run_predicate(&code).unwrap());

    let check = EExpression::function(
        "isTimezone",
        vec![EExpression::slot(tz), EExpression::constant("Europe/London")],
    );
    assert_eq!(vm.run(&check.compile(&mut ctx).unwrap()).unwrap().1, Value::Boolean(true));

    let parallel = ctx.make_copy(true);
    assert!(parallel.env().is_smp());
    assert_eq!(ctx.env().reset_slot(limit, Value::Int32(1), false).unwrap_err().code(), 4946304);
}

#[test]
fn test_group_accumulation() {
    let (mut ctx, doc) = doc_ctx();
    ctx.begin_aggregate(Arc::new(OwnedValueAccessor::new()));
    let expr = EExpression::function("addToArray", vec![field(EExpression::slot(DOC), "a")]);
    let compiled = CompiledExpr::compile(&expr, &mut ctx).unwrap();
    ctx.end_aggregate();

    let mut vm = Vm::new();
    for a in [3, 1, 2] {
        doc.reset(true, document(a, None));
        compiled.accumulate(&mut vm).unwrap();
    }
    let collected = compiled.accumulated().unwrap();
    assert_eq!(collected, Value::array(vec![Value::Int32(3), Value::Int32(1), Value::Int32(2)]));
}

#[test]
fn test_expression_debug_print_and_serde() {
    let expr = scenario_expr();
    let printed = expr.to_string();
    assert!(printed.starts_with("getField(s1, \"a\") > 1 && "), "{}", printed);
    let json = serde_json::to_string(&expr).unwrap();
    let back: EExpression = serde_json::from_str(&json).unwrap();
    assert_eq!(back, expr);
    assert_eq!(expr.clone(), expr);
}

proptest! {
    #[test]
    fn absent_operand_yields_nothing(v in any::<i64>(), op_idx in 0usize..11, absent_left in any::<bool>()) {
        let ops = [
            BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div,
            BinaryOp::Less, BinaryOp::LessEq, BinaryOp::Greater, BinaryOp::GreaterEq,
            BinaryOp::Eq, BinaryOp::Neq, BinaryOp::Cmp3w,
        ];
        let (lhs, rhs) = if absent_left {
            (EExpression::nothing(), EExpression::constant(v))
        } else {
            (EExpression::constant(v), EExpression::nothing())
        };
        let result = eval(&EExpression::binary(ops[op_idx], lhs, rhs)).unwrap();
        prop_assert!(result.is_nothing());
    }
}

proptest! {
    #[test]
    fn integer_addition_matches_native(a in any::<i32>(), b in any::<i32>()) {
        let expr = EExpression::binary(BinaryOp::Add, EExpression::constant(a), EExpression::constant(b));
        let sum = match eval(&expr).unwrap() {
            Value::Int32(s) => i64::from(s),
            Value::Int64(s) => s,
            other => panic!("unexpected result {}", other),
        };
        prop_assert_eq!(sum, i64::from(a) + i64::from(b));
    }
}

proptest! {
    #[test]
    fn copies_are_independent(s in ".{0,64}") {
        let original = Value::array(vec![Value::string(&s), Value::Int32(1)]);
        let copy = copy_value(&original);
        release_value(original);
        prop_assert_eq!(copy.as_array().and_then(|a| a[0].as_str()), Some(s.as_str()));
    }
}
