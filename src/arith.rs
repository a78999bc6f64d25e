//! Arith module: numeric promotion, arithmetic and comparison operators.
//!
//! Operands tagged `Nothing` or of unsupported types produce `Nothing`. Only
//! the failures with a dedicated error code (division by zero, date
//! overflow, lossy conversion) abort evaluation.

use crate::types::{compare_value, TypeTag, Value};
use crate::{Error, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Widest numeric tag of two numeric operands.
fn widest(lhs: &Value, rhs: &Value) -> Option<TypeTag> {
    let (l, r) = (lhs.tag(), rhs.tag());
    let (lr, rr) = (l.numeric_rank()?, r.numeric_rank()?);
    Some(if lr >= rr { l } else { r })
}

fn as_i32(v: &Value) -> i32 {
    match v {
        Value::Int32(i) => *i,
        _ => 0,
    }
}

fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Int32(i) => i64::from(*i),
        Value::Int64(i) => *i,
        _ => 0,
    }
}

pub(crate) fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int32(i) => f64::from(*i),
        Value::Int64(i) => *i as f64,
        Value::Double(d) => *d,
        Value::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

pub(crate) fn as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Int32(i) => Some(Decimal::from(*i)),
        Value::Int64(i) => Some(Decimal::from(*i)),
        Value::Double(d) => decimal_from_f64(*d),
        Value::Decimal(d) => Some(*d),
        _ => None,
    }
}

/// Shortest decimal rendering of a finite double.
fn decimal_from_f64(d: f64) -> Option<Decimal> {
    if !d.is_finite() {
        return None;
    }
    Decimal::from_str(&d.to_string()).ok().or_else(|| Decimal::from_f64(d))
}

/// Integer value of a number that can be represented exactly as an i64.
pub(crate) fn exact_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int32(i) => Some(i64::from(*i)),
        Value::Int64(i) => Some(*i),
        Value::Double(d) => {
            if d.fract() == 0.0 && *d >= -TWO_POW_63 && *d < TWO_POW_63 {
                Some(*d as i64)
            } else {
                None
            }
        }
        Value::Decimal(d) => {
            if d.fract().is_zero() {
                d.to_i64()
            } else {
                None
            }
        }
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
}

fn numeric_op(op: ArithOp, lhs: &Value, rhs: &Value, widest_tag: TypeTag) -> Value {
    match widest_tag {
        TypeTag::NumberInt32 => {
            let (a, b) = (as_i32(lhs), as_i32(rhs));
            let r = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
            };
            match r {
                Some(r) => Value::Int32(r),
                None => numeric_op(op, &Value::Int64(a.into()), &Value::Int64(b.into()), TypeTag::NumberInt64),
            }
        }
        TypeTag::NumberInt64 => {
            let (a, b) = (as_i64(lhs), as_i64(rhs));
            let r = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
            };
            match r {
                Some(r) => Value::Int64(r),
                None => numeric_op(op, &Value::Decimal(a.into()), &Value::Decimal(b.into()), TypeTag::NumberDecimal),
            }
        }
        TypeTag::NumberDouble => {
            let (a, b) = (as_f64(lhs), as_f64(rhs));
            Value::Double(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
            })
        }
        _ => match (as_decimal(lhs), as_decimal(rhs)) {
            (Some(a), Some(b)) => {
                let r = match op {
                    ArithOp::Add => a.checked_add(b),
                    ArithOp::Sub => a.checked_sub(b),
                    ArithOp::Mul => a.checked_mul(b),
                };
                match r {
                    Some(r) => Value::Decimal(r),
                    None => numeric_op(op, &Value::Double(as_f64(lhs)), &Value::Double(as_f64(rhs)), TypeTag::NumberDouble),
                }
            }
            // A NaN or infinite double operand.
            _ => numeric_op(op, &Value::Double(as_f64(lhs)), &Value::Double(as_f64(rhs)), TypeTag::NumberDouble),
        },
    }
}

/// Milliseconds represented by a number added to or subtracted from a date.
fn date_delta(v: &Value) -> Result<i64> {
    match v {
        Value::Int32(_) | Value::Int64(_) => Ok(as_i64(v)),
        Value::Double(d) => {
            let r = d.round();
            if r.is_finite() && r >= -TWO_POW_63 && r < TWO_POW_63 {
                Ok(r as i64)
            } else {
                Err(Error::DateOverflow)
            }
        }
        Value::Decimal(d) => d.round().to_i64().ok_or(Error::DateOverflow),
        _ => Err(Error::DateOverflow),
    }
}

pub fn generic_add(lhs: &Value, rhs: &Value) -> Result<Value> {
    if let Some(w) = widest(lhs, rhs) {
        return Ok(numeric_op(ArithOp::Add, lhs, rhs, w));
    }
    match (lhs, rhs) {
        (Value::Date(d), n) | (n, Value::Date(d)) if n.is_number() => {
            let delta = date_delta(n)?;
            d.checked_add(delta).map(Value::Date).ok_or(Error::DateOverflow)
        }
        _ => Ok(Value::Nothing),
    }
}

pub fn generic_sub(lhs: &Value, rhs: &Value) -> Result<Value> {
    if let Some(w) = widest(lhs, rhs) {
        return Ok(numeric_op(ArithOp::Sub, lhs, rhs, w));
    }
    match (lhs, rhs) {
        (Value::Date(a), Value::Date(b)) => a.checked_sub(*b).map(Value::Int64).ok_or(Error::DateOverflow),
        (Value::Date(d), n) if n.is_number() => {
            let delta = date_delta(n)?;
            d.checked_sub(delta).map(Value::Date).ok_or(Error::DateOverflow)
        }
        _ => Ok(Value::Nothing),
    }
}

pub fn generic_mul(lhs: &Value, rhs: &Value) -> Result<Value> {
    Ok(match widest(lhs, rhs) {
        Some(w) => numeric_op(ArithOp::Mul, lhs, rhs, w),
        None => Value::Nothing,
    })
}

/// Division always produces a Double, or a Decimal when either side is one.
pub fn generic_div(lhs: &Value, rhs: &Value) -> Result<Value> {
    let Some(w) = widest(lhs, rhs) else {
        return Ok(Value::Nothing);
    };
    if w == TypeTag::NumberDecimal {
        if let (Some(a), Some(b)) = (as_decimal(lhs), as_decimal(rhs)) {
            if b.is_zero() {
                return Err(Error::DivideByZero);
            }
            return Ok(a.checked_div(b).map(Value::Decimal).unwrap_or(Value::Nothing));
        }
    }
    let divisor = as_f64(rhs);
    if divisor == 0.0 {
        return Err(Error::DivideByZero);
    }
    Ok(Value::Double(as_f64(lhs) / divisor))
}

pub fn generic_mod(lhs: &Value, rhs: &Value) -> Result<Value> {
    let Some(w) = widest(lhs, rhs) else {
        return Ok(Value::Nothing);
    };
    match w {
        TypeTag::NumberInt32 => {
            let b = as_i32(rhs);
            if b == 0 {
                return Err(Error::ModByZero);
            }
            Ok(Value::Int32(as_i32(lhs).wrapping_rem(b)))
        }
        TypeTag::NumberInt64 => {
            let b = as_i64(rhs);
            if b == 0 {
                return Err(Error::ModByZero);
            }
            Ok(Value::Int64(as_i64(lhs).wrapping_rem(b)))
        }
        TypeTag::NumberDouble => {
            let b = as_f64(rhs);
            if b == 0.0 {
                return Err(Error::ModByZero);
            }
            Ok(Value::Double(as_f64(lhs) % b))
        }
        _ => match (as_decimal(lhs), as_decimal(rhs)) {
            (Some(_), Some(b)) if b.is_zero() => Err(Error::ModByZero),
            (Some(a), Some(b)) => Ok(a.checked_rem(b).map(Value::Decimal).unwrap_or(Value::Nothing)),
            _ => Ok(Value::Nothing),
        },
    }
}

/// Negation is computed as `0 - operand`.
pub fn generic_negate(operand: &Value) -> Result<Value> {
    if !operand.is_number() {
        return Ok(Value::Nothing);
    }
    generic_sub(&Value::Int32(0), operand)
}

/// Logical negation of a Boolean; anything else is `Nothing`.
pub fn generic_not(operand: &Value) -> Value {
    match operand {
        Value::Boolean(b) => Value::Boolean(!b),
        _ => Value::Nothing,
    }
}

fn lossy(value: &Value, target: TypeTag) -> Error {
    Error::LossyConversion { value: value.to_string(), target: target.to_string() }
}

/// Converts a number to `target` without losing precision.
///
/// Non-numeric operands and non-numeric targets yield `Nothing`; a value
/// that does not fit the target exactly is an error.
pub fn generic_num_convert(value: &Value, target: TypeTag) -> Result<Value> {
    if !value.is_number() {
        return Ok(Value::Nothing);
    }
    match target {
        TypeTag::NumberInt32 => exact_i64(value)
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Int32)
            .ok_or_else(|| lossy(value, target)),
        TypeTag::NumberInt64 => exact_i64(value).map(Value::Int64).ok_or_else(|| lossy(value, target)),
        TypeTag::NumberDouble => match value {
            Value::Int32(i) => Ok(Value::Double(f64::from(*i))),
            Value::Int64(i) => {
                let d = *i as f64;
                if d < TWO_POW_63 && d as i64 == *i {
                    Ok(Value::Double(d))
                } else {
                    Err(lossy(value, target))
                }
            }
            Value::Double(d) => Ok(Value::Double(*d)),
            Value::Decimal(dec) => {
                let d = dec.to_f64().ok_or_else(|| lossy(value, target))?;
                if decimal_from_f64(d) == Some(*dec) {
                    Ok(Value::Double(d))
                } else {
                    Err(lossy(value, target))
                }
            }
            _ => Ok(Value::Nothing),
        },
        TypeTag::NumberDecimal => as_decimal(value).map(Value::Decimal).ok_or_else(|| lossy(value, target)),
        _ => Ok(Value::Nothing),
    }
}

/// Ordered and equality comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    Neq,
}

impl CompareOp {
    fn test(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Less => ord == Ordering::Less,
            CompareOp::LessEq => ord != Ordering::Greater,
            CompareOp::Greater => ord == Ordering::Greater,
            CompareOp::GreaterEq => ord != Ordering::Less,
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Neq => ord != Ordering::Equal,
        }
    }
}

/// Applies `op` under the collation order. Absent operands give `Nothing`;
/// incomparable operands never match (only `Neq` is true).
pub fn generic_compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Value {
    if lhs.is_nothing() || rhs.is_nothing() {
        return Value::Nothing;
    }
    match compare_value(lhs, rhs) {
        Some(ord) => Value::Boolean(op.test(ord)),
        None => Value::Boolean(op == CompareOp::Neq),
    }
}

/// Three-way comparison yielding Int32 -1, 0 or 1.
pub fn generic_cmp3w(lhs: &Value, rhs: &Value) -> Value {
    if lhs.is_nothing() || rhs.is_nothing() {
        return Value::Nothing;
    }
    match compare_value(lhs, rhs) {
        Some(ord) => Value::Int32(ord as i32),
        None => Value::Nothing,
    }
}

pub fn generic_abs(v: &Value) -> Value {
    match v {
        Value::Int32(i) => i.checked_abs().map(Value::Int32).unwrap_or(Value::Int64(i64::from(*i).abs())),
        Value::Int64(i) => i.checked_abs().map(Value::Int64).unwrap_or(Value::Decimal(Decimal::from(*i).abs())),
        Value::Double(d) => Value::Double(d.abs()),
        Value::Decimal(d) => Value::Decimal(d.abs()),
        _ => Value::Nothing,
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Rounding {
    Ceil,
    Floor,
    Trunc,
}

pub(crate) fn generic_round(v: &Value, mode: Rounding) -> Value {
    match v {
        Value::Int32(_) | Value::Int64(_) => v.clone(),
        Value::Double(d) => Value::Double(match mode {
            Rounding::Ceil => d.ceil(),
            Rounding::Floor => d.floor(),
            Rounding::Trunc => d.trunc(),
        }),
        Value::Decimal(d) => Value::Decimal(match mode {
            Rounding::Ceil => d.ceil(),
            Rounding::Floor => d.floor(),
            Rounding::Trunc => d.trunc(),
        }),
        _ => Value::Nothing,
    }
}

/// Applies a floating point function. Decimal inputs produce Decimal results;
/// a NaN result from a non-NaN input means the input was out of domain.
pub(crate) fn generic_float_fn(v: &Value, f: fn(f64) -> f64) -> Value {
    if !v.is_number() {
        return Value::Nothing;
    }
    let x = as_f64(v);
    let r = f(x);
    if r.is_nan() && !x.is_nan() {
        return Value::Nothing;
    }
    match v {
        Value::Decimal(_) => decimal_from_f64(r).map(Value::Decimal).unwrap_or(Value::Double(r)),
        _ => Value::Double(r),
    }
}

/// Arctangent of `y / x`; Decimal when either operand is Decimal.
pub(crate) fn generic_atan2(y: &Value, x: &Value) -> Value {
    if !y.is_number() || !x.is_number() {
        return Value::Nothing;
    }
    let r = as_f64(y).atan2(as_f64(x));
    if matches!(y, Value::Decimal(_)) || matches!(x, Value::Decimal(_)) {
        return decimal_from_f64(r).map(Value::Decimal).unwrap_or(Value::Double(r));
    }
    Value::Double(r)
}

/// exp, ln, log10 and sqrt with decimal precision for Decimal inputs.
#[derive(Clone, Copy)]
pub(crate) enum Transcendental {
    Exp,
    Ln,
    Log10,
    Sqrt,
}

pub(crate) fn generic_transcendental(v: &Value, kind: Transcendental) -> Value {
    if let Value::Decimal(d) = v {
        let r = match kind {
            Transcendental::Exp => d.checked_exp(),
            Transcendental::Ln if d.is_sign_positive() && !d.is_zero() => d.checked_ln(),
            Transcendental::Log10 if d.is_sign_positive() && !d.is_zero() => d.checked_log10(),
            Transcendental::Sqrt => d.sqrt(),
            _ => None,
        };
        return r.map(Value::Decimal).unwrap_or(Value::Nothing);
    }
    if !v.is_number() {
        return Value::Nothing;
    }
    let x = as_f64(v);
    let domain_ok = match kind {
        Transcendental::Exp => true,
        Transcendental::Ln | Transcendental::Log10 => x > 0.0,
        Transcendental::Sqrt => x >= 0.0,
    };
    if !domain_ok {
        return Value::Nothing;
    }
    Value::Double(match kind {
        Transcendental::Exp => x.exp(),
        Transcendental::Ln => x.ln(),
        Transcendental::Log10 => x.log10(),
        Transcendental::Sqrt => x.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_promotes_on_overflow() {
        assert_eq!(generic_add(&Value::Int32(1), &Value::Int32(2)).unwrap(), Value::Int32(3));
        assert_eq!(
            generic_add(&Value::Int32(i32::MAX), &Value::Int32(1)).unwrap(),
            Value::Int64(i64::from(i32::MAX) + 1)
        );
        let big = generic_add(&Value::Int64(i64::MAX), &Value::Int64(1)).unwrap();
        assert_eq!(big.tag(), TypeTag::NumberDecimal);
        assert_eq!(generic_add(&Value::Int32(1), &Value::Double(0.5)).unwrap(), Value::Double(1.5));
    }

    #[test]
    fn test_absent_and_mismatched_operands() {
        assert!(generic_add(&Value::Nothing, &Value::Int32(5)).unwrap().is_nothing());
        assert!(generic_mul(&Value::string("a"), &Value::Int32(5)).unwrap().is_nothing());
        assert!(generic_sub(&Value::Int32(5), &Value::Date(1)).unwrap().is_nothing());
    }

    #[test]
    fn test_date_arithmetic() {
        assert_eq!(generic_add(&Value::Date(1000), &Value::Int32(5)).unwrap(), Value::Date(1005));
        assert_eq!(generic_sub(&Value::Date(1000), &Value::Date(400)).unwrap(), Value::Int64(600));
        let err = generic_add(&Value::Date(i64::MAX), &Value::Int64(1)).unwrap_err();
        assert_eq!(err.code(), 15);
    }

    #[test]
    fn test_division() {
        assert_eq!(generic_div(&Value::Int32(7), &Value::Int32(2)).unwrap(), Value::Double(3.5));
        assert_eq!(generic_div(&Value::Int32(1), &Value::Int64(0)).unwrap_err(), Error::DivideByZero);
        let d = generic_div(&Value::Decimal(Decimal::from(1)), &Value::Int32(4)).unwrap();
        assert_eq!(d, Value::Decimal(Decimal::new(25, 2)));
        assert_eq!(generic_mod(&Value::Int32(7), &Value::Int32(0)).unwrap_err().code(), 4848403);
        assert_eq!(generic_mod(&Value::Int64(7), &Value::Int32(4)).unwrap(), Value::Int64(3));
    }

    #[test]
    fn test_negate_and_not() {
        assert_eq!(generic_negate(&Value::Int32(4)).unwrap(), Value::Int32(-4));
        assert_eq!(generic_negate(&Value::Int32(i32::MIN)).unwrap(), Value::Int64(2147483648));
        assert!(generic_negate(&Value::string("x")).unwrap().is_nothing());
        assert_eq!(generic_not(&Value::Boolean(true)), Value::Boolean(false));
        assert!(generic_not(&Value::Int32(0)).is_nothing());
    }

    #[test]
    fn test_num_convert() {
        assert_eq!(generic_num_convert(&Value::Double(42.0), TypeTag::NumberInt32).unwrap(), Value::Int32(42));
        let err = generic_num_convert(&Value::Double(1e20), TypeTag::NumberInt32).unwrap_err();
        assert_eq!(err.code(), 4822850);
        assert!(generic_num_convert(&Value::Double(1.5), TypeTag::NumberInt64).is_err());
        assert!(generic_num_convert(&Value::Int64(i64::MAX), TypeTag::NumberDouble).is_err());
        assert_eq!(
            generic_num_convert(&Value::Double(0.1), TypeTag::NumberDecimal).unwrap(),
            Value::Decimal(Decimal::new(1, 1))
        );
        assert!(generic_num_convert(&Value::string("1"), TypeTag::NumberInt32).unwrap().is_nothing());
    }

    #[test]
    fn test_compare() {
        assert_eq!(generic_compare(CompareOp::Less, &Value::Int32(1), &Value::Double(1.5)), Value::Boolean(true));
        assert_eq!(generic_compare(CompareOp::Eq, &Value::Int64(2), &Value::Int32(2)), Value::Boolean(true));
        assert!(generic_compare(CompareOp::Eq, &Value::Nothing, &Value::Int32(2)).is_nothing());
        let set_a = Value::array_set(vec![Value::Int32(1)]);
        let set_b = Value::array_set(vec![Value::Int32(2)]);
        assert_eq!(generic_compare(CompareOp::Less, &set_a, &set_b), Value::Boolean(false));
        assert_eq!(generic_compare(CompareOp::Neq, &set_a, &set_b), Value::Boolean(true));
        assert_eq!(generic_cmp3w(&Value::string("b"), &Value::string("a")), Value::Int32(1));
        assert!(generic_cmp3w(&set_a, &set_b).is_nothing());
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(generic_abs(&Value::Int32(-3)), Value::Int32(3));
        assert_eq!(generic_abs(&Value::Int32(i32::MIN)), Value::Int64(2147483648));
        assert_eq!(generic_round(&Value::Double(2.5), Rounding::Floor), Value::Double(2.0));
        assert_eq!(generic_round(&Value::Double(-2.5), Rounding::Trunc), Value::Double(-2.0));
        assert!(generic_transcendental(&Value::Int32(-1), Transcendental::Sqrt).is_nothing());
        assert_eq!(generic_transcendental(&Value::Int32(100), Transcendental::Log10), Value::Double(2.0));
        assert!(generic_float_fn(&Value::Double(2.0), f64::acos).is_nothing());
    }
}
