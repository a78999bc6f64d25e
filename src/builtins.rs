//! Builtins module: native implementations of the builtin-table functions.
//!
//! Arguments are read in place from the operand stack, argument `i` sitting
//! `i` entries below the top. Each builtin computes a fresh result; the
//! interpreter pops the arguments afterwards.

use crate::arith::{
    as_decimal, exact_i64, generic_abs, generic_atan2, generic_float_fn, generic_round,
    generic_transcendental, Rounding, Transcendental,
};
use crate::datetime::{date_parts, format_iso_date, iso_date_parts, TimeZoneDatabase};
use crate::ir::Builtin;
use crate::types::{
    compare_value, copy_value, push_unique, CompiledRegex, KeyPart, KeyString, Value,
};
use crate::vm::Vm;
use crate::{Error, Result};
use indexmap::IndexMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// How `bitTestPosition` combines the tested bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitTest {
    AllSet,
    AllClear,
    AnySet,
    AnyClear,
}

impl BitTest {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BitTest::AllSet),
            1 => Some(BitTest::AllClear),
            2 => Some(BitTest::AnySet),
            3 => Some(BitTest::AnyClear),
            _ => None,
        }
    }
}

impl Vm {
    /// Runs `builtin` over the top `arity` stack entries and returns the
    /// result with its ownership flag.
    pub(crate) fn dispatch_builtin(&mut self, builtin: Builtin, arity: usize) -> Result<(bool, Value)> {
        let result = match builtin {
            Builtin::Split => self.builtin_split()?,
            Builtin::RegexCompile => self.builtin_regex_compile()?,
            Builtin::RegexMatch => self.builtin_regex_match()?,
            Builtin::DropFields => self.builtin_drop_fields(arity)?,
            Builtin::NewObj => self.builtin_new_obj(arity)?,
            Builtin::KsToString => match self.arg(0)? {
                Value::KeyString(ks) => Value::string(&ks.to_string()),
                _ => Value::Nothing,
            },
            Builtin::NewKs => self.builtin_new_ks(arity)?,
            Builtin::Abs => generic_abs(self.arg(0)?),
            Builtin::Ceil => generic_round(self.arg(0)?, Rounding::Ceil),
            Builtin::Floor => generic_round(self.arg(0)?, Rounding::Floor),
            Builtin::Trunc => generic_round(self.arg(0)?, Rounding::Trunc),
            Builtin::Exp => generic_transcendental(self.arg(0)?, Transcendental::Exp),
            Builtin::Ln => generic_transcendental(self.arg(0)?, Transcendental::Ln),
            Builtin::Log10 => generic_transcendental(self.arg(0)?, Transcendental::Log10),
            Builtin::Sqrt => generic_transcendental(self.arg(0)?, Transcendental::Sqrt),
            Builtin::AddToArray => self.builtin_add_to_array()?,
            Builtin::AddToSet => self.builtin_add_to_set()?,
            Builtin::DoubleDoubleSum => {
                let args = self.args(arity)?;
                double_double_sum(&args)?
            }
            Builtin::BitTestZero => self.builtin_bit_test_mask(|mask, v| mask & v == 0)?,
            Builtin::BitTestMask => self.builtin_bit_test_mask(|mask, v| mask & v == mask)?,
            Builtin::BitTestPosition => self.builtin_bit_test_position()?,
            Builtin::ToUpper => match self.arg(0)?.as_str() {
                Some(s) => Value::string(&s.to_ascii_uppercase()),
                None => Value::Nothing,
            },
            Builtin::ToLower => match self.arg(0)?.as_str() {
                Some(s) => Value::string(&s.to_ascii_lowercase()),
                None => Value::Nothing,
            },
            Builtin::CoerceToString => coerce_to_string(self.arg(0)?),
            Builtin::Acos => generic_float_fn(self.arg(0)?, f64::acos),
            Builtin::Acosh => generic_float_fn(self.arg(0)?, f64::acosh),
            Builtin::Asin => generic_float_fn(self.arg(0)?, f64::asin),
            Builtin::Asinh => generic_float_fn(self.arg(0)?, f64::asinh),
            Builtin::Atan => generic_float_fn(self.arg(0)?, f64::atan),
            Builtin::Atanh => generic_float_fn(self.arg(0)?, f64::atanh),
            Builtin::Atan2 => generic_atan2(self.arg(0)?, self.arg(1)?),
            Builtin::Cos => generic_float_fn(self.arg(0)?, f64::cos),
            Builtin::Cosh => generic_float_fn(self.arg(0)?, f64::cosh),
            Builtin::DegreesToRadians => generic_float_fn(self.arg(0)?, f64::to_radians),
            Builtin::RadiansToDegrees => generic_float_fn(self.arg(0)?, f64::to_degrees),
            Builtin::Sin => generic_float_fn(self.arg(0)?, f64::sin),
            Builtin::Sinh => generic_float_fn(self.arg(0)?, f64::sinh),
            Builtin::Tan => generic_float_fn(self.arg(0)?, f64::tan),
            Builtin::Tanh => generic_float_fn(self.arg(0)?, f64::tanh),
            Builtin::Concat => self.builtin_concat(arity)?,
            Builtin::IsMember => {
                let input = self.arg(0)?;
                match self.arg(1)?.as_array() {
                    Some(items) => Value::Boolean(
                        items.iter().any(|v| compare_value(input, v) == Some(Ordering::Equal)),
                    ),
                    None => Value::Nothing,
                }
            }
            Builtin::IndexOfBytes => self.builtin_index_of(arity, index_of_bytes)?,
            Builtin::IndexOfCP => self.builtin_index_of(arity, index_of_code_point)?,
            Builtin::IsTimezone => match self.arg(0)? {
                Value::TimeZoneDb(db) => {
                    Value::Boolean(self.arg(1)?.as_str().is_some_and(|name| db.is_time_zone_identifier(name)))
                }
                _ => Value::Nothing,
            },
            Builtin::DateToParts => self.builtin_date_to_parts(false)?,
            Builtin::IsoDateToParts => self.builtin_date_to_parts(true)?,
        };
        Ok((result.is_heap(), result))
    }

    fn arg(&self, idx: usize) -> Result<&Value> {
        self.get_from_stack(idx).map(|(_, v)| v)
    }

    fn args(&self, arity: usize) -> Result<Vec<&Value>> {
        (0..arity).map(|idx| self.arg(idx)).collect()
    }

    fn builtin_split(&self) -> Result<Value> {
        let (Some(input), Some(separator)) = (self.arg(0)?.as_str(), self.arg(1)?.as_str()) else {
            return Ok(Value::Nothing);
        };
        if separator.is_empty() {
            return Ok(Value::array(vec![Value::string(input)]));
        }
        Ok(Value::array(input.split(separator).map(Value::string).collect()))
    }

    fn builtin_regex_compile(&self) -> Result<Value> {
        let (Some(pattern), Some(flags)) = (self.arg(0)?.as_str(), self.arg(1)?.as_str()) else {
            return Ok(Value::Nothing);
        };
        Ok(Value::RegexCompiled(Arc::new(CompiledRegex::new(pattern, flags)?)))
    }

    fn builtin_regex_match(&self) -> Result<Value> {
        let Some(input) = self.arg(1)?.as_str() else {
            return Ok(Value::Nothing);
        };
        match self.arg(0)? {
            Value::RegexCompiled(regex) => Ok(Value::Boolean(regex.is_match(input))),
            Value::RegexBson { pattern, flags } => {
                Ok(Value::Boolean(CompiledRegex::new(pattern, flags)?.is_match(input)))
            }
            _ => Ok(Value::Nothing),
        }
    }

    fn builtin_drop_fields(&self, arity: usize) -> Result<Value> {
        let Some(object) = self.arg(0)?.as_object() else {
            return Ok(Value::Nothing);
        };
        let mut dropped = HashSet::with_capacity(arity.saturating_sub(1));
        for idx in 1..arity {
            match self.arg(idx)?.as_str() {
                Some(name) => dropped.insert(name),
                None => return Ok(Value::Nothing),
            };
        }
        Ok(Value::object(
            object
                .iter()
                .filter(|(name, _)| !dropped.contains(name.as_str()))
                .map(|(name, v)| (name.clone(), copy_value(v))),
        ))
    }

    fn builtin_new_obj(&self, arity: usize) -> Result<Value> {
        let mut fields = IndexMap::with_capacity(arity / 2);
        for idx in (0..arity).step_by(2) {
            let Some(name) = self.arg(idx)?.as_str() else {
                return Ok(Value::Nothing);
            };
            fields.insert(name.to_string(), copy_value(self.arg(idx + 1)?));
        }
        Ok(Value::Object(Arc::new(fields)))
    }

    fn builtin_new_ks(&self, arity: usize) -> Result<Value> {
        let version = match exact_i64(self.arg(0)?) {
            Some(v @ (0 | 1)) => v as u8,
            _ => return Ok(Value::Nothing),
        };
        let ordering = match exact_i64(self.arg(1)?).and_then(|o| i32::try_from(o).ok()) {
            Some(o) => o as u32,
            None => return Ok(Value::Nothing),
        };
        let discriminator = match exact_i64(self.arg(arity - 1)?) {
            Some(d @ 0..=2) => d as u8,
            _ => return Ok(Value::Nothing),
        };
        let mut parts = Vec::with_capacity(arity - 3);
        for idx in 2..arity - 1 {
            let part = self.arg(idx)?;
            if let Some(s) = part.as_str() {
                parts.push(KeyPart::Str(s.to_string()));
            } else if let Some(i) = exact_i64(part) {
                parts.push(KeyPart::Int(i));
            } else {
                return Err(Error::UnsupportedKeyPart(part.tag().to_string()));
            }
        }
        Ok(Value::KeyString(Arc::new(KeyString::new(version, ordering, parts, discriminator))))
    }

    fn builtin_add_to_array(&mut self) -> Result<Value> {
        let field = copy_value(self.arg(1)?);
        let (_, acc) = self.take_from_stack(0)?;
        let mut items = match acc {
            Value::Nothing => Arc::new(Vec::new()),
            Value::Array(items) => items,
            _ => return Ok(Value::Nothing),
        };
        if !field.is_nothing() {
            Arc::make_mut(&mut items).push(field);
        }
        Ok(Value::Array(items))
    }

    fn builtin_add_to_set(&mut self) -> Result<Value> {
        let field = copy_value(self.arg(1)?);
        let (_, acc) = self.take_from_stack(0)?;
        let mut items = match acc {
            Value::Nothing => Arc::new(Vec::new()),
            Value::ArraySet(items) => items,
            _ => return Ok(Value::Nothing),
        };
        if !field.is_nothing() {
            push_unique(Arc::make_mut(&mut items), field);
        }
        Ok(Value::ArraySet(items))
    }

    fn builtin_bit_test_mask(&self, test: fn(i64, i64) -> bool) -> Result<Value> {
        match (exact_i64(self.arg(0)?), exact_i64(self.arg(1)?)) {
            (Some(mask), Some(value)) => Ok(Value::Boolean(test(mask, value))),
            _ => Ok(Value::Nothing),
        }
    }

    fn builtin_bit_test_position(&self) -> Result<Value> {
        let (Some(positions), Value::BinData(bytes)) = (self.arg(0)?.as_array(), self.arg(1)?) else {
            return Ok(Value::Nothing);
        };
        let behavior_arg = self.arg(2)?;
        let behavior = match behavior_arg {
            Value::Int32(code) => BitTest::from_code(*code),
            _ => None,
        }
        .ok_or_else(|| Error::InvalidBitTest(format!("unknown behavior {}", behavior_arg)))?;

        for position in positions {
            let pos = exact_i64(position)
                .filter(|p| *p >= 0)
                .ok_or_else(|| Error::InvalidBitTest(format!("bit position {}", position)))?;
            let is_set = usize::try_from(pos / 8)
                .ok()
                .and_then(|idx| bytes.get(idx))
                .is_some_and(|byte| byte & (1u8 << (pos % 8)) != 0);
            match behavior {
                BitTest::AllSet if !is_set => return Ok(Value::Boolean(false)),
                BitTest::AllClear if is_set => return Ok(Value::Boolean(false)),
                BitTest::AnySet if is_set => return Ok(Value::Boolean(true)),
                BitTest::AnyClear if !is_set => return Ok(Value::Boolean(true)),
                _ => {}
            }
        }
        Ok(Value::Boolean(matches!(behavior, BitTest::AllSet | BitTest::AllClear)))
    }

    fn builtin_concat(&self, arity: usize) -> Result<Value> {
        let mut out = String::new();
        for idx in 0..arity {
            match self.arg(idx)?.as_str() {
                Some(s) => out.push_str(s),
                None => return Ok(Value::Nothing),
            }
        }
        Ok(Value::string(&out))
    }

    fn builtin_index_of(&self, arity: usize, search: fn(&str, &str, usize, usize) -> i64) -> Result<Value> {
        let (Some(haystack), Some(needle)) = (self.arg(0)?.as_str(), self.arg(1)?.as_str()) else {
            return Ok(Value::Nothing);
        };
        let start = match self.arg(2)? {
            Value::Int64(s) if *s >= 0 => *s as u64,
            _ => return Ok(Value::Nothing),
        };
        if start > haystack.len() as u64 {
            return Ok(Value::Int32(-1));
        }
        let end = if arity >= 4 {
            match self.arg(3)? {
                Value::Int64(e) if *e >= 0 => *e as u64,
                _ => return Ok(Value::Nothing),
            }
        } else {
            haystack.len() as u64
        };
        if end < start {
            return Ok(Value::Int32(-1));
        }
        let end = usize::try_from(end).unwrap_or(usize::MAX);
        Ok(index_value(search(haystack, needle, start as usize, end)))
    }

    fn builtin_date_to_parts(&self, iso: bool) -> Result<Value> {
        let Value::TimeZoneDb(db) = self.arg(0)? else {
            return Ok(Value::Nothing);
        };
        let Some(zone) = self.arg(2)?.as_str() else {
            return Ok(Value::Nothing);
        };
        let Some(millis) = date_millis(self.arg(1)?) else {
            return Ok(Value::Nothing);
        };
        Ok(if iso {
            iso_parts_object(db, millis, zone)
        } else {
            parts_object(db, millis, zone)
        })
    }
}

fn index_value(idx: i64) -> Value {
    i32::try_from(idx).map(Value::Int32).unwrap_or(Value::Int64(idx))
}

/// Byte offset of `needle` within `haystack[..end]` at or after `start`, or -1.
fn index_of_bytes(haystack: &str, needle: &str, start: usize, end: usize) -> i64 {
    let hay = &haystack.as_bytes()[..end.min(haystack.len())];
    let needle = needle.as_bytes();
    if needle.len() > hay.len() {
        return -1;
    }
    (start..=hay.len() - needle.len())
        .find(|&i| &hay[i..i + needle.len()] == needle)
        .map_or(-1, |i| i as i64)
}

/// Code point offset of the first match starting in `[start, end)`, or -1.
fn index_of_code_point(haystack: &str, needle: &str, start: usize, end: usize) -> i64 {
    if start == 0 && haystack.is_empty() && needle.is_empty() {
        return 0;
    }
    let offsets: Vec<usize> = haystack.char_indices().map(|(byte, _)| byte).collect();
    let end = end.min(offsets.len());
    (start..end)
        .find(|&cp| haystack.as_bytes()[offsets[cp]..].starts_with(needle.as_bytes()))
        .map_or(-1, |cp| cp as i64)
}

/// Milliseconds since the epoch of a date-like value.
fn date_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Date(millis) => Some(*millis),
        Value::Timestamp(ts) => Some(((ts >> 32) as i64) * 1000),
        Value::ObjectId(oid) => {
            let secs = u32::from_be_bytes([oid[0], oid[1], oid[2], oid[3]]);
            Some(i64::from(secs) * 1000)
        }
        _ => None,
    }
}

fn parts_object(db: &TimeZoneDatabase, millis: i64, zone: &str) -> Value {
    match date_parts(db, millis, zone) {
        Some(p) => Value::object([
            ("year", Value::Int32(p.year)),
            ("month", Value::Int32(p.month)),
            ("day", Value::Int32(p.day)),
            ("hour", Value::Int32(p.hour)),
            ("minute", Value::Int32(p.minute)),
            ("second", Value::Int32(p.second)),
            ("millisecond", Value::Int32(p.millisecond)),
        ]),
        None => Value::Nothing,
    }
}

fn iso_parts_object(db: &TimeZoneDatabase, millis: i64, zone: &str) -> Value {
    match iso_date_parts(db, millis, zone) {
        Some(p) => Value::object([
            ("isoWeekYear", Value::Int32(p.iso_week_year)),
            ("isoWeek", Value::Int32(p.iso_week)),
            ("isoDayOfWeek", Value::Int32(p.iso_day_of_week)),
            ("hour", Value::Int32(p.hour)),
            ("minute", Value::Int32(p.minute)),
            ("second", Value::Int32(p.second)),
            ("millisecond", Value::Int32(p.millisecond)),
        ]),
        None => Value::Nothing,
    }
}

fn coerce_to_string(value: &Value) -> Value {
    match value {
        Value::StringSmall(_) | Value::StringBig(_) => value.clone(),
        Value::Int32(i) => Value::string(&i.to_string()),
        Value::Int64(i) => Value::string(&i.to_string()),
        Value::Double(d) => Value::string(&d.to_string()),
        Value::Decimal(d) => Value::string(&d.to_string()),
        Value::Date(millis) => format_iso_date(*millis).map(Value::from).unwrap_or(Value::Nothing),
        Value::Timestamp(ts) => Value::string(&format!("Timestamp({}, {})", ts >> 32, ts & 0xffff_ffff)),
        Value::Null => Value::string(""),
        _ => Value::Nothing,
    }
}

/// Sums numbers without intermediate rounding of integer terms and with
/// compensated summation of doubles. At most one date may appear; the sum
/// is then a date.
fn double_double_sum(args: &[&Value]) -> Result<Value> {
    let mut has_date = false;
    let mut has_double = false;
    let mut has_decimal = false;
    for arg in args {
        match arg {
            Value::Date(_) if has_date => return Err(Error::MultipleDates),
            Value::Date(_) => has_date = true,
            Value::Int32(_) | Value::Int64(_) => {}
            Value::Double(_) => has_double = true,
            Value::Decimal(_) => has_decimal = true,
            _ => return Ok(Value::Nothing),
        }
    }

    if has_decimal {
        if let Some(sum) = decimal_sum(args) {
            if has_date {
                return sum.round().to_i64().map(Value::Date).ok_or(Error::DateOverflow);
            }
            return Ok(Value::Decimal(sum));
        }
    }

    let mut ints: i128 = 0;
    let (mut sum, mut compensation) = (0.0f64, 0.0f64);
    for arg in args {
        match arg {
            Value::Int32(i) => ints += i128::from(*i),
            Value::Int64(i) | Value::Date(i) => ints += i128::from(*i),
            Value::Double(d) => {
                let y = d - compensation;
                let t = sum + y;
                compensation = (t - sum) - y;
                sum = t;
            }
            Value::Decimal(d) => {
                let y = d.to_f64().unwrap_or(f64::NAN) - compensation;
                let t = sum + y;
                compensation = (t - sum) - y;
                sum = t;
            }
            _ => {}
        }
    }

    if has_date {
        if has_double || has_decimal {
            let total = (ints as f64 + sum).round();
            if total.is_finite() && (-TWO_POW_63..TWO_POW_63).contains(&total) {
                return Ok(Value::Date(total as i64));
            }
            return Err(Error::DateOverflow);
        }
        return i64::try_from(ints).map(Value::Date).map_err(|_| Error::DateOverflow);
    }
    if has_double || has_decimal {
        return Ok(Value::Double(ints as f64 + sum));
    }
    Ok(i32::try_from(ints)
        .map(Value::Int32)
        .or_else(|_| i64::try_from(ints).map(Value::Int64))
        .unwrap_or(Value::Double(ints as f64)))
}

fn decimal_sum(args: &[&Value]) -> Option<Decimal> {
    args.iter().try_fold(Decimal::ZERO, |acc, arg| {
        let term = match arg {
            Value::Date(millis) => Decimal::from(*millis),
            other => as_decimal(other)?,
        };
        acc.checked_add(term)
    })
}
