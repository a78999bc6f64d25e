//! Types module: the tagged value model shared by the compiler and the VM.
//!
//! A [`Value`] carries its [`TypeTag`] in the enum discriminant. Heap backed
//! payloads live behind reference counted handles, so cloning a value yields a
//! cheap view of the same storage while [`copy_value`] produces an independent
//! deep copy. Ownership on the VM stack is tracked by a flag stored next to the
//! value, not inside it.

use crate::datetime::TimeZoneDatabase;
use crate::{Error, Result};
use indexmap::IndexMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Runtime type discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    Nothing = 0,
    Null,
    Boolean,
    NumberInt32,
    NumberInt64,
    NumberDouble,
    NumberDecimal,
    Date,
    Timestamp,
    StringSmall,
    StringBig,
    Array,
    ArraySet,
    Object,
    ObjectId,
    RecordId,
    BinData,
    RegexBson,
    RegexCompiled,
    KeyString,
    MinKey,
    MaxKey,
    TimeZoneDb,
}

pub const NUMBER_MASK: u32 = TypeTag::NumberInt32.mask()
    | TypeTag::NumberInt64.mask()
    | TypeTag::NumberDouble.mask()
    | TypeTag::NumberDecimal.mask();
pub const STRING_MASK: u32 = TypeTag::StringSmall.mask() | TypeTag::StringBig.mask();
pub const ARRAY_MASK: u32 = TypeTag::Array.mask() | TypeTag::ArraySet.mask();
pub const OBJECT_MASK: u32 = TypeTag::Object.mask();
pub const REGEX_MASK: u32 = TypeTag::RegexBson.mask() | TypeTag::RegexCompiled.mask();
pub const DATE_MASK: u32 = TypeTag::Date.mask() | TypeTag::Timestamp.mask();

impl TypeTag {
    /// Single bit identifying this tag in a type-match bitmask.
    pub const fn mask(self) -> u32 {
        1u32 << (self as u8)
    }

    pub fn is_number(self) -> bool {
        self.mask() & NUMBER_MASK != 0
    }

    pub fn is_string(self) -> bool {
        self.mask() & STRING_MASK != 0
    }

    pub fn is_array(self) -> bool {
        self.mask() & ARRAY_MASK != 0
    }

    pub fn is_object(self) -> bool {
        self == TypeTag::Object
    }

    /// Position of numeric tags on the widening ladder Int32 < Int64 < Double < Decimal.
    pub(crate) fn numeric_rank(self) -> Option<u8> {
        match self {
            TypeTag::NumberInt32 => Some(0),
            TypeTag::NumberInt64 => Some(1),
            TypeTag::NumberDouble => Some(2),
            TypeTag::NumberDecimal => Some(3),
            _ => None,
        }
    }

    /// Bracket of the cross-type collation order. Opaque handles have none.
    fn canonical_order(self) -> Option<u8> {
        match self {
            TypeTag::Nothing => Some(0),
            TypeTag::MinKey => Some(1),
            TypeTag::Null => Some(5),
            TypeTag::NumberInt32
            | TypeTag::NumberInt64
            | TypeTag::NumberDouble
            | TypeTag::NumberDecimal => Some(10),
            TypeTag::StringSmall | TypeTag::StringBig => Some(15),
            TypeTag::Object => Some(20),
            TypeTag::Array | TypeTag::ArraySet => Some(25),
            TypeTag::BinData => Some(30),
            TypeTag::ObjectId => Some(35),
            TypeTag::Boolean => Some(40),
            TypeTag::Date => Some(45),
            TypeTag::Timestamp => Some(47),
            TypeTag::RegexBson => Some(50),
            TypeTag::MaxKey => Some(127),
            TypeTag::RecordId | TypeTag::RegexCompiled | TypeTag::KeyString | TypeTag::TimeZoneDb => None,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Longest string stored inline without a heap allocation.
pub const SMALL_STRING_CAPACITY: usize = 15;

/// Inline UTF-8 string of at most [`SMALL_STRING_CAPACITY`] bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmallString {
    len: u8,
    bytes: [u8; SMALL_STRING_CAPACITY],
}

impl SmallString {
    pub fn new(s: &str) -> Option<Self> {
        if s.len() > SMALL_STRING_CAPACITY {
            return None;
        }
        let mut bytes = [0u8; SMALL_STRING_CAPACITY];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Some(Self { len: s.len() as u8, bytes })
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from a complete &str.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl fmt::Debug for SmallString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// A regular expression compiled once and shared by every row that uses it.
#[derive(Debug, Clone)]
pub struct CompiledRegex {
    pattern: String,
    flags: String,
    regex: regex::Regex,
}

impl CompiledRegex {
    /// Compiles `pattern` with BSON style option letters (`i`, `m`, `s`, `x`).
    pub fn new(pattern: &str, flags: &str) -> Result<Self> {
        let mut inline = String::new();
        for flag in flags.chars() {
            match flag {
                'i' | 'm' | 's' | 'x' => inline.push(flag),
                other => return Err(Error::InvalidRegex(format!("unsupported option '{}'", other))),
            }
        }
        let source = if inline.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{}){}", inline, pattern)
        };
        let regex = regex::Regex::new(&source).map_err(|e| Error::InvalidRegex(e.to_string()))?;
        Ok(Self { pattern: pattern.to_string(), flags: flags.to_string(), regex })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }
}

/// One component of a [`KeyString`] sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPart {
    Int(i64),
    Str(String),
}

impl KeyPart {
    fn cmp_part(&self, other: &KeyPart) -> Ordering {
        match (self, other) {
            (KeyPart::Int(a), KeyPart::Int(b)) => a.cmp(b),
            (KeyPart::Str(a), KeyPart::Str(b)) => a.cmp(b),
            (KeyPart::Int(_), KeyPart::Str(_)) => Ordering::Less,
            (KeyPart::Str(_), KeyPart::Int(_)) => Ordering::Greater,
        }
    }
}

/// Index key encoded for ordered comparison.
///
/// Bit `i` of `ordering` marks component `i` as descending. The discriminator
/// places the key before (1), at (0) or after (2) every key with equal parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyString {
    version: u8,
    ordering: u32,
    parts: Vec<KeyPart>,
    discriminator: u8,
}

impl KeyString {
    pub fn new(version: u8, ordering: u32, parts: Vec<KeyPart>, discriminator: u8) -> Self {
        Self { version, ordering, parts, discriminator }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    fn discriminator_rank(&self) -> u8 {
        match self.discriminator {
            1 => 0,
            0 => 1,
            _ => 2,
        }
    }

    pub fn compare(&self, other: &KeyString) -> Ordering {
        for (idx, (a, b)) in self.parts.iter().zip(other.parts.iter()).enumerate() {
            let mut ord = a.cmp_part(b);
            if idx < 32 && self.ordering & (1 << idx) != 0 {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.parts
            .len()
            .cmp(&other.parts.len())
            .then_with(|| self.discriminator_rank().cmp(&other.discriminator_rank()))
    }
}

impl fmt::Display for KeyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KS(v{}", self.version)?;
        for part in &self.parts {
            match part {
                KeyPart::Int(i) => write!(f, ", {}", i)?,
                KeyPart::Str(s) => write!(f, ", {:?}", s)?,
            }
        }
        write!(f, "; d{})", self.discriminator)
    }
}

/// A tagged runtime value.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub enum Value {
    /// Absent value, distinct from a present null.
    #[default]
    Nothing,
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal(Decimal),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Timestamp(u64),
    StringSmall(SmallString),
    StringBig(Arc<str>),
    Array(Arc<Vec<Value>>),
    /// Array whose elements are pairwise distinct under [`compare_value`].
    ArraySet(Arc<Vec<Value>>),
    Object(Arc<IndexMap<String, Value>>),
    ObjectId([u8; 12]),
    RecordId(i64),
    BinData(Arc<Vec<u8>>),
    RegexBson { pattern: Arc<str>, flags: Arc<str> },
    RegexCompiled(Arc<CompiledRegex>),
    KeyString(Arc<KeyString>),
    MinKey,
    MaxKey,
    TimeZoneDb(Arc<TimeZoneDatabase>),
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Nothing => TypeTag::Nothing,
            Value::Null => TypeTag::Null,
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Int32(_) => TypeTag::NumberInt32,
            Value::Int64(_) => TypeTag::NumberInt64,
            Value::Double(_) => TypeTag::NumberDouble,
            Value::Decimal(_) => TypeTag::NumberDecimal,
            Value::Date(_) => TypeTag::Date,
            Value::Timestamp(_) => TypeTag::Timestamp,
            Value::StringSmall(_) => TypeTag::StringSmall,
            Value::StringBig(_) => TypeTag::StringBig,
            Value::Array(_) => TypeTag::Array,
            Value::ArraySet(_) => TypeTag::ArraySet,
            Value::Object(_) => TypeTag::Object,
            Value::ObjectId(_) => TypeTag::ObjectId,
            Value::RecordId(_) => TypeTag::RecordId,
            Value::BinData(_) => TypeTag::BinData,
            Value::RegexBson { .. } => TypeTag::RegexBson,
            Value::RegexCompiled(_) => TypeTag::RegexCompiled,
            Value::KeyString(_) => TypeTag::KeyString,
            Value::MinKey => TypeTag::MinKey,
            Value::MaxKey => TypeTag::MaxKey,
            Value::TimeZoneDb(_) => TypeTag::TimeZoneDb,
        }
    }

    /// Builds a string value, inlining it when short enough.
    pub fn string(s: &str) -> Value {
        match SmallString::new(s) {
            Some(small) => Value::StringSmall(small),
            None => Value::StringBig(Arc::from(s)),
        }
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Arc::new(values))
    }

    /// Builds an array set, dropping elements equal to an earlier one.
    pub fn array_set(values: Vec<Value>) -> Value {
        let mut set = Vec::with_capacity(values.len());
        for v in values {
            push_unique(&mut set, v);
        }
        Value::ArraySet(Arc::new(set))
    }

    pub fn object<K, I>(fields: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(Arc::new(fields.into_iter().map(|(k, v)| (k.into(), v)).collect()))
    }

    pub fn bin_data(bytes: Vec<u8>) -> Value {
        Value::BinData(Arc::new(bytes))
    }

    pub fn regex(pattern: &str, flags: &str) -> Value {
        Value::RegexBson { pattern: Arc::from(pattern), flags: Arc::from(flags) }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    pub fn is_number(&self) -> bool {
        self.tag().is_number()
    }

    pub fn is_string(&self) -> bool {
        self.tag().is_string()
    }

    /// True when the payload lives on the heap and a deep copy allocates.
    pub fn is_heap(&self) -> bool {
        matches!(
            self,
            Value::StringBig(_)
                | Value::Array(_)
                | Value::ArraySet(_)
                | Value::Object(_)
                | Value::BinData(_)
                | Value::RegexBson { .. }
                | Value::RegexCompiled(_)
                | Value::KeyString(_)
                | Value::TimeZoneDb(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::StringSmall(s) => Some(s.as_str()),
            Value::StringBig(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Elements of an array or array set.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) | Value::ArraySet(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Field lookup on objects; anything else yields `None`.
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.as_object().and_then(|o| o.get(name))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::string(&v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::array(v)
    }
}

/// Produces an independent copy whose heap storage shares nothing with `value`.
pub fn copy_value(value: &Value) -> Value {
    match value {
        Value::StringBig(s) => Value::StringBig(Arc::from(&**s)),
        Value::Array(a) => Value::Array(Arc::new(a.iter().map(copy_value).collect())),
        Value::ArraySet(a) => Value::ArraySet(Arc::new(a.iter().map(copy_value).collect())),
        Value::Object(o) => Value::Object(Arc::new(
            o.iter().map(|(k, v)| (k.clone(), copy_value(v))).collect(),
        )),
        Value::BinData(b) => Value::BinData(Arc::new(b.as_ref().clone())),
        Value::RegexBson { pattern, flags } => Value::RegexBson {
            pattern: Arc::from(&**pattern),
            flags: Arc::from(&**flags),
        },
        Value::RegexCompiled(r) => Value::RegexCompiled(Arc::new(r.as_ref().clone())),
        Value::KeyString(k) => Value::KeyString(Arc::new(k.as_ref().clone())),
        Value::TimeZoneDb(db) => Value::TimeZoneDb(Arc::new(db.as_ref().clone())),
        inline => inline.clone(),
    }
}

/// Releases an owned value. Inline values need no work; heap payloads are
/// freed once their last handle goes away.
pub fn release_value(value: Value) {
    drop(value);
}

/// Appends `value` unless an equal element is already present.
pub(crate) fn push_unique(set: &mut Vec<Value>, value: Value) -> bool {
    if value.is_nothing() || set.iter().any(|v| compare_value(v, &value) == Some(Ordering::Equal)) {
        return false;
    }
    set.push(value);
    true
}

/// Orders two values by the cross-type collation rules.
///
/// Numbers compare numerically across subtypes, values of different type
/// brackets compare by bracket, and `Nothing` sorts below everything. Returns
/// `None` when the pair is incomparable: opaque handles of different kinds, or
/// two array sets that are not equal.
pub fn compare_value(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    if lhs.is_number() && rhs.is_number() {
        return Some(compare_numbers(lhs, rhs));
    }
    if let (Some(a), Some(b)) = (lhs.as_str(), rhs.as_str()) {
        return Some(a.cmp(b));
    }
    match (lhs, rhs) {
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::ArraySet(a), Value::ArraySet(b)) => {
            let equal = a.len() == b.len()
                && a.iter().all(|x| b.iter().any(|y| compare_value(x, y) == Some(Ordering::Equal)));
            if equal {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
        (Value::Array(a) | Value::ArraySet(a), Value::Array(b) | Value::ArraySet(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match compare_value(x, y)? {
                    Ordering::Equal => continue,
                    ord => return Some(ord),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                match ka.cmp(kb) {
                    Ordering::Equal => {}
                    ord => return Some(ord),
                }
                match compare_value(va, vb)? {
                    Ordering::Equal => continue,
                    ord => return Some(ord),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        (Value::BinData(a), Value::BinData(b)) => Some(a.len().cmp(&b.len()).then_with(|| a.cmp(b))),
        (Value::ObjectId(a), Value::ObjectId(b)) => Some(a.cmp(b)),
        (
            Value::RegexBson { pattern: pa, flags: fa },
            Value::RegexBson { pattern: pb, flags: fb },
        ) => Some(pa.cmp(pb).then_with(|| fa.cmp(fb))),
        (Value::RecordId(a), Value::RecordId(b)) => Some(a.cmp(b)),
        (Value::KeyString(a), Value::KeyString(b)) => Some(a.compare(b)),
        (Value::RegexCompiled(a), Value::RegexCompiled(b)) => {
            Some(a.pattern().cmp(b.pattern()).then_with(|| a.flags().cmp(b.flags())))
        }
        _ => {
            let a = lhs.tag().canonical_order()?;
            let b = rhs.tag().canonical_order()?;
            Some(a.cmp(&b))
        }
    }
}

fn compare_numbers(lhs: &Value, rhs: &Value) -> Ordering {
    match (lhs, rhs) {
        (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
        (Value::Decimal(a), Value::Double(b)) => compare_decimal_f64(a, *b),
        (Value::Double(a), Value::Decimal(b)) => compare_decimal_f64(b, *a).reverse(),
        (Value::Decimal(a), other) => a.cmp(&Decimal::from(int_of(other))),
        (other, Value::Decimal(b)) => Decimal::from(int_of(other)).cmp(b),
        (Value::Double(a), Value::Double(b)) => compare_f64(*a, *b),
        (Value::Double(a), other) => compare_i64_f64(int_of(other), *a).reverse(),
        (other, Value::Double(b)) => compare_i64_f64(int_of(other), *b),
        (a, b) => int_of(a).cmp(&int_of(b)),
    }
}

fn int_of(v: &Value) -> i64 {
    match v {
        Value::Int32(i) => i64::from(*i),
        Value::Int64(i) => *i,
        _ => 0,
    }
}

/// NaN sorts below every other number and equal to itself.
pub(crate) fn compare_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

fn compare_i64_f64(i: i64, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Greater;
    }
    if d >= TWO_POW_63 {
        return Ordering::Less;
    }
    if d < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = d.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if d > whole => Ordering::Less,
        Ordering::Equal if d < whole => Ordering::Greater,
        ord => ord,
    }
}

fn compare_decimal_f64(a: &Decimal, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Greater;
    }
    match Decimal::from_f64(d) {
        Some(b) => a.cmp(&b),
        None if d > 0.0 => Ordering::Less,
        None => Ordering::Greater,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.as_str(), other.as_str()) {
            return a == b;
        }
        if self.tag() != other.tag() {
            return false;
        }
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Array(a), Value::Array(b)) | (Value::ArraySet(a), Value::ArraySet(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| ka == kb && va == vb)
            }
            (Value::TimeZoneDb(a), Value::TimeZoneDb(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => compare_value(self, other) == Some(Ordering::Equal),
        }
    }
}

const STRING_MAX_DISPLAY_LENGTH: usize = 160;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nothing => write!(f, "Nothing"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}L", i),
            Value::Double(d) => write!(f, "{:?}", d),
            Value::Decimal(d) => write!(f, "NumberDecimal({})", d),
            Value::Date(ms) => write!(f, "Date({})", ms),
            Value::Timestamp(ts) => write!(f, "Timestamp({}, {})", ts >> 32, ts & 0xffff_ffff),
            Value::StringSmall(_) | Value::StringBig(_) => {
                let s = self.as_str().unwrap_or_default();
                if s.len() <= STRING_MAX_DISPLAY_LENGTH {
                    write!(f, "\"{}\"", s)
                } else {
                    let mut end = STRING_MAX_DISPLAY_LENGTH;
                    while !s.is_char_boundary(end) {
                        end -= 1;
                    }
                    write!(f, "\"{}\"...", &s[..end])
                }
            }
            Value::Array(a) | Value::ArraySet(a) => {
                write!(f, "[")?;
                for (idx, v) in a.iter().enumerate() {
                    if idx != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Object(o) => {
                write!(f, "{{")?;
                for (idx, (k, v)) in o.iter().enumerate() {
                    if idx != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\" : {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::ObjectId(id) => write!(f, "ObjectId(\"{}\")", hex(id)),
            Value::RecordId(id) => write!(f, "RecordId({})", id),
            Value::BinData(b) => write!(f, "BinData({})", hex(b)),
            Value::RegexBson { pattern, flags } => write!(f, "/{}/{}", pattern, flags),
            Value::RegexCompiled(r) => write!(f, "Regex(/{}/{})", r.pattern(), r.flags()),
            Value::KeyString(k) => write!(f, "{}", k),
            Value::MinKey => write!(f, "minKey"),
            Value::MaxKey => write!(f, "maxKey"),
            Value::TimeZoneDb(_) => write!(f, "TimeZoneDatabase"),
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|h| u8::from_str_radix(h, 16).ok()))
        .collect()
}

// Serialization uses plain JSON for the types JSON can carry and
// extended-JSON wrappers (`{"$date": ..}`, `{"$numberLong": ..}`) for the rest.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        fn wrapped<S: Serializer, T: Serialize + ?Sized>(
            serializer: S,
            key: &str,
            value: &T,
        ) -> std::result::Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(1))?;
            map.serialize_entry(key, value)?;
            map.end()
        }

        match self {
            Value::Nothing => wrapped(serializer, "$nothing", &1),
            Value::Null => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Int32(i) => serializer.serialize_i32(*i),
            Value::Int64(i) => wrapped(serializer, "$numberLong", &i.to_string()),
            Value::Double(d) => serializer.serialize_f64(*d),
            Value::Decimal(d) => wrapped(serializer, "$numberDecimal", &d.to_string()),
            Value::Date(ms) => wrapped(serializer, "$date", ms),
            Value::Timestamp(ts) => wrapped(serializer, "$timestamp", ts),
            Value::StringSmall(_) | Value::StringBig(_) => {
                serializer.serialize_str(self.as_str().unwrap_or_default())
            }
            Value::Array(a) | Value::ArraySet(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for v in a.iter() {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Object(o) => {
                let mut map = serializer.serialize_map(Some(o.len()))?;
                for (k, v) in o.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::ObjectId(id) => wrapped(serializer, "$oid", &hex(id)),
            Value::RecordId(id) => wrapped(serializer, "$recordId", id),
            Value::BinData(b) => wrapped(serializer, "$binary", &hex(b)),
            Value::RegexBson { pattern, flags } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("$regex", &**pattern)?;
                map.serialize_entry("$options", &**flags)?;
                map.end()
            }
            Value::MinKey => wrapped(serializer, "$minKey", &1),
            Value::MaxKey => wrapped(serializer, "$maxKey", &1),
            Value::RegexCompiled(_) | Value::KeyString(_) | Value::TimeZoneDb(_) => Err(
                serde::ser::Error::custom(format!("{} values cannot be serialized", self.tag())),
            ),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a JSON or extended-JSON value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Boolean(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(match i32::try_from(v) {
            Ok(small) => Value::Int32(small),
            Err(_) => Value::Int64(v),
        })
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        match i64::try_from(v) {
            Ok(signed) => self.visit_i64(signed),
            Err(_) => Ok(Value::Double(v as f64)),
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::string(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(v) = seq.next_element::<Value>()? {
            values.push(v);
        }
        Ok(Value::array(values))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut fields = IndexMap::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            fields.insert(k, v);
        }
        from_extended(fields).map_err(de::Error::custom)
    }
}

fn from_extended(fields: IndexMap<String, Value>) -> std::result::Result<Value, String> {
    let Some((key, inner)) = fields.first() else {
        return Ok(Value::Object(Arc::new(fields)));
    };
    let as_i64 = |v: &Value| match v {
        Value::Int32(i) => Some(i64::from(*i)),
        Value::Int64(i) => Some(*i),
        _ => None,
    };
    let bad = |what: &str| format!("malformed {} value", what);
    if fields.len() == 2 && key == "$regex" {
        let pattern = inner.as_str().ok_or_else(|| bad("$regex"))?;
        let flags = fields
            .get("$options")
            .and_then(Value::as_str)
            .ok_or_else(|| bad("$regex"))?;
        return Ok(Value::regex(pattern, flags));
    }
    if fields.len() != 1 {
        return Ok(Value::Object(Arc::new(fields)));
    }
    let value = match key.as_str() {
        "$nothing" => Value::Nothing,
        "$numberLong" => Value::Int64(
            inner.as_str().and_then(|s| s.parse().ok()).ok_or_else(|| bad(key.as_str()))?,
        ),
        "$numberDecimal" => Value::Decimal(
            inner.as_str().and_then(|s| s.parse().ok()).ok_or_else(|| bad(key.as_str()))?,
        ),
        "$date" => Value::Date(as_i64(inner).ok_or_else(|| bad(key.as_str()))?),
        "$timestamp" => Value::Timestamp(
            as_i64(inner).and_then(|i| u64::try_from(i).ok()).ok_or_else(|| bad(key.as_str()))?,
        ),
        "$oid" => {
            let bytes = inner.as_str().and_then(unhex).ok_or_else(|| bad(key.as_str()))?;
            Value::ObjectId(bytes.try_into().map_err(|_| bad(key.as_str()))?)
        }
        "$recordId" => Value::RecordId(as_i64(inner).ok_or_else(|| bad(key.as_str()))?),
        "$binary" => Value::bin_data(inner.as_str().and_then(unhex).ok_or_else(|| bad(key.as_str()))?),
        "$minKey" => Value::MinKey,
        "$maxKey" => Value::MaxKey,
        _ => return Ok(Value::Object(Arc::new(fields))),
    };
    Ok(value)
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json;

    fn big(s: &str) -> Value {
        Value::StringBig(Arc::from(s))
    }

    #[test]
    fn test_string_representation_choice() {
        assert_eq!(Value::string("short").tag(), TypeTag::StringSmall);
        assert_eq!(Value::string("a considerably longer string").tag(), TypeTag::StringBig);
        assert_eq!(Value::string("short"), big("short"));
    }

    #[test]
    fn test_copy_value_is_independent() {
        let original = Value::string("a big string that lives on the heap");
        let copy = copy_value(&original);
        match (&original, &copy) {
            (Value::StringBig(a), Value::StringBig(b)) => assert!(!Arc::ptr_eq(a, b)),
            _ => panic!("expected big strings"),
        }
        release_value(original);
        assert_eq!(copy.as_str(), Some("a big string that lives on the heap"));
    }

    #[test]
    fn test_copy_value_nested() {
        let inner = Value::array(vec![Value::Int32(1), Value::string("x")]);
        let obj = Value::object([("a", inner.clone())]);
        let copy = copy_value(&obj);
        assert_eq!(copy, obj);
        if let (Some(Value::Array(a)), Value::Array(b)) = (copy.get_field("a"), &inner) {
            assert!(!Arc::ptr_eq(a, b));
        } else {
            panic!("expected arrays");
        }
    }

    #[test]
    fn test_numbers_compare_across_subtypes() {
        assert_eq!(compare_value(&Value::Int32(3), &Value::Int64(3)), Some(Ordering::Equal));
        assert_eq!(compare_value(&Value::Int32(3), &Value::Double(3.5)), Some(Ordering::Less));
        assert_eq!(compare_value(&Value::Double(-3.5), &Value::Int64(-3)), Some(Ordering::Less));
        assert_eq!(
            compare_value(&Value::Decimal(Decimal::new(25, 1)), &Value::Double(2.5)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            compare_value(&Value::Int64(i64::MAX), &Value::Double(1e19)),
            Some(Ordering::Less)
        );
        assert_eq!(compare_value(&Value::Double(f64::NAN), &Value::Int32(0)), Some(Ordering::Less));
    }

    #[test]
    fn test_cross_type_collation() {
        assert_eq!(compare_value(&Value::Null, &Value::Int32(0)), Some(Ordering::Less));
        assert_eq!(compare_value(&Value::Int32(100), &Value::string("a")), Some(Ordering::Less));
        assert_eq!(compare_value(&Value::Boolean(false), &Value::Date(0)), Some(Ordering::Less));
        assert_eq!(compare_value(&Value::MaxKey, &Value::Date(0)), Some(Ordering::Greater));
        assert_eq!(compare_value(&Value::MinKey, &Value::Null), Some(Ordering::Less));
        assert_eq!(compare_value(&Value::Nothing, &Value::MinKey), Some(Ordering::Less));
    }

    #[test]
    fn test_incomparable_values() {
        let re = CompiledRegex::new("a+", "").unwrap();
        let compiled = Value::RegexCompiled(Arc::new(re));
        assert_eq!(compare_value(&compiled, &Value::array(vec![])), None);
        assert_eq!(compare_value(&Value::RecordId(1), &Value::Int64(1)), None);
        let s1 = Value::array_set(vec![Value::Int32(1), Value::Int32(2)]);
        let s2 = Value::array_set(vec![Value::Int32(2), Value::Int32(1)]);
        let s3 = Value::array_set(vec![Value::Int32(3)]);
        assert_eq!(compare_value(&s1, &s2), Some(Ordering::Equal));
        assert_eq!(compare_value(&s1, &s3), None);
    }

    #[test]
    fn test_arrays_and_objects_compare_lexicographically() {
        let a = Value::array(vec![Value::Int32(1), Value::Int32(2)]);
        let b = Value::array(vec![Value::Int32(1), Value::Int32(3)]);
        let c = Value::array(vec![Value::Int32(1)]);
        assert_eq!(compare_value(&a, &b), Some(Ordering::Less));
        assert_eq!(compare_value(&c, &a), Some(Ordering::Less));
        let o1 = Value::object([("a", Value::Int32(1))]);
        let o2 = Value::object([("b", Value::Int32(0))]);
        assert_eq!(compare_value(&o1, &o2), Some(Ordering::Less));
    }

    #[test]
    fn test_array_set_deduplicates() {
        let set = Value::array_set(vec![Value::Int32(1), Value::Int64(1), Value::Double(2.0)]);
        assert_eq!(set.as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_type_masks() {
        assert_ne!(NUMBER_MASK & TypeTag::NumberDouble.mask(), 0);
        assert_eq!(NUMBER_MASK & TypeTag::StringBig.mask(), 0);
        assert!(TypeTag::ArraySet.is_array());
        assert!(TypeTag::StringSmall.is_string());
    }

    #[test]
    fn test_key_string_ordering() {
        let asc = |parts| KeyString::new(1, 0, parts, 0);
        let a = asc(vec![KeyPart::Int(1), KeyPart::Str("b".into())]);
        let b = asc(vec![KeyPart::Int(1), KeyPart::Str("c".into())]);
        assert_eq!(a.compare(&b), Ordering::Less);
        let desc_a = KeyString::new(1, 0b10, a.parts().to_vec(), 0);
        let desc_b = KeyString::new(1, 0b10, b.parts().to_vec(), 0);
        assert_eq!(desc_a.compare(&desc_b), Ordering::Greater);
        let before = KeyString::new(1, 0, vec![KeyPart::Int(1)], 1);
        let at = KeyString::new(1, 0, vec![KeyPart::Int(1)], 0);
        assert_eq!(before.compare(&at), Ordering::Less);
    }

    #[test]
    fn test_display() {
        let v = Value::object([
            ("a", Value::Int32(1)),
            ("b", Value::array(vec![Value::string("x"), Value::Int64(2)])),
        ]);
        assert_eq!(v.to_string(), r#"{"a" : 1, "b" : ["x", 2L]}"#);
        assert_eq!(Value::Nothing.to_string(), "Nothing");
    }

    #[test]
    fn test_serialization_deserialization() {
        let val = Value::object([
            ("int", Value::Int32(7)),
            ("long", Value::Int64(1 << 40)),
            ("exact_long", Value::Int64(5)),
            ("dbl", Value::Double(1.5)),
            ("date", Value::Date(1_600_000_000_000)),
            ("dec", Value::Decimal(Decimal::new(12345, 2))),
            ("oid", Value::ObjectId([7u8; 12])),
            ("re", Value::regex("^a", "i")),
            ("arr", Value::array(vec![Value::Null, Value::Boolean(true), Value::string("s")])),
            ("none", Value::Nothing),
        ]);
        let json = serde_json::to_string(&val).unwrap();
        let deser: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val, deser);
        assert_eq!(deser.get_field("exact_long").map(Value::tag), Some(TypeTag::NumberInt64));
    }

    #[test]
    fn test_opaque_values_do_not_serialize() {
        let ks = Value::KeyString(Arc::new(KeyString::new(1, 0, vec![], 0)));
        assert!(serde_json::to_string(&ks).is_err());
    }
}
