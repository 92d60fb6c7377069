//! Indexed attribute values and their canonical forms
//!
//! Every value is normalized before it reaches an index, on write and on
//! lookup alike:
//! - strings are decomposed to Unicode NFD
//! - decimals drop trailing fractional zeros
//! - currency codes are upper-cased
//! - locale tags are canonicalized to `ll-RR`

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use super::errors::{ensure, IndexError, IndexResult};

/// Declared type of an indexed attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Decimal,
    String,
    Currency,
    Locale,
    DateTime,
    Range,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Decimal => "decimal",
            ValueType::String => "string",
            ValueType::Currency => "currency",
            ValueType::Locale => "locale",
            ValueType::DateTime => "date_time",
            ValueType::Range => "range",
        }
    }

    /// Types whose values can be searched by prefix, suffix or infix
    pub fn is_textual(&self) -> bool {
        matches!(self, ValueType::String | ValueType::Currency | ValueType::Locale)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const MAX_SCALE: u32 = 18;

/// Fixed-point decimal `mantissa * 10^-scale` without trailing fractional zeros
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Decimal {
    mantissa: i64,
    scale: u32,
}

impl Decimal {
    pub fn new(mantissa: i64, scale: u32) -> IndexResult<Self> {
        ensure(scale <= MAX_SCALE, || {
            format!("decimal scale {} exceeds {}", scale, MAX_SCALE)
        })?;
        Ok(Self { mantissa, scale }.normalized())
    }

    pub fn mantissa(&self) -> i64 {
        self.mantissa
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    fn normalized(mut self) -> Self {
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
        if self.mantissa == 0 {
            self.scale = 0;
        }
        self
    }

    fn scaled_to(&self, scale: u32) -> i128 {
        self.mantissa as i128 * 10i128.pow(scale - self.scale)
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.scaled_to(scale).cmp(&other.scaled_to(scale))
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Decimal {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IndexError::invalid_usage(format!("`{}` is not a decimal number", s));
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (integral, fraction) = match digits.split_once('.') {
            Some((integral, fraction)) => (integral, fraction),
            None => (digits, ""),
        };
        if integral.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if !integral.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let combined = format!("{}{}", integral, fraction);
        let mantissa: i64 = combined.parse().map_err(|_| invalid())?;
        let mantissa = if negative { -mantissa } else { mantissa };
        Decimal::new(mantissa, fraction.len() as u32)
    }
}

impl TryFrom<String> for Decimal {
    type Error = IndexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Decimal> for String {
    fn from(value: Decimal) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (integral, fraction) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, integral, fraction)
    }
}

/// Inclusive interval over `i64`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    from: i64,
    to: i64,
}

impl Range {
    pub fn new(from: i64, to: i64) -> IndexResult<Self> {
        ensure(from <= to, || format!("range start {} is after its end {}", from, to))?;
        Ok(Self { from, to })
    }

    /// `[from, +inf)`
    pub fn since(from: i64) -> Self {
        Self { from, to: i64::MAX }
    }

    /// `(-inf, to]`
    pub fn until(to: i64) -> Self {
        Self { from: i64::MIN, to }
    }

    /// Date-time interval mapped to epoch seconds
    pub fn between_dates(from: DateTime<Utc>, to: DateTime<Utc>) -> IndexResult<Self> {
        Self::new(from.timestamp(), to.timestamp())
    }

    pub fn from(&self) -> i64 {
        self.from
    }

    pub fn to(&self) -> i64 {
        self.to
    }

    pub fn contains(&self, point: i64) -> bool {
        self.from <= point && point <= self.to
    }

    pub fn overlaps(&self, from: i64, to: i64) -> bool {
        self.from <= to && from <= self.to
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |v: i64| match v {
            i64::MIN | i64::MAX => String::new(),
            v => v.to_string(),
        };
        write!(f, "[{},{}]", bound(self.from), bound(self.to))
    }
}

/// Sort and merge ranges so that no two of them overlap or touch
pub fn consolidate(ranges: &[Range]) -> Vec<Range> {
    let mut sorted = ranges.to_vec();
    sorted.sort();
    let mut result: Vec<Range> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match result.last_mut() {
            Some(last) if range.from <= last.to.saturating_add(1) => last.to = last.to.max(range.to),
            _ => result.push(range),
        }
    }
    result
}

/// A single indexed value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    String(String),
    Currency(String),
    Locale(String),
    DateTime(DateTime<Utc>),
    Range(Range),
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::String(value.into())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Decimal(_) => ValueType::Decimal,
            Value::String(_) => ValueType::String,
            Value::Currency(_) => ValueType::Currency,
            Value::Locale(_) => ValueType::Locale,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Range(_) => ValueType::Range,
        }
    }

    /// Canonical form used as index key
    pub fn normalize(&self) -> Value {
        match self {
            Value::String(s) => Value::String(s.nfd().collect()),
            Value::Currency(code) => Value::Currency(code.trim().to_ascii_uppercase()),
            Value::Locale(tag) => Value::Locale(canonical_locale(tag)),
            Value::Decimal(d) => Value::Decimal(d.normalized()),
            other => other.clone(),
        }
    }

    /// Text of textual values
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Currency(s) | Value::Locale(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&Range> {
        match self {
            Value::Range(range) => Some(range),
            _ => None,
        }
    }

    /// Fails unless the value is of `expected` type
    pub fn expect_type(&self, expected: ValueType) -> IndexResult<()> {
        ensure(self.value_type() == expected, || {
            format!(
                "value `{}` of type {} cannot be indexed as {}",
                self,
                self.value_type(),
                expected
            )
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s.nfc().collect::<String>()),
            Value::Currency(s) | Value::Locale(s) => write!(f, "{}", s),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Range(r) => write!(f, "{}", r),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Range> for Value {
    fn from(value: Range) -> Self {
        Value::Range(value)
    }
}

/// Attribute payload: a single value or an array indexed element-wise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Array(Vec<Value>),
    Scalar(Value),
}

impl AttributeValue {
    pub fn elements(&self) -> &[Value] {
        match self {
            AttributeValue::Scalar(value) => std::slice::from_ref(value),
            AttributeValue::Array(values) => values,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, AttributeValue::Array(_))
    }

    /// Normalized, de-duplicated elements in ascending order
    pub fn normalized_elements(&self) -> Vec<Value> {
        let mut values: Vec<Value> = self.elements().iter().map(Value::normalize).collect();
        values.sort();
        values.dedup();
        values
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        AttributeValue::Scalar(value)
    }
}

impl From<Vec<Value>> for AttributeValue {
    fn from(values: Vec<Value>) -> Self {
        AttributeValue::Array(values)
    }
}

/// Canonical locale tag: language lower-case, region upper-case, script title-case
pub fn canonical_locale(tag: &str) -> String {
    tag.trim()
        .split(['-', '_'])
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(i, part)| {
            if i == 0 {
                part.to_ascii_lowercase()
            } else if part.len() == 2 {
                part.to_ascii_uppercase()
            } else if part.len() == 4 {
                let lower = part.to_ascii_lowercase();
                let mut chars = lower.chars();
                chars
                    .next()
                    .map(|c| c.to_ascii_uppercase().to_string() + chars.as_str())
                    .unwrap_or_default()
            } else {
                part.to_ascii_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
