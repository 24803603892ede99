// ============================================================================
// TYPED VALUES & VALUE COERCER
// ============================================================================
// The appliance reports every metric as a string: "160,732", "0.23", "True",
// "NaN", "2048" (in KB). `coerce` turns one of those into a typed value using
// a literal grammar only (bool / int / float / quoted string). Nothing here is
// ever evaluated as code.
// ============================================================================

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::MAX_STRING_LENGTH;

// ----------------------------------------------------------------------------
// Typed Value
// ----------------------------------------------------------------------------

/// One observation after coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TypedValue {
    /// The record kind a slot created from this value gets.
    pub fn record_kind(&self) -> RecordKind {
        match self {
            TypedValue::Bool(_) => RecordKind::BinaryInput,
            TypedValue::Float(_) => RecordKind::AnalogInput,
            TypedValue::Int(_) => RecordKind::LongInput,
            TypedValue::Text(_) => RecordKind::StringInput,
        }
    }

    /// Equality for change detection: two NaNs compare equal.
    pub fn same_as(&self, other: &TypedValue) -> bool {
        match (self, other) {
            (TypedValue::Float(a), TypedValue::Float(b)) if a.is_nan() && b.is_nan() => true,
            _ => self == other,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            TypedValue::Int(i) => Some(*i as f64),
            TypedValue::Float(f) => Some(*f),
            TypedValue::Text(_) => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            TypedValue::Float(f) => f.is_finite(),
            _ => true,
        }
    }

    /// Convert into `kind`, or `None` when the value cannot be represented.
    pub fn convert_to(&self, kind: RecordKind) -> Option<TypedValue> {
        match (kind, self) {
            (RecordKind::AnalogInput, TypedValue::Text(_)) => None,
            (RecordKind::AnalogInput, v) => v.as_f64().map(TypedValue::Float),

            (RecordKind::LongInput, TypedValue::Int(i)) => Some(TypedValue::Int(*i)),
            (RecordKind::LongInput, TypedValue::Bool(b)) => Some(TypedValue::Int(i64::from(*b))),
            (RecordKind::LongInput, TypedValue::Float(f))
                if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 =>
            {
                Some(TypedValue::Int(*f as i64))
            }
            (RecordKind::LongInput, _) => None,

            (RecordKind::BinaryInput, TypedValue::Bool(b)) => Some(TypedValue::Bool(*b)),
            (RecordKind::BinaryInput, TypedValue::Int(i @ (0 | 1))) => Some(TypedValue::Bool(*i == 1)),
            (RecordKind::BinaryInput, TypedValue::Float(f)) if *f == 0.0 || *f == 1.0 => {
                Some(TypedValue::Bool(*f == 1.0))
            }
            (RecordKind::BinaryInput, _) => None,

            (RecordKind::StringInput, TypedValue::Text(s)) => Some(TypedValue::Text(truncate(s))),
            (RecordKind::StringInput, v) => Some(TypedValue::Text(truncate(&v.to_string()))),
        }
    }

    /// JSON form for a document; non-finite floats become `sentinel`.
    pub fn to_json(&self, sentinel: f64) -> JsonValue {
        match self {
            TypedValue::Bool(b) => JsonValue::Bool(*b),
            TypedValue::Int(i) => JsonValue::from(*i),
            TypedValue::Float(f) => serde_json::Number::from_f64(*f)
                .or_else(|| serde_json::Number::from_f64(sentinel))
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            TypedValue::Text(s) => JsonValue::String(s.clone()),
        }
    }

    /// Read a stored document field back as a value of `kind`.
    pub fn from_json(value: &JsonValue, kind: RecordKind) -> Option<TypedValue> {
        let raw = match value {
            JsonValue::Bool(b) => TypedValue::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => TypedValue::Int(i),
                None => TypedValue::Float(n.as_f64()?),
            },
            JsonValue::String(s) => TypedValue::Text(s.clone()),
            _ => return None,
        };
        raw.convert_to(kind)
    }
}

impl Display for TypedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Bool(b) => write!(f, "{}", b),
            TypedValue::Int(i) => write!(f, "{}", i),
            TypedValue::Float(v) => write!(f, "{}", v),
            TypedValue::Text(s) => write!(f, "{}", s),
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_STRING_LENGTH {
        s.to_string()
    } else {
        s.chars().take(MAX_STRING_LENGTH).collect()
    }
}

// ----------------------------------------------------------------------------
// Record Kind
// ----------------------------------------------------------------------------

/// Channel record type; fixed when a slot is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// bi
    BinaryInput,
    /// ai
    AnalogInput,
    /// longin
    LongInput,
    /// stringin
    StringInput,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::BinaryInput => "bi",
            RecordKind::AnalogInput => "ai",
            RecordKind::LongInput => "longin",
            RecordKind::StringInput => "stringin",
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, RecordKind::StringInput)
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Coercer
// ----------------------------------------------------------------------------

/// Keys whose values jump between integral and fractional renderings.
pub const DEFAULT_FLOAT_KEYS: &[&str] = &[
    "dataRate",
    "dataRateGBPerDay",
    "dataRateGBPerYear",
    "eventRate",
    "capacityUtilized",
    "secondsConsumedByWritter",
    "maxETLPercentage",
    "Event Rate (in events/sec)",
    "Data Rate (in bytes/sec)",
    "Data Rate in (GB/day)",
    "Data Rate in (GB/year)",
    "Benchmark - writing at (MB/sec)",
    "Time consumed for writing samplebuffers to STS (in secs)",
];

static THOUSANDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?\d{1,3}(,\d{3})+(\.\d+)?$").expect("static regex"));
static INT_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?\d+(_\d+)*$").expect("static regex"));
static FLOAT_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(\d+\.\d*|\.\d+|\d+)([eE][+-]?\d+)?$").expect("static regex"));
static UNIT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<stem>.*)\((?P<unit>[KMGT]?B)\)\s*$").expect("static regex"));

/// Result of coercing one raw metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    /// The key, rewritten when a unit suffix was rescaled.
    pub key: String,
    pub value: TypedValue,
}

/// Raw string to typed value, with the float override set.
#[derive(Debug, Clone)]
pub struct Coercer {
    float_keys: HashSet<String>,
}

impl Default for Coercer {
    fn default() -> Self {
        Self {
            float_keys: DEFAULT_FLOAT_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl Coercer {
    /// Extend the override set.
    pub fn with_float_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.float_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn coerce(&self, key: &str, raw: &str) -> Coerced {
        let mut value = literal_value(raw);

        if self.float_keys.contains(key) {
            if let Some(f) = value.as_f64() {
                value = TypedValue::Float(f);
            }
        }

        if let Some(caps) = UNIT_SUFFIX.captures(key) {
            if let (Some(factor), Some(f)) = (mb_factor(&caps["unit"]), value.as_f64()) {
                if !matches!(value, TypedValue::Bool(_)) {
                    return Coerced {
                        key: format!("{}(MB)", &caps["stem"]),
                        value: TypedValue::Float(f * factor),
                    };
                }
            }
        }

        Coerced {
            key: key.to_string(),
            value,
        }
    }
}

/// Coerce with the default override set.
///
/// ```
/// use archstats::{coerce, TypedValue};
/// assert_eq!(coerce("Total PV count", "160,732").value, TypedValue::Int(160732));
/// ```
pub fn coerce(key: &str, raw: &str) -> Coerced {
    static DEFAULT: Lazy<Coercer> = Lazy::new(Coercer::default);
    DEFAULT.coerce(key, raw)
}

fn mb_factor(unit: &str) -> Option<f64> {
    match unit {
        "B" => Some(1.0 / (1024.0 * 1024.0)),
        "KB" => Some(1.0 / 1024.0),
        "MB" => Some(1.0),
        "GB" => Some(1024.0),
        "TB" => Some(1024.0 * 1024.0),
        _ => None,
    }
}

enum Literal {
    Scalar(TypedValue),
    Tuple,
}

/// The value of `raw` under the literal grammar, falling back to text.
fn literal_value(raw: &str) -> TypedValue {
    let trimmed = raw.trim();
    if trimmed == "NaN" {
        return TypedValue::Float(f64::NAN);
    }

    let candidate = if THOUSANDS.is_match(trimmed) {
        trimmed.replace(',', "")
    } else {
        trimmed.to_string()
    };

    match parse_literal(&candidate) {
        Some(Literal::Scalar(v)) => v,
        Some(Literal::Tuple) => {
            // "160,732" reads as the pair (160, 732)
            let stripped = candidate.replace(',', "");
            match parse_scalar(stripped.trim()) {
                Some(v) => v,
                None => TypedValue::Text(stripped),
            }
        }
        None => TypedValue::Text(raw.to_string()),
    }
}

fn parse_literal(text: &str) -> Option<Literal> {
    if let Some(v) = parse_scalar(text) {
        return Some(Literal::Scalar(v));
    }
    if !text.contains(',') || is_quoted(text) {
        return None;
    }

    let body = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(text);
    let mut parts: Vec<&str> = body.split(',').map(str::trim).collect();
    if parts.last() == Some(&"") {
        parts.pop();
    }
    if !parts.is_empty() && parts.iter().all(|p| parse_scalar(p).is_some()) {
        Some(Literal::Tuple)
    } else {
        None
    }
}

fn parse_scalar(text: &str) -> Option<TypedValue> {
    match text {
        "True" => return Some(TypedValue::Bool(true)),
        "False" => return Some(TypedValue::Bool(false)),
        _ => {}
    }

    if is_quoted(text) {
        return Some(TypedValue::Text(text[1..text.len() - 1].to_string()));
    }

    if INT_LITERAL.is_match(text) {
        let digits = text.replace('_', "");
        return match digits.parse::<i64>() {
            Ok(i) => Some(TypedValue::Int(i)),
            Err(_) => digits.parse::<f64>().ok().map(TypedValue::Float),
        };
    }

    if FLOAT_LITERAL.is_match(text) {
        return text.parse::<f64>().ok().map(TypedValue::Float);
    }

    None
}

fn is_quoted(text: &str) -> bool {
    text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')))
        && !text[1..text.len() - 1].contains(&text[..1])
}
