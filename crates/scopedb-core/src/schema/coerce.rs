//! Best-effort coercion of record fields into index column values.
//!
//! Parsing is prefix based: `"30 years"` coerces to `30` for an integer
//! index, and anything without a leading number becomes
//! [`ColumnValue::NotANumber`]. Consumers decide what to do with the sentinel.

use serde_json::Value;

use super::store::DataType;

/// A record field coerced to the data type of its index.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Integer(i64),
    Float(f64),
    Text(String),
    /// Numeric coercion failed
    NotANumber,
}

impl ColumnValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Integer(i) => Some(*i as f64),
            ColumnValue::Float(f) if !f.is_nan() => Some(*f),
            _ => None,
        }
    }

    pub fn is_nan(&self) -> bool {
        match self {
            ColumnValue::NotANumber => true,
            ColumnValue::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// JSON view of the value; the NaN sentinel maps to `null`.
    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Integer(i) => Value::from(*i),
            ColumnValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnValue::Text(s) => Value::String(s.clone()),
            ColumnValue::NotANumber => Value::Null,
        }
    }
}

/// Coerce `value` to `data_type`.
pub fn coerce(value: &Value, data_type: DataType) -> ColumnValue {
    match data_type {
        DataType::Integer => coerce_integer(value),
        DataType::Float => coerce_float(value),
        DataType::Text => match value {
            Value::String(s) => ColumnValue::Text(s.clone()),
            other => ColumnValue::Text(other.to_string()),
        },
    }
}

fn coerce_integer(value: &Value) -> ColumnValue {
    match value {
        // numbers pass through untouched, only text is parsed
        Value::Number(n) => match n.as_i64() {
            Some(i) => ColumnValue::Integer(i),
            None => n
                .as_f64()
                .map(ColumnValue::Float)
                .unwrap_or(ColumnValue::NotANumber),
        },
        Value::String(s) => parse_int_prefix(s),
        _ => ColumnValue::NotANumber,
    }
}

fn coerce_float(value: &Value) -> ColumnValue {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(ColumnValue::Float)
            .unwrap_or(ColumnValue::NotANumber),
        Value::String(s) => parse_float_prefix(s),
        _ => ColumnValue::NotANumber,
    }
}

fn split_sign(text: &str) -> (bool, &str) {
    match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    }
}

fn digit_run(text: &str) -> usize {
    text.bytes().take_while(u8::is_ascii_digit).count()
}

/// Parse the leading base-10 integer of `text`.
pub(crate) fn parse_int_prefix(text: &str) -> ColumnValue {
    let (negative, rest) = split_sign(text.trim_start());
    let digits = &rest[..digit_run(rest)];
    if digits.is_empty() {
        return ColumnValue::NotANumber;
    }
    match digits.parse::<i64>() {
        Ok(i) => ColumnValue::Integer(if negative { -i } else { i }),
        // too wide for i64, keep the magnitude as a float
        Err(_) => match digits.parse::<f64>() {
            Ok(f) => ColumnValue::Float(if negative { -f } else { f }),
            Err(_) => ColumnValue::NotANumber,
        },
    }
}

/// Parse the leading decimal number of `text`, with optional fraction and
/// exponent. `Infinity` is accepted.
pub(crate) fn parse_float_prefix(text: &str) -> ColumnValue {
    let trimmed = text.trim_start();
    let (negative, rest) = split_sign(trimmed);
    if rest.starts_with("Infinity") {
        return ColumnValue::Float(if negative {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        });
    }

    let int_len = digit_run(rest);
    let mut end = int_len;
    let mut frac_len = 0;
    if rest[end..].starts_with('.') {
        frac_len = digit_run(&rest[end + 1..]);
        end += 1 + frac_len;
    }
    if int_len + frac_len == 0 {
        return ColumnValue::NotANumber;
    }

    let tail = &rest[end..];
    if tail.starts_with('e') || tail.starts_with('E') {
        let (_, exp) = split_sign(&tail[1..]);
        let exp_digits = digit_run(exp);
        if exp_digits > 0 {
            end += tail.len() - exp.len() + exp_digits;
        }
    }

    let sign_len = trimmed.len() - rest.len();
    match trimmed[..sign_len + end].parse::<f64>() {
        Ok(f) => ColumnValue::Float(f),
        Err(_) => ColumnValue::NotANumber,
    }
}
