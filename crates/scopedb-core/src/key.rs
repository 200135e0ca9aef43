//! Record keys and key ranges
//!
//! Keys are numbers, strings, or arrays of keys, totally ordered as
//! numbers < strings < arrays.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

/// A valid primary or index key.
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    Text(String),
    Array(Vec<Key>),
}

impl Key {
    /// Convert a JSON value into a key. Booleans, null and objects are not keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_f64().map(Key::Number),
            Value::String(s) => Some(Key::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// JSON form of the key. Integral numbers come back as JSON integers.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 => {
                Value::from(*n as i64)
            }
            Key::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Key::Text(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Text(_) => 1,
            Key::Array(_) => 2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// Interval over keys. Unset bounds are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly `key`.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            ..Self::default()
        }
    }

    pub fn bound(lower: impl Into<Key>, upper: impl Into<Key>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            ..Self::default()
        }
    }

    pub fn lower_bound(lower: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(lower.into()),
            lower_open: open,
            ..Self::default()
        }
    }

    pub fn upper_bound(upper: impl Into<Key>, open: bool) -> Self {
        Self {
            upper: Some(upper.into()),
            upper_open: open,
            ..Self::default()
        }
    }

    pub fn open_lower(mut self) -> Self {
        self.lower_open = true;
        self
    }

    pub fn open_upper(mut self) -> Self {
        self.upper_open = true;
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// False when the lower bound lies above the upper bound.
    pub fn is_valid(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => match lower.cmp(upper) {
                Ordering::Less => true,
                Ordering::Equal => !self.lower_open && !self.upper_open,
                Ordering::Greater => false,
            },
            _ => true,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
            None => true,
        };
        let below = match &self.upper {
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
            None => true,
        };
        above && below
    }
}
