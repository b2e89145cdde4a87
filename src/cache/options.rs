//! Connection option values and their equivalence rules.
//!
//! Connect options are compared to decide whether two adapters may share a
//! cache slot.  The comparison is deliberately looser than `==` on a
//! canonical form: the comparator is a trait so callers can swap the rule.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Options handed to the connector alongside the URL.
pub type ConnectOptions = BTreeMap<String, OptionValue>;

/// A single option value.
#[derive(Clone)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<OptionValue>),
    Object(ConnectOptions),
    /// Host-side objects (TLS contexts, loggers, callbacks).  Equal only to
    /// clones of the same allocation.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl OptionValue {
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        OptionValue::Opaque(Arc::new(value))
    }
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Null => f.write_str("Null"),
            OptionValue::Bool(b) => write!(f, "Bool({b})"),
            OptionValue::Number(n) => write!(f, "Number({n})"),
            OptionValue::String(s) => write!(f, "String({s:?})"),
            OptionValue::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            OptionValue::Array(items) => f.debug_list().entries(items).finish(),
            OptionValue::Object(map) => f.debug_map().entries(map).finish(),
            OptionValue::Opaque(value) => write!(f, "Opaque({:p})", Arc::as_ptr(value)),
        }
    }
}

impl From<serde_json::Value> for OptionValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => OptionValue::Null,
            Value::Bool(b) => OptionValue::Bool(b),
            Value::Number(n) => OptionValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => OptionValue::String(s),
            Value::Array(items) => {
                OptionValue::Array(items.into_iter().map(OptionValue::from).collect())
            }
            Value::Object(map) => OptionValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, OptionValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::String(value.to_string())
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Number(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Number(value as f64)
    }
}

impl From<Bytes> for OptionValue {
    fn from(value: Bytes) -> Self {
        OptionValue::Bytes(value)
    }
}

/// Convert a JSON value into connect options.  Non-object values carry no
/// options and yield `None`.
pub fn options_from_json(value: serde_json::Value) -> Option<ConnectOptions> {
    match OptionValue::from(value) {
        OptionValue::Object(map) => Some(map),
        _ => None,
    }
}

/// Decides whether two option sets describe the same connection.
pub trait OptionsComparator: Send + Sync {
    fn equivalent(&self, a: Option<&ConnectOptions>, b: Option<&ConnectOptions>) -> bool;
}

/// The default rule.
///
/// Absent and empty option sets are equal.  Maps must have the same keys.
/// Nested maps compare recursively; arrays compare position by position
/// where byte buffers compare by content and every other element by
/// identity; byte buffers compare by content; scalars by value.
#[derive(Debug, Clone, Copy, Default)]
pub struct LooseComparator;

impl OptionsComparator for LooseComparator {
    fn equivalent(&self, a: Option<&ConnectOptions>, b: Option<&ConnectOptions>) -> bool {
        compare_options(a, b, loose_value)
    }
}

/// Full structural equality on every nested value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepComparator;

impl OptionsComparator for DeepComparator {
    fn equivalent(&self, a: Option<&ConnectOptions>, b: Option<&ConnectOptions>) -> bool {
        compare_options(a, b, deep_value)
    }
}

/// `true` when `options` is absent or has no keys.
pub fn is_empty(options: Option<&ConnectOptions>) -> bool {
    options.map_or(true, BTreeMap::is_empty)
}

fn compare_options(
    a: Option<&ConnectOptions>,
    b: Option<&ConnectOptions>,
    value_eq: fn(&OptionValue, &OptionValue) -> bool,
) -> bool {
    match (a, b) {
        _ if is_empty(a) && is_empty(b) => true,
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => compare_maps(a, b, value_eq),
        _ => false,
    }
}

fn compare_maps(
    a: &ConnectOptions,
    b: &ConnectOptions,
    value_eq: fn(&OptionValue, &OptionValue) -> bool,
) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(key, va)| b.get(key).is_some_and(|vb| value_eq(va, vb)))
}

fn loose_value(a: &OptionValue, b: &OptionValue) -> bool {
    match (a, b) {
        (OptionValue::Object(a), OptionValue::Object(b)) => compare_maps(a, b, loose_value),
        (OptionValue::Array(a), OptionValue::Array(b)) => {
            a.len() == b.len()
                && a.iter().zip(b).all(|(x, y)| match (x, y) {
                    (OptionValue::Bytes(x), OptionValue::Bytes(y)) => x == y,
                    _ => identical(x, y),
                })
        }
        (OptionValue::Bytes(a), OptionValue::Bytes(b)) => a == b,
        _ => identical(a, b),
    }
}

fn deep_value(a: &OptionValue, b: &OptionValue) -> bool {
    match (a, b) {
        (OptionValue::Object(a), OptionValue::Object(b)) => compare_maps(a, b, deep_value),
        (OptionValue::Array(a), OptionValue::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| deep_value(x, y))
        }
        (OptionValue::Bytes(a), OptionValue::Bytes(b)) => a == b,
        _ => identical(a, b),
    }
}

/// Strict identity: scalars by value, opaque values by allocation.
/// Independently built containers are never identical.
fn identical(a: &OptionValue, b: &OptionValue) -> bool {
    match (a, b) {
        (OptionValue::Null, OptionValue::Null) => true,
        (OptionValue::Bool(a), OptionValue::Bool(b)) => a == b,
        (OptionValue::Number(a), OptionValue::Number(b)) => a == b,
        (OptionValue::String(a), OptionValue::String(b)) => a == b,
        (OptionValue::Opaque(a), OptionValue::Opaque(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
