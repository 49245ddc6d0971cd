// SPDX-License-Identifier: Apache-2.0

//! Dynamic values carried by time series.
//!
//! The runtime is dynamically typed at the value level: every output declares
//! a [`Kind`] and rejects applies of any other kind. [`Key`] is the hashable
//! subset of [`Value`] used for dictionary keys and set elements.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::reference::TsRef;
use crate::time::EngineTime;

/// Hashable, totally ordered value usable as a dictionary key or set element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Key {
    /// Boolean key.
    Bool(bool),
    /// Signed integer key.
    Int(i64),
    /// String key.
    Str(Arc<str>),
}

impl Key {
    /// Converts a value into a key when its kind permits.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Bool(b) => Some(Key::Bool(*b)),
            Value::Int(i) => Some(Key::Int(*i)),
            Value::Str(s) => Some(Key::Str(Arc::clone(s))),
            _ => None,
        }
    }

    /// Converts the key back into a plain value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Str(s) => Value::Str(Arc::clone(s)),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(Arc::from(s))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(b) => write!(f, "{b}"),
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Closed set of value shapes understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Kind {
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Engine timestamp.
    Time,
    /// Duration.
    Duration,
    /// String.
    Str,
    /// Ordered list of values.
    List,
    /// Key-to-value map.
    Map,
    /// Set of keys.
    Set,
    /// Time-series reference.
    Ref,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Time => "time",
            Kind::Duration => "duration",
            Kind::Str => "str",
            Kind::List => "list",
            Kind::Map => "map",
            Kind::Set => "set",
            Kind::Ref => "ref",
        };
        f.write_str(name)
    }
}

/// A point-in-time value of a time series.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Engine timestamp.
    Time(EngineTime),
    /// Duration.
    Duration(Duration),
    /// String.
    Str(Arc<str>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Key-to-value map (the assembled view of a dictionary time series).
    Map(BTreeMap<Key, Value>),
    /// Set of keys (the assembled view of a set time series).
    Set(BTreeSet<Key>),
    /// Time-series reference (see [`TsRef`]).
    Ref(TsRef),
}

impl Value {
    /// Returns the kind tag of this value.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
            Value::Time(_) => Kind::Time,
            Value::Duration(_) => Kind::Duration,
            Value::Str(_) => Kind::Str,
            Value::List(_) => Kind::List,
            Value::Map(_) => Kind::Map,
            Value::Set(_) => Kind::Set,
            Value::Ref(_) => Kind::Ref,
        }
    }

    /// Builds a string value.
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Returns the integer payload when this is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float payload when this is a `Float`.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the boolean payload when this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the string payload when this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the reference payload when this is a `Ref`.
    #[must_use]
    pub fn as_ref_value(&self) -> Option<&TsRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        k.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_value() {
        let k = Key::from("instr");
        let v = k.to_value();
        assert_eq!(Key::from_value(&v), Some(k));
    }

    #[test]
    fn non_hashable_values_are_not_keys() {
        assert_eq!(Key::from_value(&Value::Float(1.0)), None);
        assert_eq!(Key::from_value(&Value::List(vec![])), None);
    }

    #[test]
    fn kind_matches_payload() {
        assert_eq!(Value::Int(3).kind(), Kind::Int);
        assert_eq!(Value::str("x").kind(), Kind::Str);
        assert_eq!(Value::Map(BTreeMap::new()).kind(), Kind::Map);
    }
}
