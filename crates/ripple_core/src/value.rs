//! Dynamic value model
//!
//! Containers hold [`Value`]s. Scalars compare by value; containers, views and
//! reference cells compare by identity. Change detection uses
//! [`has_changed`], which treats `NaN` as equal to itself and `+0` as equal to
//! `-0` (same-value-zero), so writing `NaN` over `NaN` does not notify.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::observable::Observable;
use crate::reference::Ref;
use crate::target::Target;

/// A value stored in, or read from, a container
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    /// A raw, unwrapped container
    Target(Target),
    /// A tracked or read-only view over a container
    Observable(Observable),
    /// A reactive reference cell
    Ref(Ref),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Containers and views are eligible for wrapping
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Target(_) | Self::Observable(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_target(&self) -> Option<&Target> {
        match self {
            Self::Target(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_observable(&self) -> Option<&Observable> {
        match self {
            Self::Observable(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_observable(self) -> Option<Observable> {
        match self {
            Self::Observable(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_ref_cell(&self) -> Option<&Ref> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Strip every layer of wrapping, returning the innermost raw target
    ///
    /// Non-container values are returned as-is.
    pub fn to_raw(&self) -> Value {
        match self {
            Self::Observable(o) => Self::Target(o.raw_target()),
            other => other.clone(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Target(_) => "target",
            Self::Observable(_) => "observable",
            Self::Ref(_) => "ref",
        }
    }
}

/// Strict equality, except that `NaN` equals `NaN`
pub fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Target(x), Value::Target(y)) => x.ptr_eq(y),
        (Value::Observable(x), Value::Observable(y)) => x.ptr_eq(y),
        (Value::Ref(x), Value::Ref(y)) => x.ptr_eq(y),
        _ => false,
    }
}

/// Whether `new` differs from `old` under [`same_value_zero`]
pub fn has_changed(new: &Value, old: &Value) -> bool {
    !same_value_zero(new, old)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        same_value_zero(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Target(t) => fmt::Debug::fmt(t, f),
            Self::Observable(o) => fmt::Debug::fmt(o, f),
            Self::Ref(r) => fmt::Debug::fmt(r, f),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Undefined
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value.into())
    }
}

impl From<Rc<str>> for Value {
    fn from(value: Rc<str>) -> Self {
        Self::Str(value)
    }
}

impl From<Target> for Value {
    fn from(value: Target) -> Self {
        Self::Target(value)
    }
}

impl From<Observable> for Value {
    fn from(value: Observable) -> Self {
        Self::Observable(value)
    }
}

impl From<Ref> for Value {
    fn from(value: Ref) -> Self {
        Self::Ref(value)
    }
}

/// A [`Value`] usable as a map key or set member
///
/// Equality is [`same_value_zero`], so a raw target and a view over it are
/// distinct keys.
#[derive(Clone, Debug)]
pub struct MapKey(Value);

impl MapKey {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for MapKey {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        same_value_zero(&self.0, &other.0)
    }
}

impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Undefined => 0u8.hash(state),
            Value::Null => 1u8.hash(state),
            Value::Bool(b) => {
                2u8.hash(state);
                b.hash(state);
            }
            Value::Number(n) => {
                3u8.hash(state);
                // +0/-0 and every NaN payload must land in the same bucket
                let bits = if *n == 0.0 {
                    0
                } else if n.is_nan() {
                    f64::NAN.to_bits()
                } else {
                    n.to_bits()
                };
                bits.hash(state);
            }
            Value::Str(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Target(t) => {
                5u8.hash(state);
                t.id().hash(state);
            }
            Value::Observable(o) => {
                6u8.hash(state);
                o.identity().hash(state);
            }
            Value::Ref(r) => {
                7u8.hash(state);
                r.id().hash(state);
            }
        }
    }
}

/// A member address accepted by [`Observable`] operations
///
/// Each container kind normalizes keys its own way: records want names,
/// sequences want indices, maps and sets accept any value.
#[derive(Clone, Debug)]
pub enum Key {
    Name(Rc<str>),
    Index(usize),
    Value(Value),
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Name(value.into())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Name(value.into())
    }
}

impl From<Rc<str>> for Key {
    fn from(value: Rc<str>) -> Self {
        Self::Name(value)
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        match usize::try_from(value) {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Value(Value::Number(value as f64)),
        }
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&Value> for Key {
    fn from(value: &Value) -> Self {
        Self::Value(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_has_changed_nan_and_zero() {
        assert!(!has_changed(&Value::from(f64::NAN), &Value::from(f64::NAN)));
        assert!(!has_changed(&Value::from(0.0), &Value::from(-0.0)));
        assert!(has_changed(&Value::from(1), &Value::from(2)));
        assert!(has_changed(&Value::Null, &Value::Undefined));
    }

    #[test]
    fn test_container_identity() {
        let a = Target::record::<&str, _>([]);
        let b = Target::record::<&str, _>([]);
        assert_eq!(Value::from(a.clone()), Value::from(a.clone()));
        assert_ne!(Value::from(a), Value::from(b));
    }

    #[test]
    fn test_map_key_hash_consistency() {
        let mut keys = HashSet::new();
        keys.insert(MapKey::new(Value::from(0.0)));
        keys.insert(MapKey::new(Value::from(-0.0)));
        keys.insert(MapKey::new(Value::from(f64::NAN)));
        keys.insert(MapKey::new(Value::from(f64::NAN)));
        keys.insert(MapKey::new(Value::from("0")));
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_key_from_negative_index() {
        assert!(matches!(Key::from(3), Key::Index(3)));
        assert!(matches!(Key::from(-1), Key::Value(Value::Number(n)) if n == -1.0));
    }
}
