//! Dynamic Values
//!
//! The engine observes heterogeneous data, so state flows through a single
//! dynamic `Value` type: primitives, shared raw containers (`Obj`), reactive
//! proxies (`Reactive`), and boxed reactive cells (`Ref`). Values are cheap
//! to clone; containers and cells are `Arc` handles.
//!
//! # Comparison semantics
//!
//! Three related notions of equality exist, and the differences only matter
//! for floats and container identity:
//!
//! - [`value_changed`] is the change detector used by every write path.
//!   NaN-aware: replacing NaN with NaN is *not* a change, but `0.0` and
//!   `-0.0` are distinct. Containers, proxies, and refs compare by identity.
//! - [`Value::strict_eq`] (also `PartialEq`) is strict equality. NaN is not
//!   equal to NaN; `0.0` equals `-0.0`. Used by index searches.
//! - [`Value::same_value_zero`] is like strict equality but NaN equals NaN.
//!   Used by membership searches and collection keys.

use std::fmt;
use std::hash::{Hash, Hasher};

use super::proxy::Reactive;
use super::refs::Ref;
use super::target::Obj;

/// A dynamic value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The absent value.
    #[default]
    Null,

    /// A boolean.
    Bool(bool),

    /// An integer number.
    Int(i64),

    /// A floating-point number.
    Float(f64),

    /// A string.
    Str(String),

    /// A shared raw container (record, list, map, or set).
    Obj(Obj),

    /// A reactive proxy over a raw container.
    Reactive(Reactive),

    /// A reactive cell.
    Ref(Ref),
}

/// Error produced by fallible `Value` accessors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected}, found {found}")]
pub struct ValueError {
    /// The type the caller asked for.
    pub expected: &'static str,

    /// The type the value actually holds.
    pub found: &'static str,
}

impl Value {
    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Obj(obj) => obj.kind().name(),
            Value::Reactive(proxy) => proxy.target().kind().name(),
            Value::Ref(_) => "ref",
        }
    }

    /// Whether this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Read this value as a boolean.
    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(value) => Ok(*value),
            other => Err(type_error("bool", other)),
        }
    }

    /// Read this value as an integer.
    pub fn as_int(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int(value) => Ok(*value),
            other => Err(type_error("int", other)),
        }
    }

    /// Read this value as a float. Integers convert losslessly enough for
    /// observation purposes.
    pub fn as_float(&self) -> Result<f64, ValueError> {
        match self {
            Value::Int(value) => Ok(*value as f64),
            Value::Float(value) => Ok(*value),
            other => Err(type_error("float", other)),
        }
    }

    /// Read this value as a string slice.
    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::Str(value) => Ok(value),
            other => Err(type_error("string", other)),
        }
    }

    /// Read this value as a raw container handle.
    pub fn as_obj(&self) -> Result<&Obj, ValueError> {
        match self {
            Value::Obj(obj) => Ok(obj),
            other => Err(type_error("object", other)),
        }
    }

    /// Read this value as a reactive proxy handle.
    pub fn as_reactive(&self) -> Result<&Reactive, ValueError> {
        match self {
            Value::Reactive(proxy) => Ok(proxy),
            other => Err(type_error("reactive", other)),
        }
    }

    /// Numeric view shared by the comparison helpers.
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Strict equality: NaN is unequal to itself, `0.0 == -0.0`, containers
    /// and cells compare by identity.
    pub fn strict_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a == b;
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a.id() == b.id(),
            (Value::Reactive(a), Value::Reactive(b)) => a.inner_ptr() == b.inner_ptr(),
            (Value::Ref(a), Value::Ref(b)) => a.inner_ptr() == b.inner_ptr(),
            _ => false,
        }
    }

    /// Like [`Value::strict_eq`], but NaN equals NaN.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a == b || (a.is_nan() && b.is_nan());
        }
        self.strict_eq(other)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_eq(other)
    }
}

fn type_error(expected: &'static str, found: &Value) -> ValueError {
    ValueError {
        expected,
        found: found.type_name(),
    }
}

/// The change detector used by every write path.
///
/// Returns `true` when replacing `old` with `new` is an observable change:
/// NaN-to-NaN is not a change, `0.0`-to-`-0.0` is, and containers, proxies,
/// and refs change only when the identity changes.
pub fn value_changed(new: &Value, old: &Value) -> bool {
    if let (Some(a), Some(b)) = (new.as_number(), old.as_number()) {
        if a.is_nan() && b.is_nan() {
            return false;
        }
        return a.to_bits() != b.to_bits();
    }
    !new.strict_eq(old)
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Obj> for Value {
    fn from(value: Obj) -> Self {
        Value::Obj(value)
    }
}

impl From<Reactive> for Value {
    fn from(value: Reactive) -> Self {
        Value::Reactive(value)
    }
}

impl From<Ref> for Value {
    fn from(value: Ref) -> Self {
        Value::Ref(value)
    }
}

/// A `Value` usable as a collection key.
///
/// Wraps a value with `Eq`/`Hash` implementations that agree with
/// [`Value::same_value_zero`]: NaN is a usable key, `0.0` and `-0.0`
/// collide, integers and integral floats collide, and containers, proxies,
/// and refs hash by identity. A proxy and its raw target are *distinct*
/// keys; the collection instrumentation is what bridges the two forms.
#[derive(Clone, Debug)]
pub struct ValueKey(Value);

impl ValueKey {
    /// Wrap a value for use as a key.
    pub fn new(value: Value) -> Self {
        ValueKey(value)
    }

    /// Borrow the underlying value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Unwrap the underlying value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.same_value_zero(&other.0)
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Null => 0u8.hash(state),
            Value::Bool(value) => {
                1u8.hash(state);
                value.hash(state);
            }
            Value::Int(value) => {
                2u8.hash(state);
                value.hash(state);
            }
            Value::Float(value) => hash_float(*value, state),
            Value::Str(value) => {
                5u8.hash(state);
                value.hash(state);
            }
            Value::Obj(obj) => {
                6u8.hash(state);
                obj.id().hash(state);
            }
            Value::Reactive(proxy) => {
                7u8.hash(state);
                proxy.inner_ptr().hash(state);
            }
            Value::Ref(cell) => {
                8u8.hash(state);
                cell.inner_ptr().hash(state);
            }
        }
    }
}

/// Hash a float consistently with the key equality above: NaN has one hash,
/// zeros collapse, and integral floats hash like the equal integer.
fn hash_float<H: Hasher>(value: f64, state: &mut H) {
    if value.is_nan() {
        4u8.hash(state);
        return;
    }
    let value = if value == 0.0 { 0.0 } else { value };
    if value.fract() == 0.0 && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
        2u8.hash(state);
        (value as i64).hash(state);
    } else {
        3u8.hash(state);
        value.to_bits().hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(value) => write!(f, "{}", value),
            Value::Int(value) => write!(f, "{}", value),
            Value::Float(value) => write!(f, "{}", value),
            Value::Str(value) => write!(f, "{}", value),
            Value::Obj(obj) => write!(f, "{}(#{})", obj.kind().name(), obj.id().raw()),
            Value::Reactive(proxy) => {
                write!(
                    f,
                    "reactive {}(#{})",
                    proxy.target().kind().name(),
                    proxy.target().id().raw()
                )
            }
            Value::Ref(cell) => write!(f, "ref(#{})", cell.id().raw()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn change_detection_is_nan_aware() {
        assert!(!value_changed(&Value::Float(f64::NAN), &Value::Float(f64::NAN)));
        assert!(value_changed(&Value::Float(1.0), &Value::Float(f64::NAN)));
        assert!(value_changed(&Value::Float(0.0), &Value::Float(-0.0)));
        assert!(!value_changed(&Value::Int(2), &Value::Float(2.0)));
        assert!(value_changed(&Value::Int(2), &Value::Int(3)));
        assert!(!value_changed(&Value::Str("a".into()), &Value::Str("a".into())));
        assert!(value_changed(&Value::Null, &Value::Bool(false)));
    }

    #[test]
    fn strict_eq_differs_from_change_detection_on_floats() {
        // Strict equality treats NaN as unequal and the zeros as equal.
        assert!(!Value::Float(f64::NAN).strict_eq(&Value::Float(f64::NAN)));
        assert!(Value::Float(0.0).strict_eq(&Value::Float(-0.0)));
        // Membership equality treats NaN as equal.
        assert!(Value::Float(f64::NAN).same_value_zero(&Value::Float(f64::NAN)));
    }

    #[test]
    fn container_identity() {
        let a = Obj::record();
        let b = Obj::record();
        assert_eq!(Value::Obj(a.clone()), Value::Obj(a.clone()));
        assert_ne!(Value::Obj(a), Value::Obj(b));
    }

    #[test]
    fn value_keys_collapse_numeric_forms() {
        let mut keys = HashSet::new();
        keys.insert(ValueKey::new(Value::Int(2)));
        assert!(!keys.insert(ValueKey::new(Value::Float(2.0))));
        assert!(keys.insert(ValueKey::new(Value::Float(2.5))));
        // NaN is a usable key.
        assert!(keys.insert(ValueKey::new(Value::Float(f64::NAN))));
        assert!(!keys.insert(ValueKey::new(Value::Float(f64::NAN))));
        // Zeros collapse.
        assert!(keys.insert(ValueKey::new(Value::Float(0.0))));
        assert!(!keys.insert(ValueKey::new(Value::Float(-0.0))));
    }

    #[test]
    fn accessors_report_type_mismatches() {
        let value = Value::Int(1);
        assert_eq!(value.as_int(), Ok(1));
        let err = value.as_str().unwrap_err();
        assert_eq!(err.expected, "string");
        assert_eq!(err.found, "int");
    }
}
