//! Dependency Keys
//!
//! A `Key` names one observable slot of a target: a record field, a list
//! index, the list length, a collection entry, or one of the sentinel keys
//! that stand in for "the shape of the container" rather than any single
//! slot.
//!
//! Each target kind uses a disjoint key namespace (records use `Field`,
//! lists use `Index`/`Length`, collections use `Entry`). The trigger rules
//! in the dependency store dispatch on the key shape instead of re-probing
//! the target's runtime type on every mutation.

use std::fmt;

use super::value::ValueKey;

/// Names one observable slot of a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// A named record field.
    Field(String),

    /// A list index.
    Index(usize),

    /// The list length.
    Length,

    /// A map key or set element.
    Entry(ValueKey),

    /// The single value slot of a ref.
    RefValue,

    /// Sentinel: general iteration over the container.
    Iterate,

    /// Sentinel: key-only iteration over a map.
    MapKeyIterate,
}

impl Key {
    /// Create a field key.
    pub fn field(name: impl Into<String>) -> Self {
        Key::Field(name.into())
    }

    /// Create an index key.
    pub fn index(index: usize) -> Self {
        Key::Index(index)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Field(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Field(name)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Field(name) => write!(f, "{}", name),
            Key::Index(index) => write!(f, "{}", index),
            Key::Length => write!(f, "length"),
            Key::Entry(key) => write!(f, "{:?}", key.value()),
            Key::RefValue => write!(f, "value"),
            Key::Iterate => write!(f, "<iterate>"),
            Key::MapKeyIterate => write!(f, "<map-key-iterate>"),
        }
    }
}

/// Parse a field name as a canonical list index.
///
/// Only the canonical decimal form counts (`"10"` is an index, `"010"` and
/// `"+10"` are not), mirroring how integer-like keys are distinguished from
/// arbitrary field names.
pub fn integer_key(name: &str) -> Option<usize> {
    let index: usize = name.parse().ok()?;
    if index.to_string() == name {
        Some(index)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_keys_are_canonical() {
        assert_eq!(integer_key("0"), Some(0));
        assert_eq!(integer_key("42"), Some(42));
        assert_eq!(integer_key("042"), None);
        assert_eq!(integer_key("+1"), None);
        assert_eq!(integer_key("-1"), None);
        assert_eq!(integer_key("1.5"), None);
        assert_eq!(integer_key("x"), None);
    }

    #[test]
    fn key_conversions() {
        assert_eq!(Key::from("name"), Key::Field("name".into()));
        assert_eq!(Key::from(3usize), Key::Index(3));
        assert_eq!(Key::field("a"), Key::Field("a".into()));
    }
}
