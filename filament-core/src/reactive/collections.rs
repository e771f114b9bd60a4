//! Collection Instrumentation
//!
//! Map and set targets cannot be observed through slot access alone, so
//! their operations are instrumented at method level. Read-side operations
//! resolve each key twice (as given, then unwrapped to raw), so callers
//! may mix reactive and raw keys into the same collection. A collection
//! found to contain *both* forms of the same object as distinct entries is
//! a detectable inconsistency and reported as a diagnostic, not an error.

use super::dep::{self, pause_scheduling, pause_tracking, reset_scheduling, reset_tracking};
use super::key::Key;
use super::ops::{TrackOp, TriggerOp};
use super::proxy::{to_raw, Reactive};
use super::target::{Storage, TargetKind};
use super::value::{value_changed, Value, ValueKey};

impl Reactive {
    fn collection_guard(&self, expected: &[TargetKind], operation: &str) -> bool {
        if expected.contains(&self.kind()) {
            true
        } else {
            tracing::warn!(
                "{} is not supported on a reactive {}",
                operation,
                self.kind().name()
            );
            false
        }
    }

    fn raw_entry(&self, key: &ValueKey) -> Option<Value> {
        self.target().read(|storage| match storage {
            Storage::Map(entries) => entries.get(key).cloned(),
            Storage::Set(items) => items.get(key).map(|item| item.value().clone()),
            _ => None,
        })
    }

    fn raw_has_entry(&self, key: &ValueKey) -> bool {
        self.target().read(|storage| match storage {
            Storage::Map(entries) => entries.contains_key(key),
            Storage::Set(items) => items.contains(key),
            _ => false,
        })
    }

    /// Warn when both the raw and reactive form of a key are present as
    /// distinct entries.
    fn check_identity_keys(&self, key: &Value) {
        let raw = to_raw(key);
        if !raw.strict_eq(key) && self.raw_has_entry(&ValueKey::new(raw)) {
            tracing::warn!(
                "reactive {} contains both the raw and reactive versions of the same object{}, \
                 which can lead to inconsistencies; use only the reactive version where possible",
                self.kind().name(),
                if self.kind() == TargetKind::Map { " as keys" } else { "" },
            );
        }
    }

    /// Read a map entry.
    ///
    /// Tracks the key as given and, if different, its raw form, then looks
    /// both forms up. Deep views wrap container values.
    pub fn get_entry(&self, key: &Value) -> Value {
        if !self.collection_guard(&[TargetKind::Map], "get_entry()") {
            return Value::Null;
        }
        let raw_key = to_raw(key);
        if !self.is_readonly() {
            if value_changed(key, &raw_key) {
                dep::track(self.id(), TrackOp::Get, Key::Entry(ValueKey::new(key.clone())));
            }
            dep::track(
                self.id(),
                TrackOp::Get,
                Key::Entry(ValueKey::new(raw_key.clone())),
            );
        }
        let result = self
            .raw_entry(&ValueKey::new(key.clone()))
            .or_else(|| self.raw_entry(&ValueKey::new(raw_key)));
        match result {
            Some(value) => self.wrap_nested(value),
            None => Value::Null,
        }
    }

    /// Whether a map or set contains a key, in either its given or raw
    /// form. Tracks presence of both forms.
    pub fn has_entry(&self, key: &Value) -> bool {
        if !self.collection_guard(&[TargetKind::Map, TargetKind::Set], "has_entry()") {
            return false;
        }
        let raw_key = to_raw(key);
        if !self.is_readonly() {
            if value_changed(key, &raw_key) {
                dep::track(self.id(), TrackOp::Has, Key::Entry(ValueKey::new(key.clone())));
            }
            dep::track(
                self.id(),
                TrackOp::Has,
                Key::Entry(ValueKey::new(raw_key.clone())),
            );
        }
        self.raw_has_entry(&ValueKey::new(key.clone()))
            || self.raw_has_entry(&ValueKey::new(raw_key))
    }

    /// Write a map entry. The value is stored raw; the key resolves to an
    /// existing entry in either form before counting as an addition.
    pub fn set_entry(&self, key: impl Into<Value>, value: impl Into<Value>) {
        if !self.collection_guard(&[TargetKind::Map], "set_entry()") {
            return;
        }
        let mut key = key.into();
        if self.is_readonly() {
            tracing::warn!(
                "set operation on key \"{}\" failed: target is readonly",
                key
            );
            return;
        }
        let value = to_raw(&value.into());
        let mut had = self.raw_has_entry(&ValueKey::new(key.clone()));
        if !had {
            key = to_raw(&key);
            had = self.raw_has_entry(&ValueKey::new(key.clone()));
        } else {
            self.check_identity_keys(&key);
        }
        let entry_key = ValueKey::new(key);
        let old = self.raw_entry(&entry_key);
        self.target().write(|storage| {
            if let Storage::Map(entries) = storage {
                entries.insert(entry_key.clone(), value.clone());
            }
        });
        if !had {
            dep::trigger(
                self.id(),
                TriggerOp::Add,
                Some(Key::Entry(entry_key)),
                Some(value),
                None,
            );
        } else if value_changed(&value, old.as_ref().unwrap_or(&Value::Null)) {
            dep::trigger(
                self.id(),
                TriggerOp::Set,
                Some(Key::Entry(entry_key)),
                Some(value),
                old,
            );
        }
    }

    /// Add an element to a set. The element is stored raw; re-adding an
    /// existing element does not trigger.
    pub fn add(&self, value: impl Into<Value>) {
        if !self.collection_guard(&[TargetKind::Set], "add()") {
            return;
        }
        if self.is_readonly() {
            tracing::warn!("add operation failed: target is readonly");
            return;
        }
        let value = to_raw(&value.into());
        let entry_key = ValueKey::new(value.clone());
        if self.raw_has_entry(&entry_key) {
            return;
        }
        self.target().write(|storage| {
            if let Storage::Set(items) = storage {
                items.insert(entry_key.clone());
            }
        });
        dep::trigger(
            self.id(),
            TriggerOp::Add,
            Some(Key::Entry(entry_key)),
            Some(value),
            None,
        );
    }

    /// Remove a map entry or set element, resolving the key in either form.
    /// Returns whether it existed.
    pub fn remove_entry(&self, key: &Value) -> bool {
        if !self.collection_guard(&[TargetKind::Map, TargetKind::Set], "remove_entry()") {
            return false;
        }
        if self.is_readonly() {
            tracing::warn!(
                "delete operation on key \"{}\" failed: target is readonly",
                key
            );
            return false;
        }
        let mut key = key.clone();
        let mut had = self.raw_has_entry(&ValueKey::new(key.clone()));
        if !had {
            key = to_raw(&key);
            had = self.raw_has_entry(&ValueKey::new(key.clone()));
        } else {
            self.check_identity_keys(&key);
        }
        if !had {
            return false;
        }
        let entry_key = ValueKey::new(key);
        let old = self.raw_entry(&entry_key);
        self.target().write(|storage| match storage {
            Storage::Map(entries) => {
                entries.shift_remove(&entry_key);
            }
            Storage::Set(items) => {
                items.shift_remove(&entry_key);
            }
            _ => {}
        });
        dep::trigger(
            self.id(),
            TriggerOp::Delete,
            Some(Key::Entry(entry_key)),
            None,
            old,
        );
        true
    }

    /// Empty a map or set, notifying every dependency of the target.
    pub fn clear(&self) {
        if !self.collection_guard(&[TargetKind::Map, TargetKind::Set], "clear()") {
            return;
        }
        if self.is_readonly() {
            tracing::warn!("clear operation failed: target is readonly");
            return;
        }
        let had_items = self.target().raw_len() != 0;
        self.target().write(|storage| match storage {
            Storage::Map(entries) => entries.clear(),
            Storage::Set(items) => items.clear(),
            _ => {}
        });
        if had_items {
            dep::trigger(self.id(), TriggerOp::Clear, None, None, None);
        }
    }

    /// Visit every entry as `(value, key)` pairs, wrapped per the view's
    /// variant. Tracks iteration.
    pub fn for_each(&self, mut visit: impl FnMut(&Value, &Value)) {
        if !self.collection_guard(&[TargetKind::Map, TargetKind::Set], "for_each()") {
            return;
        }
        if !self.is_readonly() {
            dep::track(self.id(), TrackOp::Iterate, Key::Iterate);
        }
        for (key, value) in self.snapshot_entries() {
            visit(&self.wrap_nested(value), &self.wrap_nested(key));
        }
    }

    /// The entries of a map (key/value) or set (element/element), wrapped
    /// per the view's variant. Tracks iteration.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        if !self.collection_guard(&[TargetKind::Map, TargetKind::Set], "entries()") {
            return Vec::new();
        }
        if !self.is_readonly() {
            dep::track(self.id(), TrackOp::Iterate, Key::Iterate);
        }
        self.snapshot_entries()
            .into_iter()
            .map(|(key, value)| (self.wrap_nested(key), self.wrap_nested(value)))
            .collect()
    }

    /// The keys of a map or elements of a set, wrapped per the view's
    /// variant. Key-only map iteration tracks the key-iterate sentinel, so
    /// value-only replacements do not disturb it.
    pub fn entry_keys(&self) -> Vec<Value> {
        if !self.collection_guard(&[TargetKind::Map, TargetKind::Set], "entry_keys()") {
            return Vec::new();
        }
        if !self.is_readonly() {
            let sentinel = if self.kind() == TargetKind::Map {
                Key::MapKeyIterate
            } else {
                Key::Iterate
            };
            dep::track(self.id(), TrackOp::Iterate, sentinel);
        }
        self.snapshot_entries()
            .into_iter()
            .map(|(key, _)| self.wrap_nested(key))
            .collect()
    }

    /// The values of a map or elements of a set, wrapped per the view's
    /// variant. Tracks iteration.
    pub fn entry_values(&self) -> Vec<Value> {
        if !self.collection_guard(&[TargetKind::Map, TargetKind::Set], "entry_values()") {
            return Vec::new();
        }
        if !self.is_readonly() {
            dep::track(self.id(), TrackOp::Iterate, Key::Iterate);
        }
        self.snapshot_entries()
            .into_iter()
            .map(|(_, value)| self.wrap_nested(value))
            .collect()
    }

    fn snapshot_entries(&self) -> Vec<(Value, Value)> {
        self.target().read(|storage| match storage {
            Storage::Map(entries) => entries
                .iter()
                .map(|(key, value)| (key.value().clone(), value.clone()))
                .collect(),
            Storage::Set(items) => items
                .iter()
                .map(|item| (item.value().clone(), item.value().clone()))
                .collect(),
            _ => Vec::new(),
        })
    }
}

/// Instrumented mutators keep the whole compound mutation in one pause
/// bracket; this helper mirrors the list mutators' shape for hosts that
/// batch several collection writes.
pub fn batch<R>(mutate: impl FnOnce() -> R) -> R {
    pause_tracking();
    pause_scheduling();
    let result = mutate();
    reset_scheduling();
    reset_tracking();
    result
}

#[cfg(test)]
mod tests {
    use super::super::proxy::{reactive, readonly};
    use super::super::target::Obj;
    use super::*;

    fn reactive_map() -> Reactive {
        reactive(Obj::map()).as_reactive().unwrap().clone()
    }

    fn reactive_set() -> Reactive {
        reactive(Obj::set()).as_reactive().unwrap().clone()
    }

    #[test]
    fn map_set_get_has_delete() {
        let map = reactive_map();
        map.set_entry("a", 1);
        assert_eq!(map.get_entry(&Value::Str("a".into())), Value::Int(1));
        assert!(map.has_entry(&Value::Str("a".into())));
        assert_eq!(map.len(), 1);
        assert!(map.remove_entry(&Value::Str("a".into())));
        assert!(!map.has_entry(&Value::Str("a".into())));
        assert!(!map.remove_entry(&Value::Str("a".into())));
    }

    #[test]
    fn map_resolves_raw_and_reactive_key_forms() {
        let key_target = Obj::record();
        let map = reactive_map();
        // Store under the raw form, look up with the proxied form.
        map.set_entry(Value::Obj(key_target.clone()), 7);
        let proxied_key = reactive(key_target.clone());
        assert_eq!(map.get_entry(&proxied_key), Value::Int(7));
        assert!(map.has_entry(&proxied_key));
        assert!(map.remove_entry(&proxied_key));
        assert!(!map.has_entry(&Value::Obj(key_target)));
    }

    #[test]
    fn set_add_deduplicates() {
        let set = reactive_set();
        set.add(1);
        set.add(1);
        assert_eq!(set.len(), 1);
        assert!(set.has_entry(&Value::Int(1)));
        set.clear();
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn values_are_stored_raw() {
        let map = reactive_map();
        let inner = Obj::record();
        map.set_entry("k", reactive(inner.clone()));
        // The stored value is the raw target; the read wraps it again.
        let read = map.get_entry(&Value::Str("k".into()));
        assert!(matches!(read, Value::Reactive(_)));
        assert_eq!(to_raw(&read), Value::Obj(inner));
    }

    #[test]
    fn readonly_collections_refuse_mutation() {
        let map = reactive_map();
        map.set_entry("a", 1);
        let frozen = readonly(Value::Reactive(map.clone()))
            .as_reactive()
            .unwrap()
            .clone();
        frozen.set_entry("a", 2);
        frozen.remove_entry(&Value::Str("a".into()));
        frozen.clear();
        assert_eq!(map.get_entry(&Value::Str("a".into())), Value::Int(1));
    }

    #[test]
    fn for_each_visits_value_key_pairs() {
        let map = reactive_map();
        map.set_entry("a", 1);
        map.set_entry("b", 2);
        let mut seen = Vec::new();
        map.for_each(|value, key| {
            seen.push((key.clone(), value.clone()));
        });
        assert_eq!(
            seen,
            vec![
                (Value::Str("a".into()), Value::Int(1)),
                (Value::Str("b".into()), Value::Int(2)),
            ]
        );
    }
}
