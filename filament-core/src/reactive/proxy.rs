//! Reactive Proxies
//!
//! A `Reactive` is an observing view over a raw target. Every read routes
//! through `track` and every mutation through `trigger`, with the variant
//! pair (readonly, shallow) fixed when the view is created.
//!
//! # Identity
//!
//! For a given target and variant, at most one proxy exists: creation goes
//! through per-variant identity caches keyed by target id, so re-wrapping
//! returns the cached instance and proxy equality is meaningful. The caches
//! hold weak handles and are purged when the target is dropped.
//!
//! # Variants
//!
//! - mutable (deep): reads track and auto-wrap nested containers, refs
//!   stored in record fields unwrap on read and are written through on
//!   assignment.
//! - shallow: reads track but return nested values as stored.
//! - readonly / shallow-readonly: reads do not track; mutations report a
//!   diagnostic and leave the target untouched, returning success-shaped
//!   results rather than panicking.
//!
//! This file carries the record/list instrumentation; the map/set
//! instrumentation lives in `collections`.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;

use super::dep::{self, pause_scheduling, pause_tracking, reset_scheduling, reset_tracking};
use super::key::{integer_key, Key};
use super::ops::{TrackOp, TriggerOp};
use super::target::{Obj, Storage, TargetId, TargetKind};
use super::value::{value_changed, Value};

/// The variant pair of a proxy, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mode {
    pub readonly: bool,
    pub shallow: bool,
}

impl Mode {
    const MUTABLE: Mode = Mode {
        readonly: false,
        shallow: false,
    };
    const SHALLOW: Mode = Mode {
        readonly: false,
        shallow: true,
    };
    const READONLY: Mode = Mode {
        readonly: true,
        shallow: false,
    };
    const SHALLOW_READONLY: Mode = Mode {
        readonly: true,
        shallow: true,
    };

    fn cache_index(self) -> usize {
        (self.readonly as usize) << 1 | self.shallow as usize
    }
}

struct ReactiveInner {
    target: Obj,
    mode: Mode,

    /// Set when a readonly view was created over an already-reactive view;
    /// `is_reactive` stays true for such proxies.
    of_reactive: bool,
}

/// A reactive view over a raw target.
pub struct Reactive {
    inner: Arc<ReactiveInner>,
}

type ProxyCache = DashMap<(TargetId, bool), Weak<ReactiveInner>>;

// One identity cache per variant.
static CACHES: OnceLock<[ProxyCache; 4]> = OnceLock::new();

fn caches() -> &'static [ProxyCache; 4] {
    CACHES.get_or_init(|| {
        [
            DashMap::new(),
            DashMap::new(),
            DashMap::new(),
            DashMap::new(),
        ]
    })
}

/// Purge the identity caches for a dropped target.
pub(crate) fn forget_target(target: TargetId) {
    for cache in caches() {
        cache.remove(&(target, false));
        cache.remove(&(target, true));
    }
}

fn wrap(target: Obj, mode: Mode, of_reactive: bool) -> Value {
    if target.is_skip() {
        return Value::Obj(target);
    }
    let cache = &caches()[mode.cache_index()];
    let key = (target.id(), of_reactive);
    if let Some(existing) = cache.get(&key) {
        if let Some(inner) = existing.upgrade() {
            return Value::Reactive(Reactive { inner });
        }
    }
    let inner = Arc::new(ReactiveInner {
        target,
        mode,
        of_reactive,
    });
    cache.insert(key, Arc::downgrade(&inner));
    Value::Reactive(Reactive { inner })
}

fn create_reactive(value: Value, mode: Mode) -> Value {
    match value {
        Value::Obj(target) => wrap(target, mode, false),
        Value::Reactive(proxy) => {
            // A proxy of a proxy is a no-op, unless a readonly view is
            // requested over a mutable one.
            if mode.readonly && !proxy.is_readonly() {
                let target = proxy.inner.target.clone();
                wrap(
                    target,
                    Mode {
                        readonly: true,
                        shallow: mode.shallow,
                    },
                    true,
                )
            } else {
                Value::Reactive(proxy)
            }
        }
        Value::Ref(_) => value,
        other => {
            tracing::warn!("value cannot be made reactive: {}", other);
            other
        }
    }
}

/// Wrap a value in a deep mutable reactive view.
///
/// Non-observable values (primitives, refs, `mark_raw` targets) pass
/// through unchanged; that is not an error.
pub fn reactive(value: impl Into<Value>) -> Value {
    create_reactive(value.into(), Mode::MUTABLE)
}

/// Wrap a value in a shallow mutable reactive view: only top-level access
/// is observed, nested values are returned as stored.
pub fn shallow_reactive(value: impl Into<Value>) -> Value {
    create_reactive(value.into(), Mode::SHALLOW)
}

/// Wrap a value in a deep readonly view. Mutations through the view report
/// a diagnostic and do nothing.
pub fn readonly(value: impl Into<Value>) -> Value {
    create_reactive(value.into(), Mode::READONLY)
}

/// Wrap a value in a shallow readonly view.
pub fn shallow_readonly(value: impl Into<Value>) -> Value {
    create_reactive(value.into(), Mode::SHALLOW_READONLY)
}

/// Wrap container values reactively; return everything else unchanged.
pub fn to_reactive(value: Value) -> Value {
    match value {
        Value::Obj(_) => reactive(value),
        other => other,
    }
}

/// Wrap container values readonly; return everything else unchanged.
pub fn to_readonly(value: Value) -> Value {
    match value {
        Value::Obj(_) => readonly(value),
        other => other,
    }
}

/// Whether the value is a mutable reactive view (or a readonly view layered
/// over one).
pub fn is_reactive(value: &Value) -> bool {
    match value {
        Value::Reactive(proxy) => !proxy.inner.mode.readonly || proxy.inner.of_reactive,
        _ => false,
    }
}

/// Whether the value is a readonly view or a readonly ref.
pub fn is_readonly(value: &Value) -> bool {
    match value {
        Value::Reactive(proxy) => proxy.inner.mode.readonly,
        Value::Ref(cell) => cell.is_readonly(),
        _ => false,
    }
}

/// Whether the value is a shallow view or a shallow ref.
pub fn is_shallow(value: &Value) -> bool {
    match value {
        Value::Reactive(proxy) => proxy.inner.mode.shallow,
        Value::Ref(cell) => cell.is_shallow(),
        _ => false,
    }
}

/// Whether the value is any reactive view.
pub fn is_proxy(value: &Value) -> bool {
    matches!(value, Value::Reactive(_))
}

/// Unwrap a reactive view to its raw target. Non-proxies return unchanged.
pub fn to_raw(value: &Value) -> Value {
    match value {
        Value::Reactive(proxy) => Value::Obj(proxy.inner.target.clone()),
        other => other.clone(),
    }
}

/// Mark a container as never observable: wrapping it afterwards returns it
/// unchanged. Non-containers pass through.
pub fn mark_raw(value: Value) -> Value {
    if let Value::Obj(target) = &value {
        target.mark_skip();
    }
    value
}

impl Reactive {
    /// The raw target behind this view.
    pub fn target(&self) -> &Obj {
        &self.inner.target
    }

    /// The raw target's identity.
    pub fn id(&self) -> TargetId {
        self.inner.target.id()
    }

    /// The target's shape.
    pub fn kind(&self) -> TargetKind {
        self.inner.target.kind()
    }

    /// Whether this view is readonly.
    pub fn is_readonly(&self) -> bool {
        self.inner.mode.readonly
    }

    /// Whether this view is shallow.
    pub fn is_shallow(&self) -> bool {
        self.inner.mode.shallow
    }

    pub(crate) fn inner_ptr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Wrap a nested read result according to this view's variant.
    pub(crate) fn wrap_nested(&self, value: Value) -> Value {
        if self.inner.mode.shallow {
            return value;
        }
        if self.inner.mode.readonly {
            to_readonly(value)
        } else {
            to_reactive(value)
        }
    }

    /// Canonicalize integer-like field names on lists, so `"3"` and index
    /// 3 name the same slot.
    fn normalize_key(&self, key: Key) -> Key {
        if self.kind() == TargetKind::List {
            if let Key::Field(name) = &key {
                if name == "length" {
                    return Key::Length;
                }
                if let Some(index) = integer_key(name) {
                    return Key::Index(index);
                }
            }
        }
        key
    }

    fn kind_guard(&self, expected: &[TargetKind], operation: &str) -> bool {
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

    /// Read the value at a key, untracked.
    pub(crate) fn raw_get(&self, key: &Key) -> Option<Value> {
        self.inner.target.read(|storage| match (storage, key) {
            (Storage::Record(fields), Key::Field(name)) => fields.get(name).cloned(),
            (Storage::List(items), Key::Index(index)) => items.get(*index).cloned(),
            (Storage::List(items), Key::Length) => Some(Value::Int(items.len() as i64)),
            _ => None,
        })
    }

    pub(crate) fn raw_has(&self, key: &Key) -> bool {
        self.inner.target.read(|storage| match (storage, key) {
            (Storage::Record(fields), Key::Field(name)) => fields.contains_key(name),
            (Storage::List(items), Key::Index(index)) => *index < items.len(),
            (Storage::List(_), Key::Length) => true,
            _ => false,
        })
    }

    /// Read a record field or list slot.
    ///
    /// Tracks the key (readonly views do not track). Deep views unwrap refs
    /// stored in record fields and wrap nested containers; shallow views
    /// return values as stored. Missing keys read as `Null`.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = self.normalize_key(key.into());
        if !self.kind_guard(&[TargetKind::Record, TargetKind::List], "get()") {
            return Value::Null;
        }
        if !self.inner.mode.readonly {
            dep::track(self.id(), TrackOp::Get, key.clone());
        }
        let result = self.raw_get(&key).unwrap_or(Value::Null);
        if self.inner.mode.shallow {
            return result;
        }
        if let Value::Ref(cell) = &result {
            // Refs nested in records unwrap on read; list slots hold them
            // as-is so index access stays positional.
            let is_list_index = self.kind() == TargetKind::List && matches!(key, Key::Index(_));
            if !is_list_index {
                return cell.get();
            }
        }
        self.wrap_nested(result)
    }

    /// Write a record field or list slot.
    ///
    /// Distinguishes adding a new key from changing an existing one (a list
    /// index below the current length counts as existing), preserves refs
    /// stored in record fields by writing through them, and triggers only
    /// when the value actually changed. Readonly views report a diagnostic
    /// and do nothing.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) {
        let key = self.normalize_key(key.into());
        let mut value = value.into();
        if !self.kind_guard(&[TargetKind::Record, TargetKind::List], "set()") {
            return;
        }
        if self.inner.mode.readonly {
            tracing::warn!(
                "set operation on key \"{}\" failed: target is readonly",
                key
            );
            return;
        }
        if self.kind() == TargetKind::List && key == Key::Length {
            if let Ok(len) = value.as_int() {
                self.set_len(len.max(0) as usize);
                return;
            }
        }
        let old = self.raw_get(&key);
        if !self.inner.mode.shallow {
            if !is_shallow(&value) && !is_readonly(&value) {
                value = to_raw(&value);
            }
            if self.kind() == TargetKind::Record {
                if let Some(Value::Ref(old_ref)) = &old {
                    if !matches!(value, Value::Ref(_)) {
                        if !old_ref.is_readonly() {
                            old_ref.set(value);
                        }
                        return;
                    }
                }
            }
        }
        let had = self.raw_has(&key);
        self.inner.target.write(|storage| match (storage, &key) {
            (Storage::Record(fields), Key::Field(name)) => {
                fields.insert(name.clone(), value.clone());
            }
            (Storage::List(items), Key::Index(index)) => {
                if *index < items.len() {
                    items[*index] = value.clone();
                } else {
                    items.resize(*index, Value::Null);
                    items.push(value.clone());
                }
            }
            _ => {}
        });
        if !had {
            dep::trigger(self.id(), TriggerOp::Add, Some(key), Some(value), None);
        } else if value_changed(&value, old.as_ref().unwrap_or(&Value::Null)) {
            dep::trigger(self.id(), TriggerOp::Set, Some(key), Some(value), old);
        }
    }

    /// Whether a key is present. Tracks a presence dependency.
    pub fn has(&self, key: impl Into<Key>) -> bool {
        let key = self.normalize_key(key.into());
        if !self.kind_guard(&[TargetKind::Record, TargetKind::List], "has()") {
            return false;
        }
        if !self.inner.mode.readonly {
            dep::track(self.id(), TrackOp::Has, key.clone());
        }
        self.raw_has(&key)
    }

    /// Remove a key. Record fields are removed preserving order; list slots
    /// become `Null` holes. Returns whether the key existed.
    pub fn remove(&self, key: impl Into<Key>) -> bool {
        let key = self.normalize_key(key.into());
        if !self.kind_guard(&[TargetKind::Record, TargetKind::List], "remove()") {
            return false;
        }
        if self.inner.mode.readonly {
            tracing::warn!(
                "delete operation on key \"{}\" failed: target is readonly",
                key
            );
            return true;
        }
        let had = self.raw_has(&key);
        let old = self.raw_get(&key);
        if !had {
            return false;
        }
        self.inner.target.write(|storage| match (storage, &key) {
            (Storage::Record(fields), Key::Field(name)) => {
                fields.shift_remove(name);
            }
            (Storage::List(items), Key::Index(index)) => {
                items[*index] = Value::Null;
            }
            _ => {}
        });
        dep::trigger(self.id(), TriggerOp::Delete, Some(key), None, old);
        true
    }

    /// Record field names without tracking, used internally.
    pub(crate) fn raw_field_names(&self) -> Vec<String> {
        self.inner.target.read(|storage| match storage {
            Storage::Record(fields) => fields.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    /// Record field names, in insertion order. Tracks iteration.
    pub fn keys(&self) -> Vec<String> {
        if !self.kind_guard(&[TargetKind::Record], "keys()") {
            return Vec::new();
        }
        if !self.inner.mode.readonly {
            dep::track(self.id(), TrackOp::Iterate, Key::Iterate);
        }
        self.inner.target.read(|storage| match storage {
            Storage::Record(fields) => fields.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    /// Number of fields, items, or entries.
    ///
    /// Lists track the length slot; records and collections track
    /// iteration.
    pub fn len(&self) -> usize {
        if !self.inner.mode.readonly {
            match self.kind() {
                TargetKind::List => dep::track(self.id(), TrackOp::Get, Key::Length),
                _ => dep::track(self.id(), TrackOp::Iterate, Key::Iterate),
            }
        }
        self.inner.target.raw_len()
    }

    /// Whether the container is empty, with the same tracking as [`len`].
    ///
    /// [`len`]: Reactive::len
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize a list. Shrinking notifies every index at or beyond the new
    /// length; growing pads with `Null`.
    pub fn set_len(&self, new_len: usize) {
        if !self.kind_guard(&[TargetKind::List], "set_len()") {
            return;
        }
        if self.inner.mode.readonly {
            tracing::warn!("set operation on key \"length\" failed: target is readonly");
            return;
        }
        let old_len = self.inner.target.raw_len();
        if new_len == old_len {
            return;
        }
        self.inner.target.write(|storage| {
            if let Storage::List(items) = storage {
                items.resize(new_len, Value::Null);
            }
        });
        dep::trigger(
            self.id(),
            TriggerOp::Set,
            Some(Key::Length),
            Some(Value::Int(new_len as i64)),
            Some(Value::Int(old_len as i64)),
        );
    }

    /// Append to a list, returning the new length.
    pub fn push(&self, value: impl Into<Value>) -> usize {
        if !self.kind_guard(&[TargetKind::List], "push()") {
            return 0;
        }
        if self.inner.mode.readonly {
            tracing::warn!("push operation failed: target is readonly");
            return self.inner.target.raw_len();
        }
        pause_tracking();
        pause_scheduling();
        let index = self.inner.target.raw_len();
        self.set(Key::Index(index), value);
        reset_scheduling();
        reset_tracking();
        index + 1
    }

    /// Remove and return the last list item (`Null` when empty).
    pub fn pop(&self) -> Value {
        if !self.kind_guard(&[TargetKind::List], "pop()") {
            return Value::Null;
        }
        if self.inner.mode.readonly {
            tracing::warn!("pop operation failed: target is readonly");
            return Value::Null;
        }
        pause_tracking();
        pause_scheduling();
        let len = self.inner.target.raw_len();
        let value = if len == 0 {
            Value::Null
        } else {
            let value = self.raw_get(&Key::Index(len - 1)).unwrap_or(Value::Null);
            self.set_len(len - 1);
            value
        };
        reset_scheduling();
        reset_tracking();
        value
    }

    /// Remove and return the first list item (`Null` when empty).
    pub fn shift(&self) -> Value {
        match self.splice(0, 1, Vec::new()).into_iter().next() {
            Some(value) => value,
            None => Value::Null,
        }
    }

    /// Prepend to a list, returning the new length.
    pub fn unshift(&self, value: impl Into<Value>) -> usize {
        self.splice(0, 0, vec![value.into()]);
        self.inner.target.raw_len()
    }

    /// Replace `delete_count` items starting at `start` with `items`,
    /// returning the removed items.
    ///
    /// Runs with tracking and scheduling paused, then triggers once per
    /// affected slot; subscribers still re-run once per flush because the
    /// queue deduplicates.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Vec<Value> {
        if !self.kind_guard(&[TargetKind::List], "splice()") {
            return Vec::new();
        }
        if self.inner.mode.readonly {
            tracing::warn!("splice operation failed: target is readonly");
            return Vec::new();
        }
        pause_tracking();
        pause_scheduling();
        let old: Vec<Value> = self.inner.target.read(|storage| match storage {
            Storage::List(list) => list.clone(),
            _ => Vec::new(),
        });
        let start = start.min(old.len());
        let delete_count = delete_count.min(old.len() - start);
        let removed: Vec<Value> = old[start..start + delete_count].to_vec();
        let new: Vec<Value> = self.inner.target.write(|storage| {
            if let Storage::List(list) = storage {
                list.splice(start..start + delete_count, items);
                list.clone()
            } else {
                Vec::new()
            }
        });
        for index in 0..old.len().min(new.len()) {
            if value_changed(&new[index], &old[index]) {
                dep::trigger(
                    self.id(),
                    TriggerOp::Set,
                    Some(Key::Index(index)),
                    Some(new[index].clone()),
                    Some(old[index].clone()),
                );
            }
        }
        for index in old.len()..new.len() {
            dep::trigger(
                self.id(),
                TriggerOp::Add,
                Some(Key::Index(index)),
                Some(new[index].clone()),
                None,
            );
        }
        if new.len() < old.len() {
            dep::trigger(
                self.id(),
                TriggerOp::Set,
                Some(Key::Length),
                Some(Value::Int(new.len() as i64)),
                Some(Value::Int(old.len() as i64)),
            );
        }
        reset_scheduling();
        reset_tracking();
        removed
    }

    /// Track every index, then search. Needed because a search is sensitive
    /// to every slot of the list.
    fn track_all_indices(&self) {
        if self.inner.mode.readonly {
            return;
        }
        dep::track(self.id(), TrackOp::Get, Key::Length);
        let len = self.inner.target.raw_len();
        for index in 0..len {
            dep::track(self.id(), TrackOp::Get, Key::Index(index));
        }
    }

    /// Search the raw list with `matches`; on a miss retry with the needle
    /// unwrapped to raw, so searching for a proxy or for its raw target
    /// both succeed.
    fn search_raw(
        &self,
        needle: &Value,
        matches: impl Fn(&Value, &Value) -> bool,
        reverse: bool,
    ) -> Option<usize> {
        let items: Vec<Value> = self.inner.target.read(|storage| match storage {
            Storage::List(list) => list.clone(),
            _ => Vec::new(),
        });
        let find = |needle: &Value| -> Option<usize> {
            if reverse {
                items.iter().rposition(|item| matches(item, needle))
            } else {
                items.iter().position(|item| matches(item, needle))
            }
        };
        if let Some(index) = find(needle) {
            return Some(index);
        }
        let raw = to_raw(needle);
        if !raw.strict_eq(needle) {
            return find(&raw);
        }
        None
    }

    /// Membership search (NaN finds NaN). Tracks every index.
    pub fn contains(&self, needle: &Value) -> bool {
        if !self.kind_guard(&[TargetKind::List], "contains()") {
            return false;
        }
        self.track_all_indices();
        self.search_raw(needle, Value::same_value_zero, false).is_some()
    }

    /// First-position search with strict equality (NaN never matches).
    /// Tracks every index.
    pub fn index_of(&self, needle: &Value) -> Option<usize> {
        if !self.kind_guard(&[TargetKind::List], "index_of()") {
            return None;
        }
        self.track_all_indices();
        self.search_raw(needle, Value::strict_eq, false)
    }

    /// Last-position search with strict equality. Tracks every index.
    pub fn last_index_of(&self, needle: &Value) -> Option<usize> {
        if !self.kind_guard(&[TargetKind::List], "last_index_of()") {
            return None;
        }
        self.track_all_indices();
        self.search_raw(needle, Value::strict_eq, true)
    }

    /// Bulk-replace the contents from another container of the same shape.
    ///
    /// A source of a different shape is refused with a diagnostic. The swap
    /// runs as one atomic batch, triggering per changed slot.
    pub fn replace(&self, source: impl Into<Value>) {
        if self.inner.mode.readonly {
            tracing::warn!("replace operation failed: target is readonly");
            return;
        }
        let source = source.into();
        let raw = to_raw(&source);
        let source_obj = match raw.as_obj() {
            Ok(obj) => obj.clone(),
            Err(error) => {
                tracing::warn!(
                    "replace operation failed: expected a {}, found {}",
                    self.kind().name(),
                    error.found
                );
                return;
            }
        };
        if source_obj.kind() != self.kind() {
            tracing::warn!(
                "replace operation failed: expected a {}, found a {}",
                self.kind().name(),
                source_obj.kind().name()
            );
            return;
        }
        if source_obj.id() == self.id() {
            return;
        }
        pause_tracking();
        pause_scheduling();
        let old = self.inner.target.snapshot();
        let new = source_obj.snapshot();
        self.inner.target.write(|storage| *storage = new.clone());
        match (&old, &new) {
            (Storage::Record(old_fields), Storage::Record(new_fields)) => {
                for (name, old_value) in old_fields {
                    if !new_fields.contains_key(name) {
                        dep::trigger(
                            self.id(),
                            TriggerOp::Delete,
                            Some(Key::Field(name.clone())),
                            None,
                            Some(old_value.clone()),
                        );
                    }
                }
                for (name, new_value) in new_fields {
                    match old_fields.get(name) {
                        None => dep::trigger(
                            self.id(),
                            TriggerOp::Add,
                            Some(Key::Field(name.clone())),
                            Some(new_value.clone()),
                            None,
                        ),
                        Some(old_value) => {
                            if value_changed(new_value, old_value) {
                                dep::trigger(
                                    self.id(),
                                    TriggerOp::Set,
                                    Some(Key::Field(name.clone())),
                                    Some(new_value.clone()),
                                    Some(old_value.clone()),
                                );
                            }
                        }
                    }
                }
            }
            (Storage::List(old_items), Storage::List(new_items)) => {
                for index in 0..old_items.len().min(new_items.len()) {
                    if value_changed(&new_items[index], &old_items[index]) {
                        dep::trigger(
                            self.id(),
                            TriggerOp::Set,
                            Some(Key::Index(index)),
                            Some(new_items[index].clone()),
                            Some(old_items[index].clone()),
                        );
                    }
                }
                for index in old_items.len()..new_items.len() {
                    dep::trigger(
                        self.id(),
                        TriggerOp::Add,
                        Some(Key::Index(index)),
                        Some(new_items[index].clone()),
                        None,
                    );
                }
                if new_items.len() < old_items.len() {
                    dep::trigger(
                        self.id(),
                        TriggerOp::Set,
                        Some(Key::Length),
                        Some(Value::Int(new_items.len() as i64)),
                        Some(Value::Int(old_items.len() as i64)),
                    );
                }
            }
            (Storage::Map(old_entries), Storage::Map(new_entries)) => {
                for (key, old_value) in old_entries {
                    if !new_entries.contains_key(key) {
                        dep::trigger(
                            self.id(),
                            TriggerOp::Delete,
                            Some(Key::Entry(key.clone())),
                            None,
                            Some(old_value.clone()),
                        );
                    }
                }
                for (key, new_value) in new_entries {
                    match old_entries.get(key) {
                        None => dep::trigger(
                            self.id(),
                            TriggerOp::Add,
                            Some(Key::Entry(key.clone())),
                            Some(new_value.clone()),
                            None,
                        ),
                        Some(old_value) => {
                            if value_changed(new_value, old_value) {
                                dep::trigger(
                                    self.id(),
                                    TriggerOp::Set,
                                    Some(Key::Entry(key.clone())),
                                    Some(new_value.clone()),
                                    Some(old_value.clone()),
                                );
                            }
                        }
                    }
                }
            }
            (Storage::Set(old_items), Storage::Set(new_items)) => {
                for item in old_items {
                    if !new_items.contains(item) {
                        dep::trigger(
                            self.id(),
                            TriggerOp::Delete,
                            Some(Key::Entry(item.clone())),
                            None,
                            Some(item.value().clone()),
                        );
                    }
                }
                for item in new_items {
                    if !old_items.contains(item) {
                        dep::trigger(
                            self.id(),
                            TriggerOp::Add,
                            Some(Key::Entry(item.clone())),
                            Some(item.value().clone()),
                            None,
                        );
                    }
                }
            }
            _ => {}
        }
        reset_scheduling();
        reset_tracking();
    }
}

impl Clone for Reactive {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for Reactive {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Reactive {}

impl fmt::Debug for Reactive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactive")
            .field("target", &self.inner.target)
            .field("readonly", &self.inner.mode.readonly)
            .field("shallow", &self.inner.mode.shallow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_reactive(value: &Value) -> Reactive {
        value.as_reactive().expect("expected a reactive value").clone()
    }

    #[test]
    fn rewrapping_returns_the_cached_proxy() {
        let target = Obj::record_from([("a", 1)]);
        let first = reactive(target.clone());
        let second = reactive(target.clone());
        assert_eq!(first, second, "identity must be stable per (target, variant)");
        // A proxy of a proxy is a no-op.
        let third = reactive(first.clone());
        assert_eq!(first, third);
        // But a different variant is a different proxy.
        let shallow = shallow_reactive(target);
        assert_ne!(first, shallow);
    }

    #[test]
    fn to_raw_returns_the_original_target() {
        let target = Obj::record();
        let proxy = reactive(target.clone());
        assert_eq!(to_raw(&proxy), Value::Obj(target));
    }

    #[test]
    fn mark_raw_values_are_never_wrapped() {
        let target = mark_raw(Value::Obj(Obj::record()));
        let wrapped = reactive(target.clone());
        assert!(matches!(wrapped, Value::Obj(_)));
        assert!(!is_reactive(&wrapped));
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(reactive(Value::Int(3)), Value::Int(3));
        assert!(!is_proxy(&reactive(Value::Int(3))));
    }

    #[test]
    fn add_vs_set_and_change_detection() {
        let proxy = as_reactive(&reactive(Obj::record()));
        proxy.set("a", 1);
        assert_eq!(proxy.get("a"), Value::Int(1));
        assert!(proxy.has("a"));
        assert!(!proxy.has("b"));
        proxy.remove("a");
        assert!(!proxy.has("a"));
    }

    #[test]
    fn deep_reads_wrap_nested_containers() {
        let nested = Obj::record_from([("x", 1)]);
        let proxy = as_reactive(&reactive(Obj::record_from([("inner", nested.clone())])));
        let inner = proxy.get("inner");
        assert!(is_reactive(&inner));
        assert_eq!(to_raw(&inner), Value::Obj(nested));
        // Shallow views return the raw value as stored.
        let shallow = as_reactive(&shallow_reactive(proxy.target().clone()));
        assert!(matches!(shallow.get("inner"), Value::Obj(_)));
    }

    #[test]
    fn readonly_views_report_and_refuse_mutations() {
        let target = Obj::record_from([("a", 1)]);
        let view = as_reactive(&readonly(target.clone()));
        view.set("a", 2);
        view.remove("a");
        // The underlying value is untouched and still readable.
        assert_eq!(view.get("a"), Value::Int(1));
        let mutable = as_reactive(&reactive(target));
        assert_eq!(mutable.get("a"), Value::Int(1));
    }

    #[test]
    fn readonly_over_reactive_is_still_reactive() {
        let target = Obj::record();
        let mutable = reactive(target.clone());
        let frozen = readonly(mutable.clone());
        assert!(is_readonly(&frozen));
        assert!(is_reactive(&frozen));
        // Readonly over raw is readonly but not reactive.
        let frozen_raw = readonly(Value::Obj(Obj::record()));
        assert!(is_readonly(&frozen_raw));
        assert!(!is_reactive(&frozen_raw));
    }

    #[test]
    fn list_identity_search_retries_with_raw_needle() {
        let element = Obj::record();
        let list = as_reactive(&reactive(Obj::list_from([Value::Obj(element.clone())])));
        // Searching for the proxied form still finds the raw element.
        let proxied = reactive(element.clone());
        assert!(list.contains(&proxied));
        assert_eq!(list.index_of(&proxied), Some(0));
        assert!(list.contains(&Value::Obj(element)));
    }

    #[test]
    fn nan_search_semantics() {
        let list = as_reactive(&reactive(Obj::list_from([Value::Float(f64::NAN)])));
        assert!(list.contains(&Value::Float(f64::NAN)));
        assert_eq!(list.index_of(&Value::Float(f64::NAN)), None);
        assert_eq!(list.last_index_of(&Value::Float(f64::NAN)), None);
    }

    #[test]
    fn splice_reports_removed_items() {
        let list = as_reactive(&reactive(Obj::list_from([1, 2, 3, 4])));
        let removed = list.splice(1, 2, vec![Value::Int(9)]);
        assert_eq!(removed, vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(1usize), Value::Int(9));
        assert_eq!(list.get(2usize), Value::Int(4));
    }

    #[test]
    fn replace_refuses_shape_mismatch() {
        let record = as_reactive(&reactive(Obj::record_from([("a", 1)])));
        record.replace(Obj::list());
        // Refused: the record keeps its contents.
        assert_eq!(record.get("a"), Value::Int(1));
        record.replace(Obj::record_from([("b", 2)]));
        assert!(!record.has("a"));
        assert_eq!(record.get("b"), Value::Int(2));
    }

    #[test]
    fn ref_preserving_assignment() {
        use super::super::refs::Ref;
        let cell = Ref::new(1);
        let record = as_reactive(&reactive(Obj::record_from([(
            "cell",
            Value::Ref(cell.clone()),
        )])));
        // Reading unwraps the ref.
        assert_eq!(record.get("cell"), Value::Int(1));
        // Writing a plain value routes through the ref.
        record.set("cell", 5);
        assert_eq!(cell.get(), Value::Int(5));
        assert_eq!(record.get("cell"), Value::Int(5));
    }
}
