//! Refs
//!
//! A `Ref` is a single reactive cell: reading `.value` tracks, writing
//! triggers only on a real change. One public type covers the variants:
//!
//! - plain refs deep-wrap container values on read,
//! - shallow refs return values as stored,
//! - getter refs wrap a readonly closure,
//! - property refs proxy one key of a reactive container (two-way),
//! - custom refs hand the track/trigger primitives to user code,
//! - computed refs delegate to a [`Computed`].

use std::fmt;
use std::sync::{Arc, RwLock};

use super::computed::Computed;
use super::dep::{track_ref_value, trigger_ref_value};
use super::key::Key;
use super::proxy::{to_raw, to_reactive, Reactive};
use super::target::TargetId;
use super::value::{value_changed, Value};

type GetFn = Box<dyn Fn() -> Value + Send + Sync>;
type SetFn = Box<dyn Fn(Value) + Send + Sync>;

/// The `track` primitive handed to a custom ref factory.
pub type RefTrack = Box<dyn Fn() + Send + Sync>;

/// The `trigger` primitive handed to a custom ref factory; arguments are
/// `(new_value, old_value)`.
pub type RefTrigger = Box<dyn Fn(Value, Value) + Send + Sync>;

/// The accessor pair a custom ref factory returns.
pub struct CustomRefOps {
    /// Produce the current value; call the track primitive to subscribe
    /// the reader.
    pub get: GetFn,

    /// Store a new value; call the trigger primitive to notify.
    pub set: SetFn,
}

enum RefKind {
    Plain {
        shallow: bool,
        value: RwLock<Value>,
        raw: RwLock<Value>,
    },
    Getter {
        get: GetFn,
    },
    Property {
        source: Reactive,
        key: Key,
        default: Option<Value>,
        shallow: bool,
    },
    Custom {
        get: GetFn,
        set: SetFn,
    },
    Computed(Computed),
}

struct RefInner {
    id: TargetId,
    kind: RefKind,
}

impl Drop for RefInner {
    fn drop(&mut self) {
        super::dep::forget_target(self.id);
    }
}

/// A single reactive cell.
///
/// Cloning shares the cell; equality follows identity.
pub struct Ref {
    inner: Arc<RefInner>,
}

impl Ref {
    fn from_kind(kind: RefKind) -> Self {
        Self {
            inner: Arc::new(RefInner {
                id: TargetId::new(),
                kind,
            }),
        }
    }

    /// Create a deep ref: container values wrap reactively on read.
    pub fn new(value: impl Into<Value>) -> Self {
        let value = value.into();
        let raw = to_raw(&value);
        Self::from_kind(RefKind::Plain {
            shallow: false,
            value: RwLock::new(value),
            raw: RwLock::new(raw),
        })
    }

    /// Create a shallow ref: values are returned as stored, and only
    /// `.value` assignments are observed.
    pub fn shallow(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::from_kind(RefKind::Plain {
            shallow: true,
            raw: RwLock::new(value.clone()),
            value: RwLock::new(value),
        })
    }

    /// Create a readonly ref backed by a getter closure.
    pub fn getter<F>(get: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::from_kind(RefKind::Getter { get: Box::new(get) })
    }

    /// Create a ref from user-supplied accessors.
    ///
    /// The factory receives the cell's own track and trigger primitives
    /// and returns the `{get, set}` pair to install.
    pub fn custom<F>(factory: F) -> Self
    where
        F: FnOnce(RefTrack, RefTrigger) -> CustomRefOps,
    {
        let id = TargetId::new();
        let track: RefTrack = Box::new(move || track_ref_value(id));
        let trigger: RefTrigger =
            Box::new(move |new_value, old_value| trigger_ref_value(id, Some(new_value), Some(old_value)));
        let ops = factory(track, trigger);
        Self {
            inner: Arc::new(RefInner {
                id,
                kind: RefKind::Custom {
                    get: ops.get,
                    set: ops.set,
                },
            }),
        }
    }

    pub(crate) fn from_computed(computed: Computed) -> Self {
        Self::from_kind(RefKind::Computed(computed))
    }

    fn property(source: Reactive, key: Key, default: Option<Value>, shallow: bool) -> Self {
        Self::from_kind(RefKind::Property {
            source,
            key,
            default,
            shallow,
        })
    }

    /// The cell's identity in the dependency store.
    pub fn id(&self) -> TargetId {
        self.inner.id
    }

    pub(crate) fn inner_ptr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Read the cell. Always tracks (for variants with their own dep);
    /// deep refs wrap container values reactively.
    pub fn get(&self) -> Value {
        match &self.inner.kind {
            RefKind::Plain { shallow, value, .. } => {
                track_ref_value(self.inner.id);
                let value = value.read().expect("ref value lock poisoned").clone();
                if *shallow {
                    value
                } else {
                    to_reactive(value)
                }
            }
            RefKind::Getter { get } => get(),
            RefKind::Property {
                source,
                key,
                default,
                shallow,
            } => {
                let value = source.get(key.clone());
                let value = if !source.raw_has(key) {
                    default.clone().unwrap_or(value)
                } else {
                    value
                };
                if *shallow {
                    to_raw(&value)
                } else {
                    value
                }
            }
            RefKind::Custom { get, .. } => get(),
            RefKind::Computed(computed) => computed.get(),
        }
    }

    /// Write the cell. Plain refs compare raw-to-raw (for deep values) and
    /// trigger only on a real change; readonly variants report a
    /// diagnostic and do nothing.
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        match &self.inner.kind {
            RefKind::Plain {
                shallow,
                value: stored,
                raw,
            } => {
                let use_direct = *shallow
                    || super::proxy::is_shallow(&value)
                    || super::proxy::is_readonly(&value);
                let compare = if use_direct { value.clone() } else { to_raw(&value) };
                let changed = {
                    let raw = raw.read().expect("ref value lock poisoned");
                    value_changed(&compare, &raw)
                };
                if !changed {
                    return;
                }
                let old = {
                    let mut stored = stored.write().expect("ref value lock poisoned");
                    std::mem::replace(&mut *stored, value.clone())
                };
                *raw.write().expect("ref value lock poisoned") = compare;
                trigger_ref_value(self.inner.id, Some(value), Some(old));
            }
            RefKind::Getter { .. } => {
                tracing::warn!("write operation failed: ref is readonly");
            }
            RefKind::Property { source, key, .. } => {
                source.set(key.clone(), value);
            }
            RefKind::Custom { set, .. } => set(value),
            RefKind::Computed(computed) => computed.set(value),
        }
    }

    /// Read the current value without tracking.
    pub fn peek(&self) -> Value {
        match &self.inner.kind {
            RefKind::Plain { value, .. } => value.read().expect("ref value lock poisoned").clone(),
            RefKind::Getter { get } => get(),
            RefKind::Property { source, key, .. } => {
                source.raw_get(key).unwrap_or(Value::Null)
            }
            RefKind::Custom { get, .. } => get(),
            RefKind::Computed(computed) => computed.peek(),
        }
    }

    /// Whether writes to this ref are refused.
    pub fn is_readonly(&self) -> bool {
        match &self.inner.kind {
            RefKind::Getter { .. } => true,
            RefKind::Computed(computed) => computed.is_readonly(),
            _ => false,
        }
    }

    /// Whether this ref skips deep wrapping/unwrapping.
    pub fn is_shallow(&self) -> bool {
        match &self.inner.kind {
            RefKind::Plain { shallow, .. } => *shallow,
            RefKind::Property { shallow, .. } => *shallow,
            _ => false,
        }
    }

    fn kind_name(&self) -> &'static str {
        match &self.inner.kind {
            RefKind::Plain { shallow: false, .. } => "ref",
            RefKind::Plain { shallow: true, .. } => "shallow ref",
            RefKind::Getter { .. } => "getter ref",
            RefKind::Property { .. } => "property ref",
            RefKind::Custom { .. } => "custom ref",
            RefKind::Computed(_) => "computed ref",
        }
    }

    fn trigger_id(&self) -> TargetId {
        match &self.inner.kind {
            RefKind::Computed(computed) => computed.id(),
            _ => self.inner.id,
        }
    }
}

impl Clone for Ref {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Ref {}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.inner.id.raw())
            .field("kind", &self.kind_name())
            .finish()
    }
}

/// Whether a value is a ref.
pub fn is_ref(value: &Value) -> bool {
    matches!(value, Value::Ref(_))
}

/// Unwrap a ref to its current value; other values return unchanged.
pub fn unref(value: &Value) -> Value {
    match value {
        Value::Ref(cell) => cell.get(),
        other => other.clone(),
    }
}

/// Normalize a maybe-ref to a plain value. Getter refs evaluate their
/// closure, so this also serves as the "value or getter" resolver.
pub fn to_value(value: &Value) -> Value {
    unref(value)
}

/// Force-notify a ref's subscribers without a value change.
///
/// Useful after mutating the inner value of a shallow ref in place.
pub fn trigger_ref(cell: &Ref) {
    let current = cell.peek();
    trigger_ref_value(cell.trigger_id(), Some(current.clone()), Some(current));
}

/// Create a ref for one key of a container, preserving two-way binding.
///
/// A reactive source yields a property ref whose reads track through the
/// source and whose writes go through it. When the key is absent, the ref
/// reads as `default`. If the key currently holds a ref, that ref is
/// returned directly. Non-container sources are boxed into a plain ref.
pub fn to_ref(source: &Value, key: impl Into<Key>, default: Option<Value>, shallow: bool) -> Ref {
    let key = key.into();
    match source {
        Value::Ref(cell) => cell.clone(),
        Value::Reactive(proxy) => property_to_ref(proxy.clone(), key, default, shallow),
        Value::Obj(target) => match super::proxy::reactive(target.clone()) {
            Value::Reactive(proxy) => property_to_ref(proxy, key, default, shallow),
            other => {
                tracing::warn!("to_ref() source is not observable; returning a plain ref");
                Ref::new(other)
            }
        },
        other => Ref::new(other.clone()),
    }
}

fn property_to_ref(source: Reactive, key: Key, default: Option<Value>, shallow: bool) -> Ref {
    if let Some(Value::Ref(existing)) = source.raw_get(&key) {
        return existing;
    }
    Ref::property(source, key, default, shallow)
}

/// Create a property ref for every field of a reactive record, preserving
/// two-way binding. Field order follows the record.
pub fn to_refs(source: &Value) -> indexmap::IndexMap<String, Ref> {
    let mut refs = indexmap::IndexMap::new();
    if !super::proxy::is_reactive(source) {
        tracing::warn!("to_refs() expects a reactive object");
        return refs;
    }
    let Value::Reactive(proxy) = source else {
        return refs;
    };
    if proxy.kind() != super::target::TargetKind::Record {
        tracing::warn!(
            "to_refs() expects a reactive record, found a {}",
            proxy.kind().name()
        );
        return refs;
    }
    for name in proxy.raw_field_names() {
        let cell = property_to_ref(proxy.clone(), Key::Field(name.clone()), None, false);
        refs.insert(name, cell);
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::super::proxy::{is_reactive, reactive};
    use super::super::target::Obj;
    use super::super::watcher::Watcher;
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn setting_an_unchanged_value_does_not_trigger() {
        let cell = Ref::new(1);
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let cell_clone = cell.clone();
        let _watcher = Watcher::new(move || {
            cell_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        cell.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 1, "no change must not trigger");
        cell.set(2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        // NaN to NaN is not a change.
        cell.set(f64::NAN);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        cell.set(f64::NAN);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deep_ref_wraps_container_reads() {
        let cell = Ref::new(Obj::record_from([("a", 1)]));
        assert!(is_reactive(&cell.get()));
        let shallow = Ref::shallow(Obj::record_from([("a", 1)]));
        assert!(!is_reactive(&shallow.get()));
    }

    #[test]
    fn getter_refs_are_readonly() {
        let cell = Ref::getter(|| Value::Int(9));
        assert_eq!(cell.get(), Value::Int(9));
        assert!(cell.is_readonly());
        cell.set(1);
        assert_eq!(cell.get(), Value::Int(9));
    }

    #[test]
    fn property_refs_bind_two_ways() {
        let record = reactive(Obj::record_from([("count", 1)]));
        let cell = to_ref(&record, "count", None, false);
        assert_eq!(cell.get(), Value::Int(1));
        cell.set(5);
        assert_eq!(
            record.as_reactive().unwrap().get("count"),
            Value::Int(5),
            "writes go through the source"
        );
        let source = record.as_reactive().unwrap();
        source.set("count", 9);
        assert_eq!(cell.get(), Value::Int(9), "reads follow the source");
    }

    #[test]
    fn property_ref_defaults_apply_to_missing_keys() {
        let record = reactive(Obj::record());
        let cell = to_ref(&record, "missing", Some(Value::Int(42)), false);
        assert_eq!(cell.get(), Value::Int(42));
        cell.set(1);
        assert_eq!(cell.get(), Value::Int(1));
    }

    #[test]
    fn to_refs_covers_every_field() {
        let record = reactive(Obj::record_from([("a", 1), ("b", 2)]));
        let refs = to_refs(&record);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs["a"].get(), Value::Int(1));
        refs["b"].set(20);
        assert_eq!(record.as_reactive().unwrap().get("b"), Value::Int(20));
    }

    #[test]
    fn custom_refs_control_their_own_tracking() {
        let stored = Arc::new(RwLock::new(Value::Int(0)));
        let stored_get = stored.clone();
        let cell = Ref::custom(move |track, trigger| {
            let stored_set = stored_get.clone();
            let stored_read = stored_get.clone();
            CustomRefOps {
                get: Box::new(move || {
                    track();
                    stored_read.read().unwrap().clone()
                }),
                set: Box::new(move |new_value| {
                    let old_value =
                        std::mem::replace(&mut *stored_set.write().unwrap(), new_value.clone());
                    trigger(new_value, old_value);
                }),
            }
        });

        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let cell_clone = cell.clone();
        let _watcher = Watcher::new(move || {
            cell_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        cell.set(3);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(cell.get(), Value::Int(3));
    }

    #[test]
    fn unref_and_to_value() {
        let cell = Ref::new(7);
        assert_eq!(unref(&Value::Ref(cell.clone())), Value::Int(7));
        assert_eq!(unref(&Value::Int(3)), Value::Int(3));
        let getter = Ref::getter(|| Value::Int(11));
        assert_eq!(to_value(&Value::Ref(getter)), Value::Int(11));
    }

    #[test]
    fn trigger_ref_forces_notification() {
        let cell = Ref::shallow(Obj::record());
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let cell_clone = cell.clone();
        let _watcher = Watcher::new(move || {
            cell_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // An in-place mutation the outer comparison cannot see.
        trigger_ref(&cell);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
