//! Computed Values
//!
//! A `Computed` is a lazily-evaluated, cached derived value backed by a
//! lazy watcher. The getter does not run at creation; the first read
//! evaluates it, and subsequent reads return the cache until a dependency
//! change marks the watcher dirty again.
//!
//! Reading a computed always re-exposes the watcher's dependencies to the
//! currently-running computation, so a consumer re-subscribes even on a
//! cache hit.

use std::fmt;
use std::sync::Arc;

use super::dep;
use super::refs::Ref;
use super::target::TargetId;
use super::value::Value;
use super::watcher::Watcher;

type SetFn = Box<dyn Fn(Value) + Send + Sync>;

struct ComputedInner {
    id: TargetId,
    watcher: Watcher,
    setter: Option<SetFn>,
}

impl Drop for ComputedInner {
    fn drop(&mut self) {
        dep::forget_target(self.id);
    }
}

/// A cached, lazily-recomputed derived value.
///
/// Cloning shares the computation; equality follows identity.
pub struct Computed {
    inner: Arc<ComputedInner>,
}

impl Computed {
    /// Create a read-only computed from a getter. The getter runs lazily,
    /// on first read.
    pub fn new<G>(getter: G) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ComputedInner {
                id: TargetId::new(),
                watcher: Watcher::new_lazy(getter),
                setter: None,
            }),
        }
    }

    /// Create a writable computed: reads go through the getter cache,
    /// writes invoke the setter.
    pub fn writable<G, S>(getter: G, setter: S) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
        S: Fn(Value) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ComputedInner {
                id: TargetId::new(),
                watcher: Watcher::new_lazy(getter),
                setter: Some(Box::new(setter)),
            }),
        }
    }

    /// The computed's identity in the dependency store.
    pub fn id(&self) -> TargetId {
        self.inner.id
    }

    /// Read the value: track this computed's own dep, re-evaluate if
    /// dirty, then re-expose the watcher's dependencies to the reader.
    pub fn get(&self) -> Value {
        dep::track_ref_value(self.inner.id);
        if self.inner.watcher.is_dirty() {
            self.inner.watcher.evaluate();
        }
        self.inner.watcher.depend();
        self.inner.watcher.value()
    }

    /// Write through the setter; without one this is a read-only violation
    /// reported as a diagnostic.
    pub fn set(&self, value: impl Into<Value>) {
        match &self.inner.setter {
            Some(setter) => setter(value.into()),
            None => tracing::warn!("write operation failed: computed value is readonly"),
        }
    }

    /// Read the cached value without tracking or re-evaluating.
    pub fn peek(&self) -> Value {
        self.inner.watcher.value()
    }

    /// Whether the computed has no setter.
    pub fn is_readonly(&self) -> bool {
        self.inner.setter.is_none()
    }

    /// The backing watcher, for scheduling integration and debug hooks.
    pub fn watcher(&self) -> &Watcher {
        &self.inner.watcher
    }

    /// View this computed as a ref, so it can be stored in containers and
    /// used anywhere a ref is expected.
    pub fn to_ref(&self) -> Ref {
        Ref::from_computed(self.clone())
    }
}

impl Clone for Computed {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for Computed {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Computed {}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id.raw())
            .field("dirty", &self.inner.watcher.is_dirty())
            .field("readonly", &self.is_readonly())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::proxy::reactive;
    use super::super::refs::Ref;
    use super::super::target::Obj;
    use super::super::watcher::Watcher;
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn computed_is_lazy_and_cached() {
        let evaluations = Arc::new(AtomicI32::new(0));
        let evaluations_clone = evaluations.clone();
        let computed = Computed::new(move || {
            evaluations_clone.fetch_add(1, Ordering::SeqCst);
            Value::Int(42)
        });
        assert_eq!(evaluations.load(Ordering::SeqCst), 0, "no eager evaluation");
        assert_eq!(computed.get(), Value::Int(42));
        assert_eq!(computed.get(), Value::Int(42));
        assert_eq!(computed.get(), Value::Int(42));
        assert_eq!(evaluations.load(Ordering::SeqCst), 1, "reads hit the cache");
    }

    #[test]
    fn computed_reevaluates_once_per_dependency_change() {
        let source = Ref::new(1);
        let evaluations = Arc::new(AtomicI32::new(0));
        let evaluations_clone = evaluations.clone();
        let source_clone = source.clone();
        let computed = Computed::new(move || {
            evaluations_clone.fetch_add(1, Ordering::SeqCst);
            Value::Int(source_clone.get().as_int().unwrap() * 2)
        });
        assert_eq!(computed.get(), Value::Int(2));
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        source.set(5);
        // Dirty but not yet re-evaluated.
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        assert_eq!(computed.get(), Value::Int(10));
        assert_eq!(computed.get(), Value::Int(10));
        assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn consumers_resubscribe_on_cache_hits() {
        let source = reactive(Obj::record_from([("a", 1)]));
        let source_clone = source.as_reactive().unwrap().clone();
        let computed = Computed::new(move || {
            Value::Int(source_clone.get("a").as_int().unwrap() * 2)
        });
        // Warm the cache outside any watcher.
        assert_eq!(computed.get(), Value::Int(2));

        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let computed_clone = computed.clone();
        let _watcher = Watcher::new(move || {
            // This read is a cache hit, but the watcher must still
            // subscribe to the computed's inputs.
            log_clone.lock().unwrap().push(computed_clone.get());
        });
        assert_eq!(*log.lock().unwrap(), vec![Value::Int(2)]);
        source.as_reactive().unwrap().set("a", 5);
        assert_eq!(*log.lock().unwrap(), vec![Value::Int(2), Value::Int(10)]);
    }

    #[test]
    fn readonly_computed_refuses_writes() {
        let computed = Computed::new(|| Value::Int(1));
        assert!(computed.is_readonly());
        computed.set(2);
        assert_eq!(computed.get(), Value::Int(1));
    }

    #[test]
    fn writable_computed_routes_through_the_setter() {
        let source = Ref::new(1);
        let getter_source = source.clone();
        let setter_source = source.clone();
        let computed = Computed::writable(
            move || getter_source.get(),
            move |value| setter_source.set(value),
        );
        assert!(!computed.is_readonly());
        computed.set(9);
        assert_eq!(source.peek(), Value::Int(9));
        assert_eq!(computed.get(), Value::Int(9));
    }

    #[test]
    fn computed_as_ref_unwraps_in_containers() {
        let computed = Computed::new(|| Value::Int(3));
        let record = reactive(Obj::record_from([(
            "derived",
            Value::Ref(computed.to_ref()),
        )]));
        assert_eq!(
            record.as_reactive().unwrap().get("derived"),
            Value::Int(3),
            "computed refs unwrap on record reads"
        );
    }
}
