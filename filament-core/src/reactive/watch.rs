//! Watching
//!
//! The declarative watching API: build one watcher whose getter is derived
//! from a source description, compare successive values, and invoke a
//! callback with `(new, old)` on real changes, or, for the effect form,
//! simply re-run a function when anything it read changes.
//!
//! # Sources
//!
//! A source is a ref, a computed, a reactive container (implying deep
//! traversal), a getter closure, or a list of sources. Shallow and
//! reactive sources force the callback on any trigger, because their
//! contents may have changed in ways the outer comparison cannot see.
//!
//! # Flush timing
//!
//! - `Sync`: the callback runs immediately on trigger.
//! - `Post`: queued, sorted after default-timing entries in the flush.
//! - `Pre` (default): queued, after offering the watcher to the host's
//!   pre-setup buffer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use super::computed::Computed;
use super::proxy::Reactive;
use super::refs::Ref;
use super::scheduler;
use super::target::{Obj, Storage, TargetKind};
use super::value::{value_changed, Value};
use super::watcher::Watcher;

/// When a triggered watcher's callback actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Queued; runs before post-flagged entries in the same flush.
    #[default]
    Pre,

    /// Queued; runs after default-timing entries in the same flush.
    Post,

    /// Runs immediately when triggered.
    Sync,
}

/// Options for [`watch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Invoke the callback once immediately with the initial value.
    pub immediate: bool,

    /// Deep-traverse the source so nested mutations trigger.
    pub deep: bool,

    /// Tear the watcher down after the first post-setup invocation.
    pub once: bool,

    /// Flush timing.
    pub flush: FlushMode,
}

/// A stop handle for a watcher created by the watch API.
///
/// Stopping runs the watcher's registered cleanups and unsubscribes it;
/// dropping the handle alone does not stop a scope-owned watcher.
pub struct WatchHandle {
    watcher: Watcher,
}

impl WatchHandle {
    /// Stop watching.
    pub fn stop(&self) {
        self.watcher.teardown();
    }

    /// The underlying watcher, for id/debug-hook access.
    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }
}

/// Cleanup registration handle passed to watch callbacks.
///
/// A registered cleanup runs immediately before the next invocation and on
/// final teardown.
pub struct OnCleanup {
    watcher: Watcher,
}

impl OnCleanup {
    /// Register a cleanup for the current invocation.
    pub fn register<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.watcher.on_cleanup(cleanup);
    }
}

/// What a watcher observes.
pub enum WatchSource {
    /// A ref; resolves to its value.
    Ref(Ref),

    /// A computed; resolves to its value.
    Computed(Computed),

    /// A reactive container; implies deep traversal.
    Reactive(Reactive),

    /// A getter closure.
    Getter(Arc<dyn Fn() -> Value + Send + Sync>),

    /// Several sources watched together; the callback receives lists of
    /// values.
    Many(Vec<WatchSource>),
}

impl WatchSource {
    /// Wrap a getter closure as a source.
    pub fn getter<F>(getter: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        WatchSource::Getter(Arc::new(getter))
    }

    /// Classify a dynamic value as a source. Values that cannot be watched
    /// degrade to a constant `Null` getter with a diagnostic.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Ref(cell) => WatchSource::Ref(cell.clone()),
            Value::Reactive(proxy) => WatchSource::Reactive(proxy.clone()),
            other => {
                tracing::warn!(
                    "invalid watch source: {}; a watch source can only be a getter function, \
                     a ref, a reactive object, or an array of these",
                    other.type_name()
                );
                WatchSource::Getter(Arc::new(|| Value::Null))
            }
        }
    }
}

impl From<Ref> for WatchSource {
    fn from(cell: Ref) -> Self {
        WatchSource::Ref(cell)
    }
}

impl From<&Ref> for WatchSource {
    fn from(cell: &Ref) -> Self {
        WatchSource::Ref(cell.clone())
    }
}

impl From<Computed> for WatchSource {
    fn from(computed: Computed) -> Self {
        WatchSource::Computed(computed)
    }
}

impl From<&Computed> for WatchSource {
    fn from(computed: &Computed) -> Self {
        WatchSource::Computed(computed.clone())
    }
}

impl From<Reactive> for WatchSource {
    fn from(proxy: Reactive) -> Self {
        WatchSource::Reactive(proxy)
    }
}

impl From<&Reactive> for WatchSource {
    fn from(proxy: &Reactive) -> Self {
        WatchSource::Reactive(proxy.clone())
    }
}

impl From<Vec<WatchSource>> for WatchSource {
    fn from(sources: Vec<WatchSource>) -> Self {
        WatchSource::Many(sources)
    }
}

/// Force a read of every nested value reachable from `value`, so the
/// active watcher depends on all of it. A per-traversal seen-set guards
/// against cycles; `mark_raw` values are skipped.
pub fn traverse(value: &Value) {
    let mut seen = HashSet::new();
    traverse_value(value, &mut seen);
}

fn traverse_value(value: &Value, seen: &mut HashSet<u64>) {
    match value {
        Value::Reactive(proxy) => {
            if proxy.target().is_skip() || !seen.insert(proxy.target().id().raw()) {
                return;
            }
            match proxy.kind() {
                TargetKind::Record => {
                    for name in proxy.keys() {
                        traverse_value(&proxy.get(name), seen);
                    }
                }
                TargetKind::List => {
                    let len = proxy.len();
                    for index in 0..len {
                        traverse_value(&proxy.get(index), seen);
                    }
                }
                TargetKind::Map | TargetKind::Set => {
                    for (key, entry) in proxy.entries() {
                        traverse_value(&key, seen);
                        traverse_value(&entry, seen);
                    }
                }
            }
        }
        Value::Ref(cell) => {
            if !seen.insert(cell.id().raw()) {
                return;
            }
            traverse_value(&cell.get(), seen);
        }
        Value::Obj(obj) => {
            // Raw containers are reachable only through raw storage, so
            // walk them structurally without tracking.
            if obj.is_skip() || !seen.insert(obj.id().raw()) {
                return;
            }
            match obj.snapshot() {
                Storage::Record(fields) => {
                    for nested in fields.values() {
                        traverse_value(nested, seen);
                    }
                }
                Storage::List(items) => {
                    for nested in &items {
                        traverse_value(nested, seen);
                    }
                }
                Storage::Map(entries) => {
                    for (key, nested) in &entries {
                        traverse_value(key.value(), seen);
                        traverse_value(nested, seen);
                    }
                }
                Storage::Set(items) => {
                    for item in &items {
                        traverse_value(item.value(), seen);
                    }
                }
            }
        }
        _ => {}
    }
}

/// The resolved getter for one source, plus the flags the compare logic
/// needs.
struct ResolvedSource {
    getter: Arc<dyn Fn() -> Value + Send + Sync>,
    force_trigger: bool,
    deep: bool,
    multi: bool,
}

fn resolve_source(source: WatchSource) -> ResolvedSource {
    match source {
        WatchSource::Ref(cell) => {
            let force_trigger = cell.is_shallow();
            ResolvedSource {
                getter: Arc::new(move || cell.get()),
                force_trigger,
                deep: false,
                multi: false,
            }
        }
        WatchSource::Computed(computed) => ResolvedSource {
            getter: Arc::new(move || computed.get()),
            force_trigger: false,
            deep: false,
            multi: false,
        },
        WatchSource::Reactive(proxy) => ResolvedSource {
            getter: Arc::new(move || Value::Reactive(proxy.clone())),
            force_trigger: true,
            deep: true,
            multi: false,
        },
        WatchSource::Getter(getter) => ResolvedSource {
            getter,
            force_trigger: false,
            deep: false,
            multi: false,
        },
        WatchSource::Many(sources) => {
            let force_trigger = sources.iter().any(|source| match source {
                WatchSource::Reactive(_) => true,
                WatchSource::Ref(cell) => cell.is_shallow(),
                _ => false,
            });
            let elements: Vec<Arc<dyn Fn() -> Value + Send + Sync>> = sources
                .into_iter()
                .map(|source| -> Arc<dyn Fn() -> Value + Send + Sync> {
                    match source {
                        WatchSource::Ref(cell) => Arc::new(move || cell.get()),
                        WatchSource::Computed(computed) => Arc::new(move || computed.get()),
                        WatchSource::Reactive(proxy) => Arc::new(move || {
                            let value = Value::Reactive(proxy.clone());
                            traverse(&value);
                            value
                        }),
                        WatchSource::Getter(getter) => getter,
                        WatchSource::Many(_) => {
                            tracing::warn!(
                                "invalid watch source: nested source lists are not supported"
                            );
                            Arc::new(|| Value::Null)
                        }
                    }
                })
                .collect();
            ResolvedSource {
                getter: Arc::new(move || {
                    Value::Obj(Obj::list_from(
                        elements.iter().map(|element| (**element)()),
                    ))
                }),
                force_trigger,
                deep: false,
                multi: true,
            }
        }
    }
}

fn list_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Obj(obj) => obj.read(|storage| match storage {
            Storage::List(items) => items.clone(),
            _ => Vec::new(),
        }),
        _ => Vec::new(),
    }
}

fn mode_scheduler(flush: FlushMode) -> Arc<dyn Fn(&Watcher) + Send + Sync> {
    match flush {
        FlushMode::Sync => Arc::new(|watcher: &Watcher| watcher.run()),
        FlushMode::Post => Arc::new(|watcher: &Watcher| scheduler::queue_watcher(watcher)),
        FlushMode::Pre => Arc::new(|watcher: &Watcher| scheduler::queue_pre_watcher(watcher)),
    }
}

/// Watch a source and invoke `callback(new, old, on_cleanup)` when its
/// resolved value changes.
///
/// For a list source the callback receives lists of values; on the first
/// invocation `old` is `Null` (or an empty list). Returns a stop handle.
pub fn watch<S, C>(source: S, callback: C, options: WatchOptions) -> WatchHandle
where
    S: Into<WatchSource>,
    C: Fn(Value, Value, &OnCleanup) + Send + Sync + 'static,
{
    let resolved = resolve_source(source.into());
    let deep = options.deep || resolved.deep;
    let force_trigger = resolved.force_trigger;
    let multi = resolved.multi;

    let base_getter = resolved.getter;
    let getter: Box<dyn Fn() -> Value + Send + Sync> = if deep {
        Box::new(move || {
            let value = (*base_getter)();
            traverse(&value);
            value
        })
    } else {
        Box::new(move || (*base_getter)())
    };

    let watcher = Watcher::new_deferred(getter);
    if options.flush == FlushMode::Post {
        watcher.set_post(true);
    }

    let old_value: Arc<RwLock<Option<Value>>> = Arc::new(RwLock::new(None));
    let callback = Arc::new(callback);
    let runner_old = old_value.clone();
    let mut runner: Arc<dyn Fn(&Watcher) + Send + Sync> = Arc::new(move |watcher: &Watcher| {
        if !watcher.is_active() {
            return;
        }
        let new_value = watcher.get();
        let changed = {
            let old = runner_old.read().expect("watch old-value lock poisoned");
            match &*old {
                None => true,
                Some(old) => {
                    if multi {
                        let new_items = list_items(&new_value);
                        let old_items = list_items(old);
                        deep || force_trigger
                            || new_items.len() != old_items.len()
                            || new_items
                                .iter()
                                .zip(&old_items)
                                .any(|(new_item, old_item)| value_changed(new_item, old_item))
                    } else {
                        deep || force_trigger || value_changed(&new_value, old)
                    }
                }
            }
        };
        if changed {
            watcher.run_cleanups();
            let previous = runner_old
                .read()
                .expect("watch old-value lock poisoned")
                .clone();
            let old_for_callback = match previous {
                Some(value) => value,
                None if multi => Value::Obj(Obj::list()),
                None => Value::Null,
            };
            (*callback)(
                new_value.clone(),
                old_for_callback,
                &OnCleanup {
                    watcher: watcher.clone(),
                },
            );
            *runner_old.write().expect("watch old-value lock poisoned") = Some(new_value);
        }
    });

    let mut schedule = mode_scheduler(options.flush);
    if options.once {
        // The first post-setup trigger also tears the watcher down, after
        // its callback has run.
        let armed = Arc::new(AtomicBool::new(false));
        let runner_armed = armed.clone();
        let inner_runner = runner.clone();
        runner = Arc::new(move |watcher: &Watcher| {
            (*inner_runner)(watcher);
            if runner_armed.swap(false, Ordering::SeqCst) {
                watcher.teardown();
            }
        });
        let inner_schedule = schedule.clone();
        schedule = Arc::new(move |watcher: &Watcher| {
            armed.store(true, Ordering::SeqCst);
            (*inner_schedule)(watcher);
        });
    }

    watcher.set_runner(runner);
    watcher.set_scheduler(schedule);

    if options.immediate {
        watcher.run();
    } else {
        let initial = watcher.get();
        *old_value.write().expect("watch old-value lock poisoned") = Some(initial);
    }

    WatchHandle { watcher }
}

fn watch_effect_inner<F>(effect: F, flush: FlushMode) -> WatchHandle
where
    F: Fn(&OnCleanup) + Send + Sync + 'static,
{
    // The getter needs the watcher for cleanup registration, but the
    // watcher is built around the getter; a slot breaks the cycle.
    let slot: Arc<OnceLock<Watcher>> = Arc::new(OnceLock::new());
    let getter_slot = slot.clone();
    let watcher = Watcher::new_deferred(move || {
        let watcher = getter_slot
            .get()
            .expect("watch effect evaluated before its watcher was installed");
        watcher.run_cleanups();
        effect(&OnCleanup {
            watcher: watcher.clone(),
        });
        Value::Null
    });
    slot.set(watcher.clone())
        .ok()
        .expect("watch effect slot installed twice");
    watcher.set_no_recurse(true);
    if flush == FlushMode::Post {
        watcher.set_post(true);
    }
    watcher.set_scheduler(mode_scheduler(flush));
    watcher.get();
    WatchHandle { watcher }
}

/// Run `effect` immediately and re-run it whenever anything it read
/// changes, with default (pre) flush timing.
pub fn watch_effect<F>(effect: F) -> WatchHandle
where
    F: Fn(&OnCleanup) + Send + Sync + 'static,
{
    watch_effect_inner(effect, FlushMode::Pre)
}

/// [`watch_effect`] with post flush timing.
pub fn watch_post_effect<F>(effect: F) -> WatchHandle
where
    F: Fn(&OnCleanup) + Send + Sync + 'static,
{
    watch_effect_inner(effect, FlushMode::Post)
}

/// [`watch_effect`] with synchronous flush timing.
pub fn watch_sync_effect<F>(effect: F) -> WatchHandle
where
    F: Fn(&OnCleanup) + Send + Sync + 'static,
{
    watch_effect_inner(effect, FlushMode::Sync)
}

#[cfg(test)]
mod tests {
    use super::super::proxy::reactive;
    use super::super::refs::Ref;
    use super::super::target::Obj;
    use super::*;
    use std::sync::Mutex;

    fn logged() -> (Arc<Mutex<Vec<(Value, Value)>>>, impl Fn(Value, Value, &OnCleanup) + Send + Sync)
    {
        let log: Arc<Mutex<Vec<(Value, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        (log, move |new_value, old_value, _cleanup: &OnCleanup| {
            log_clone.lock().unwrap().push((new_value, old_value));
        })
    }

    #[test]
    fn watch_ref_receives_new_and_old() {
        let cell = Ref::new(1);
        let (log, callback) = logged();
        let handle = watch(
            &cell,
            callback,
            WatchOptions {
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        assert!(log.lock().unwrap().is_empty(), "no immediate invocation");
        cell.set(2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(Value::Int(2), Value::Int(1))]
        );
        // An unchanged write does not invoke the callback.
        cell.set(2);
        assert_eq!(log.lock().unwrap().len(), 1);
        handle.stop();
        cell.set(3);
        assert_eq!(log.lock().unwrap().len(), 1, "stopped watcher stays quiet");
    }

    #[test]
    fn watch_immediate_fires_with_null_old() {
        let cell = Ref::new(5);
        let (log, callback) = logged();
        watch(
            &cell,
            callback,
            WatchOptions {
                immediate: true,
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        assert_eq!(*log.lock().unwrap(), vec![(Value::Int(5), Value::Null)]);
    }

    #[test]
    fn watch_multiple_sources_reports_per_slot_values() {
        let a = Ref::new(1);
        let b = Ref::new(10);
        let (log, callback) = logged();
        let _handle = watch(
            vec![WatchSource::from(&a), WatchSource::from(&b)],
            callback,
            WatchOptions {
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        a.set(9);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (new_value, old_value) = &log[0];
        assert_eq!(list_items(new_value), vec![Value::Int(9), Value::Int(10)]);
        assert_eq!(list_items(old_value), vec![Value::Int(1), Value::Int(10)]);
    }

    #[test]
    fn watch_deep_sees_nested_mutations() {
        let record = reactive(Obj::record_from([("nested", Obj::record_from([("x", 1)]))]));
        let proxy = record.as_reactive().unwrap().clone();
        let (log, callback) = logged();
        let _handle = watch(
            &proxy,
            callback,
            WatchOptions {
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        let nested = proxy.get("nested");
        nested.as_reactive().unwrap().set("x", 2);
        assert_eq!(log.lock().unwrap().len(), 1, "nested write must fire");
    }

    #[test]
    fn watch_once_fires_exactly_once() {
        let cell = Ref::new(1);
        let (log, callback) = logged();
        let handle = watch(
            &cell,
            callback,
            WatchOptions {
                once: true,
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        cell.set(2);
        cell.set(3);
        cell.set(4);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(!handle.watcher().is_active());
    }

    #[test]
    fn cleanups_run_before_next_invocation_and_on_stop() {
        let cell = Ref::new(1);
        let cleanups = Arc::new(Mutex::new(0));
        let cleanups_clone = cleanups.clone();
        let handle = watch(
            &cell,
            move |_new, _old, on_cleanup: &OnCleanup| {
                let cleanups = cleanups_clone.clone();
                on_cleanup.register(move || {
                    *cleanups.lock().unwrap() += 1;
                });
            },
            WatchOptions {
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        cell.set(2);
        assert_eq!(*cleanups.lock().unwrap(), 0, "first run registers only");
        cell.set(3);
        assert_eq!(*cleanups.lock().unwrap(), 1, "cleanup precedes second run");
        handle.stop();
        assert_eq!(*cleanups.lock().unwrap(), 2, "teardown runs the last cleanup");
    }

    #[test]
    fn watch_effect_tracks_and_reruns() {
        let record = reactive(Obj::record_from([("count", 0)]));
        let proxy = record.as_reactive().unwrap().clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let handle = watch_sync_effect(move |_cleanup| {
            log_clone.lock().unwrap().push(proxy.get("count"));
        });
        assert_eq!(*log.lock().unwrap(), vec![Value::Int(0)]);
        record.as_reactive().unwrap().set("count", 1);
        assert_eq!(*log.lock().unwrap(), vec![Value::Int(0), Value::Int(1)]);
        handle.stop();
        record.as_reactive().unwrap().set("count", 2);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn invalid_sources_degrade_to_null() {
        let (log, callback) = logged();
        watch(
            WatchSource::from_value(&Value::Int(3)),
            callback,
            WatchOptions {
                immediate: true,
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        assert_eq!(*log.lock().unwrap(), vec![(Value::Null, Value::Null)]);
    }
}
