//! Dependency Store
//!
//! The bipartite graph linking observed state to the computations that read
//! it. Each target owns one `Dep` (subscriber set) per key it has ever been
//! tracked under; the store is a process-wide table keyed by target
//! identity, so targets themselves carry no visible engine fields.
//!
//! # Tracking
//!
//! `track` is a no-op unless a watcher is currently running and tracking is
//! not paused. Re-tracking the same dep within one run is a set-semantics
//! no-op (the watcher dedupes by dep id).
//!
//! # Triggering
//!
//! `trigger` decides which deps a mutation must notify. Notification never
//! runs subscribers inline: each dep's notify call is pushed into a pending
//! batch that drains when the outermost `pause_scheduling` bracket closes.
//! This is what makes compound mutations (a list splice touching many
//! indices) atomic from the subscribers' point of view.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use dashmap::DashMap;

use super::debug::DebuggerEvent;
use super::key::Key;
use super::ops::{TrackOp, TriggerOp};
use super::scheduler;
use super::target::TargetId;
use super::value::Value;
use super::watcher::{self, Watcher, WeakWatcher};

/// A named subscriber set for one target key.
pub struct Dep {
    inner: Arc<DepInner>,
}

struct DepInner {
    id: u64,
    subs: RwLock<Vec<WeakWatcher>>,
}

impl Dep {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            inner: Arc::new(DepInner {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                subs: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Get the dep's unique id, used for set-semantics bookkeeping.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of live subscribers. Dead weak entries are not counted.
    pub fn sub_count(&self) -> usize {
        self.inner
            .subs
            .read()
            .expect("dep subscriber lock poisoned")
            .iter()
            .filter(|sub| sub.is_alive())
            .count()
    }

    pub(crate) fn add_sub(&self, watcher: &Watcher) {
        self.inner
            .subs
            .write()
            .expect("dep subscriber lock poisoned")
            .push(watcher.downgrade());
    }

    pub(crate) fn remove_sub(&self, watcher_id: u64) {
        self.inner
            .subs
            .write()
            .expect("dep subscriber lock poisoned")
            .retain(|sub| sub.id() != watcher_id);
    }

    /// Record the currently-running watcher as a subscriber.
    pub fn depend(&self, event: Option<DebuggerEvent>) {
        if let Some(active) = watcher::active_watcher() {
            active.add_dep(self);
            if cfg!(debug_assertions) {
                if let Some(event) = event {
                    active.fire_on_track(&event);
                }
            }
        }
    }

    /// Notify every live subscriber, pruning dead ones.
    pub(crate) fn notify(&self, event: Option<DebuggerEvent>) {
        let subs: Vec<Watcher> = {
            let mut subs = self.inner.subs.write().expect("dep subscriber lock poisoned");
            subs.retain(|sub| sub.is_alive());
            subs.iter().filter_map(|sub| sub.upgrade()).collect()
        };
        for sub in subs {
            if cfg!(debug_assertions) {
                if let Some(event) = &event {
                    sub.fire_on_trigger(event);
                }
            }
            sub.update();
        }
    }
}

impl Clone for Dep {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Dep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dep")
            .field("id", &self.inner.id)
            .field("subs", &self.sub_count())
            .finish()
    }
}

// Process-wide dep table, keyed by target identity. Entries are removed when
// the target is dropped.
static DEPS: OnceLock<DashMap<TargetId, HashMap<Key, Dep>>> = OnceLock::new();

fn store() -> &'static DashMap<TargetId, HashMap<Key, Dep>> {
    DEPS.get_or_init(DashMap::new)
}

thread_local! {
    static SHOULD_TRACK: Cell<bool> = const { Cell::new(true) };
    static TRACK_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    static SCHEDULE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static DRAIN_DEPTH: Cell<usize> = const { Cell::new(0) };
    static PENDING: RefCell<VecDeque<Box<dyn FnOnce()>>> = const { RefCell::new(VecDeque::new()) };
}

/// Whether dependency collection is currently enabled on this thread.
pub fn tracking_enabled() -> bool {
    SHOULD_TRACK.with(|flag| flag.get())
}

/// Suspend dependency collection. Reentrant; pair with [`reset_tracking`].
pub fn pause_tracking() {
    TRACK_STACK.with(|stack| stack.borrow_mut().push(SHOULD_TRACK.with(|flag| flag.get())));
    SHOULD_TRACK.with(|flag| flag.set(false));
}

/// Restore dependency collection to its state before the matching
/// [`pause_tracking`].
pub fn reset_tracking() {
    let last = TRACK_STACK.with(|stack| stack.borrow_mut().pop());
    SHOULD_TRACK.with(|flag| flag.set(last.unwrap_or(true)));
}

/// Suspend subscriber notification. Reentrant; pair with
/// [`reset_scheduling`].
pub fn pause_scheduling() {
    SCHEDULE_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

/// Close one notification bracket. When the outermost bracket closes, the
/// pending notifications drain in enqueue order and any deferred flush is
/// kicked.
pub fn reset_scheduling() {
    let depth = SCHEDULE_DEPTH.with(|depth| depth.get());
    if depth == 0 {
        tracing::warn!("reset_scheduling() called without a matching pause_scheduling()");
        return;
    }
    SCHEDULE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    DRAIN_DEPTH.with(|depth| depth.set(depth.get() + 1));
    loop {
        if SCHEDULE_DEPTH.with(|depth| depth.get()) != 0 {
            break;
        }
        let next = PENDING.with(|pending| pending.borrow_mut().pop_front());
        match next {
            Some(notify) => notify(),
            None => break,
        }
    }
    DRAIN_DEPTH.with(|depth| depth.set(depth.get() - 1));
    if SCHEDULE_DEPTH.with(|depth| depth.get()) == 0 && DRAIN_DEPTH.with(|depth| depth.get()) == 0 {
        scheduler::flush_deferred();
    }
}

/// Whether notification delivery is suspended or mid-drain on this thread.
/// A hookless flush must wait for the whole burst to finish.
pub(crate) fn scheduling_paused() -> bool {
    SCHEDULE_DEPTH.with(|depth| depth.get()) > 0 || DRAIN_DEPTH.with(|depth| depth.get()) > 0
}

/// Record that the currently-running watcher depends on `(target, key)`.
///
/// No-op when no watcher is running or tracking is paused.
pub fn track(target: TargetId, op: TrackOp, key: Key) {
    if !tracking_enabled() || watcher::active_watcher().is_none() {
        return;
    }
    let dep = {
        let mut entry = store().entry(target).or_default();
        entry.entry(key.clone()).or_insert_with(Dep::new).clone()
    };
    let event = if cfg!(debug_assertions) {
        Some(DebuggerEvent::track(target, op, key))
    } else {
        None
    };
    dep.depend(event);
}

/// Notify the computations depending on `(target, key)` that it changed.
///
/// No-op when nothing ever tracked the target. Which deps are notified
/// depends on the mutation kind and the key shape:
///
/// - `Clear` notifies every dep of the target.
/// - A `Set` of the list length notifies every index dep at or beyond the
///   new length, plus the length dep itself.
/// - Otherwise the exact key's dep is notified, plus the iteration sentinels
///   for shape changes: `Add`/`Delete` of a field or entry notify the
///   iterate dep (entries also notify the key-iterate dep), a `Set` of an
///   entry notifies the iterate dep, and an `Add` at a list index notifies
///   the length dep instead.
pub fn trigger(
    target: TargetId,
    op: TriggerOp,
    key: Option<Key>,
    new_value: Option<Value>,
    old_value: Option<Value>,
) {
    let to_notify: Vec<Dep> = {
        let Some(entry) = store().get(&target) else {
            return;
        };
        let deps = entry.value();
        let mut to_notify = Vec::new();
        fn push(to_notify: &mut Vec<Dep>, dep: Option<&Dep>) {
            if let Some(dep) = dep {
                to_notify.push(dep.clone());
            }
        }
        match (&op, &key) {
            (TriggerOp::Clear, _) => {
                for dep in deps.values() {
                    to_notify.push(dep.clone());
                }
            }
            (TriggerOp::Set, Some(Key::Length)) => {
                let new_len = new_value
                    .as_ref()
                    .and_then(|value| value.as_float().ok())
                    .unwrap_or(0.0);
                for (dep_key, dep) in deps {
                    match dep_key {
                        Key::Length => to_notify.push(dep.clone()),
                        Key::Index(index) => {
                            if *index as f64 >= new_len {
                                to_notify.push(dep.clone());
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {
                if let Some(key) = &key {
                    push(&mut to_notify, deps.get(key));
                }
                match (&op, &key) {
                    (TriggerOp::Set, Some(Key::Entry(_))) => {
                        push(&mut to_notify, deps.get(&Key::Iterate));
                    }
                    (TriggerOp::Add | TriggerOp::Delete, Some(Key::Entry(_))) => {
                        push(&mut to_notify, deps.get(&Key::Iterate));
                        push(&mut to_notify, deps.get(&Key::MapKeyIterate));
                    }
                    (TriggerOp::Add | TriggerOp::Delete, Some(Key::Field(_))) => {
                        push(&mut to_notify, deps.get(&Key::Iterate));
                    }
                    (TriggerOp::Add, Some(Key::Index(_))) => {
                        push(&mut to_notify, deps.get(&Key::Length));
                    }
                    _ => {}
                }
            }
        }
        to_notify
    };
    if to_notify.is_empty() {
        return;
    }
    pause_scheduling();
    for dep in to_notify {
        let event = if cfg!(debug_assertions) {
            Some(DebuggerEvent::trigger(
                target,
                op,
                key.clone(),
                new_value.clone(),
                old_value.clone(),
            ))
        } else {
            None
        };
        PENDING.with(|pending| {
            pending
                .borrow_mut()
                .push_back(Box::new(move || dep.notify(event)));
        });
    }
    reset_scheduling();
}

/// Track the fixed value slot of a ref-like target.
pub fn track_ref_value(target: TargetId) {
    track(target, TrackOp::Get, Key::RefValue);
}

/// Trigger the fixed value slot of a ref-like target.
pub fn trigger_ref_value(target: TargetId, new_value: Option<Value>, old_value: Option<Value>) {
    trigger(target, TriggerOp::Set, Some(Key::RefValue), new_value, old_value);
}

/// Look up an existing dep without creating one.
pub(crate) fn existing_dep(target: TargetId, key: &Key) -> Option<Dep> {
    store().get(&target).and_then(|deps| deps.get(key).cloned())
}

/// Drop all bookkeeping for a target. Called when the target is dropped.
pub(crate) fn forget_target(target: TargetId) {
    store().remove(&target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::atomic::Ordering as AtomicOrdering;

    #[test]
    fn track_outside_watcher_is_a_no_op() {
        let target = TargetId::new();
        track(target, TrackOp::Get, Key::field("a"));
        assert!(existing_dep(target, &Key::field("a")).is_none());
    }

    #[test]
    fn trigger_without_tracking_is_a_no_op() {
        // Nothing tracked this target; trigger must not panic or allocate.
        trigger(TargetId::new(), TriggerOp::Set, Some(Key::field("a")), None, None);
    }

    #[test]
    fn pause_tracking_is_reentrant() {
        assert!(tracking_enabled());
        pause_tracking();
        assert!(!tracking_enabled());
        pause_tracking();
        assert!(!tracking_enabled());
        reset_tracking();
        assert!(!tracking_enabled());
        reset_tracking();
        assert!(tracking_enabled());
    }

    #[test]
    fn scheduling_bracket_batches_notifications() {
        let target = TargetId::new();
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let _watcher = Watcher::new(move || {
            track(target, TrackOp::Get, Key::field("a"));
            runs_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 1);

        // A trigger inside a paused bracket must not notify until the
        // outermost bracket closes.
        pause_scheduling();
        trigger(target, TriggerOp::Set, Some(Key::field("a")), None, None);
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 1, "notified while paused");
        reset_scheduling();
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 2);
    }
}
