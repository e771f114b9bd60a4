//! Watchers
//!
//! A `Watcher` is the unit of reactive computation: it runs a function,
//! records every dependency the function reads, and re-runs (or defers to a
//! scheduler) when any of them change.
//!
//! # How Watchers Work
//!
//! 1. Running a watcher pushes it onto a thread-local active stack, so that
//!    every `track` call during the run attributes to it. Nested watchers
//!    run to completion before the outer one resumes, and the stack is
//!    restored even if the inner run panics.
//!
//! 2. Dependencies are double-buffered: each run collects into a fresh set,
//!    and deps that were not re-read are unsubscribed afterwards, so deps
//!    never accumulate stale subscribers.
//!
//! 3. When a subscribed dep triggers, the watcher's `update` action runs:
//!    lazy watchers just mark themselves dirty, schedulered watchers defer,
//!    and plain watchers re-run synchronously.
//!
//! 4. Teardown unsubscribes from every dep and runs registered cleanup
//!    callbacks. A torn-down watcher never runs again; the state is
//!    irreversible.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use smallvec::SmallVec;

use super::debug::{DebugHook, DebuggerEvent};
use super::dep::Dep;
use super::scope;
use super::value::Value;

/// Counter for monotonic watcher ids. Creation order is what the flush
/// queue sorts by, so parents (created earlier) run before children.
static WATCHER_ID: AtomicU64 = AtomicU64::new(0);

type Getter = Box<dyn Fn() -> Value + Send + Sync>;
type Action = Arc<dyn Fn(&Watcher) + Send + Sync>;
type CleanupFn = Box<dyn FnOnce() + Send>;

/// Double-buffered dependency bookkeeping.
#[derive(Default)]
struct DepBook {
    deps: SmallVec<[Dep; 4]>,
    dep_ids: HashSet<u64>,
    new_deps: SmallVec<[Dep; 4]>,
    new_dep_ids: HashSet<u64>,
}

struct WatcherInner {
    id: u64,
    active: AtomicBool,

    /// Lazy watchers (computed) mark dirty on trigger instead of running.
    lazy: bool,
    dirty: AtomicBool,

    /// Post-flush entries sort after default entries in the flush queue.
    post: AtomicBool,

    /// Skip re-queueing when this watcher triggers itself during its own
    /// run (effect-style watchers without a comparing callback).
    no_recurse: AtomicBool,

    getter: Getter,

    /// Overrides what `run` does (watch callbacks install their
    /// compare-and-invoke logic here).
    runner: RwLock<Option<Action>>,

    /// Overrides what `update` does on trigger (queueing, sync, buffering).
    scheduler: RwLock<Option<Action>>,

    value: RwLock<Value>,
    book: RwLock<DepBook>,
    cleanups: Mutex<Vec<CleanupFn>>,
    run_count: AtomicUsize,

    on_track: RwLock<Option<DebugHook>>,
    on_trigger: RwLock<Option<DebugHook>>,
}

/// A reactive computation.
///
/// Cloning shares the computation; equality follows identity.
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

/// A non-owning handle used by deps to reference their subscribers.
pub(crate) struct WeakWatcher {
    id: u64,
    inner: Weak<WatcherInner>,
}

impl WeakWatcher {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<Watcher> {
        self.inner.upgrade().map(|inner| Watcher { inner })
    }
}

thread_local! {
    /// The active watcher stack for this thread.
    static ACTIVE: RefCell<Vec<Watcher>> = const { RefCell::new(Vec::new()) };
}

/// Guard that keeps the active stack balanced even when a run panics, and
/// performs the dependency swap afterwards.
struct RunGuard {
    watcher: Watcher,
}

impl RunGuard {
    fn enter(watcher: Watcher) -> Self {
        ACTIVE.with(|stack| stack.borrow_mut().push(watcher.clone()));
        Self { watcher }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
        self.watcher.cleanup_deps();
    }
}

impl Watcher {
    fn build(getter: Getter, lazy: bool) -> Self {
        let watcher = Self {
            inner: Arc::new(WatcherInner {
                id: WATCHER_ID.fetch_add(1, Ordering::Relaxed),
                active: AtomicBool::new(true),
                lazy,
                dirty: AtomicBool::new(lazy),
                post: AtomicBool::new(false),
                no_recurse: AtomicBool::new(false),
                getter,
                runner: RwLock::new(None),
                scheduler: RwLock::new(None),
                value: RwLock::new(Value::Null),
                book: RwLock::new(DepBook::default()),
                cleanups: Mutex::new(Vec::new()),
                run_count: AtomicUsize::new(0),
                on_track: RwLock::new(None),
                on_trigger: RwLock::new(None),
            }),
        };
        scope::register_watcher(&watcher);
        watcher
    }

    /// Create a watcher that runs immediately to collect dependencies and
    /// re-runs synchronously whenever any of them change.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let watcher = Self::build(
            Box::new(move || {
                run();
                Value::Null
            }),
            false,
        );
        watcher.run();
        watcher
    }

    /// Create a watcher whose trigger action is the given scheduler instead
    /// of an immediate re-run. Runs once to collect dependencies.
    pub fn with_scheduler<F, S>(run: F, scheduler: S) -> Self
    where
        F: Fn() + Send + Sync + 'static,
        S: Fn(&Watcher) + Send + Sync + 'static,
    {
        let watcher = Self::build(
            Box::new(move || {
                run();
                Value::Null
            }),
            false,
        );
        watcher.set_scheduler(Arc::new(scheduler));
        watcher.run();
        watcher
    }

    /// Create a lazy watcher. It does not run at creation; the first
    /// evaluation happens on demand.
    pub(crate) fn new_lazy<F>(getter: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::build(Box::new(getter), true)
    }

    /// Create an inert-until-scheduled watcher with a value getter, used by
    /// the watch layer. Not run at creation.
    pub(crate) fn new_deferred<F>(getter: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::build(Box::new(getter), false)
    }

    /// Get the watcher's unique, monotonically-assigned id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the watcher has not been torn down.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Number of times the watcher has evaluated.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// The value produced by the most recent evaluation.
    pub fn value(&self) -> Value {
        self.inner.value.read().expect("watcher value lock poisoned").clone()
    }

    pub(crate) fn downgrade(&self) -> WeakWatcher {
        WeakWatcher {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Evaluate the getter with this watcher as the active computation.
    ///
    /// Every reactive read during the call subscribes this watcher; deps
    /// that were subscribed before but not re-read are dropped afterwards.
    pub fn get(&self) -> Value {
        let _guard = RunGuard::enter(self.clone());
        let value = (self.inner.getter)();
        *self.inner.value.write().expect("watcher value lock poisoned") = value.clone();
        self.inner.run_count.fetch_add(1, Ordering::SeqCst);
        value
    }

    /// Run the watcher: the installed runner if any, otherwise drain
    /// cleanups and re-evaluate.
    pub fn run(&self) {
        if !self.is_active() {
            return;
        }
        let runner = self
            .inner
            .runner
            .read()
            .expect("watcher runner lock poisoned")
            .clone();
        match runner {
            Some(runner) => (*runner)(self),
            None => {
                self.run_cleanups();
                self.get();
            }
        }
    }

    /// The trigger action: lazy watchers go dirty, schedulered watchers
    /// defer, plain watchers re-run synchronously.
    pub fn update(&self) {
        if self.inner.lazy {
            self.inner.dirty.store(true, Ordering::SeqCst);
            return;
        }
        if !self.is_active() {
            return;
        }
        let scheduler = self
            .inner
            .scheduler
            .read()
            .expect("watcher scheduler lock poisoned")
            .clone();
        match scheduler {
            Some(scheduler) => (*scheduler)(self),
            None => self.run(),
        }
    }

    /// Re-expose every dep of this watcher to the currently-running one.
    ///
    /// This is what lets a consumer of a cached value re-subscribe to the
    /// value's own inputs even on a cache hit.
    pub fn depend(&self) {
        let deps: Vec<Dep> = {
            let book = self.inner.book.read().expect("watcher dep lock poisoned");
            book.deps.iter().cloned().collect()
        };
        for dep in deps {
            dep.depend(None);
        }
    }

    /// Evaluate and mark fresh. Used by lazy (computed) watchers.
    pub(crate) fn evaluate(&self) {
        self.get();
        self.inner.dirty.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Subscribe this watcher to a dep, once per run.
    pub(crate) fn add_dep(&self, dep: &Dep) {
        let mut book = self.inner.book.write().expect("watcher dep lock poisoned");
        if book.new_dep_ids.insert(dep.id()) {
            book.new_deps.push(dep.clone());
            if !book.dep_ids.contains(&dep.id()) {
                dep.add_sub(self);
            }
        }
    }

    /// Swap the dependency buffers, unsubscribing from deps that this run
    /// did not touch.
    fn cleanup_deps(&self) {
        let mut book = self.inner.book.write().expect("watcher dep lock poisoned");
        let book = &mut *book;
        for dep in &book.deps {
            if !book.new_dep_ids.contains(&dep.id()) {
                dep.remove_sub(self.inner.id);
            }
        }
        std::mem::swap(&mut book.deps, &mut book.new_deps);
        std::mem::swap(&mut book.dep_ids, &mut book.new_dep_ids);
        book.new_deps.clear();
        book.new_dep_ids.clear();
    }

    /// Register a cleanup callback, invoked before the next run and at
    /// teardown.
    pub fn on_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .cleanups
            .lock()
            .expect("watcher cleanup lock poisoned")
            .push(Box::new(cleanup));
    }

    /// Drain and invoke the registered cleanups, in registration order.
    pub(crate) fn run_cleanups(&self) {
        let cleanups: Vec<CleanupFn> = {
            let mut cleanups = self
                .inner
                .cleanups
                .lock()
                .expect("watcher cleanup lock poisoned");
            cleanups.drain(..).collect()
        };
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Tear the watcher down: unsubscribe from every dep and run cleanups.
    ///
    /// Idempotent; a torn-down watcher never runs again.
    pub fn teardown(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let deps: Vec<Dep> = {
            let mut book = self.inner.book.write().expect("watcher dep lock poisoned");
            book.dep_ids.clear();
            book.new_deps.clear();
            book.new_dep_ids.clear();
            book.deps.drain(..).collect()
        };
        for dep in deps {
            dep.remove_sub(self.inner.id);
        }
        self.run_cleanups();
    }

    /// Number of deps currently subscribed to.
    pub fn dep_count(&self) -> usize {
        self.inner
            .book
            .read()
            .expect("watcher dep lock poisoned")
            .deps
            .len()
    }

    pub(crate) fn set_runner(&self, runner: Action) {
        *self.inner.runner.write().expect("watcher runner lock poisoned") = Some(runner);
    }

    pub(crate) fn set_scheduler(&self, scheduler: Action) {
        *self
            .inner
            .scheduler
            .write()
            .expect("watcher scheduler lock poisoned") = Some(scheduler);
    }

    pub(crate) fn set_post(&self, post: bool) {
        self.inner.post.store(post, Ordering::SeqCst);
    }

    pub(crate) fn is_post(&self) -> bool {
        self.inner.post.load(Ordering::SeqCst)
    }

    pub(crate) fn set_no_recurse(&self, no_recurse: bool) {
        self.inner.no_recurse.store(no_recurse, Ordering::SeqCst);
    }

    pub(crate) fn no_recurse(&self) -> bool {
        self.inner.no_recurse.load(Ordering::SeqCst)
    }

    /// Install a hook observing dependency collection (debug builds only).
    pub fn set_on_track(&self, hook: DebugHook) {
        *self.inner.on_track.write().expect("watcher hook lock poisoned") = Some(hook);
    }

    /// Install a hook observing trigger delivery (debug builds only).
    pub fn set_on_trigger(&self, hook: DebugHook) {
        *self.inner.on_trigger.write().expect("watcher hook lock poisoned") = Some(hook);
    }

    pub(crate) fn fire_on_track(&self, event: &DebuggerEvent) {
        let hook = self
            .inner
            .on_track
            .read()
            .expect("watcher hook lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    pub(crate) fn fire_on_trigger(&self, event: &DebuggerEvent) {
        let hook = self
            .inner
            .on_trigger
            .read()
            .expect("watcher hook lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for Watcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Watcher {}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.inner.id)
            .field("active", &self.is_active())
            .field("run_count", &self.run_count())
            .field("dep_count", &self.dep_count())
            .finish()
    }
}

/// The watcher currently collecting dependencies on this thread, if any.
pub fn active_watcher() -> Option<Watcher> {
    ACTIVE.with(|stack| stack.borrow().last().cloned())
}

/// Public alias for [`active_watcher`], matching the watch-layer surface.
pub fn get_current_watcher() -> Option<Watcher> {
    active_watcher()
}

/// Register a cleanup on the currently-running watcher.
///
/// The cleanup runs right before the watcher's next run and at teardown.
/// Outside a watcher this reports a diagnostic (unless `fail_silently`) and
/// does nothing.
pub fn on_watcher_cleanup<F>(cleanup: F, fail_silently: bool)
where
    F: FnOnce() + Send + 'static,
{
    match active_watcher() {
        Some(watcher) => watcher.on_cleanup(cleanup),
        None => {
            if !fail_silently {
                tracing::warn!(
                    "on_watcher_cleanup() was called when there was no active watcher to associate with"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn watcher_runs_on_creation() {
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let watcher = Watcher::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.run_count(), 1);
    }

    #[test]
    fn lazy_watcher_does_not_run_on_creation() {
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let watcher = Watcher::new_lazy(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Value::Null
        });
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(watcher.is_dirty());
        watcher.evaluate();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!watcher.is_dirty());
    }

    #[test]
    fn active_stack_nests_and_restores() {
        let outer_seen = Arc::new(Mutex::new(None));
        let inner_seen = Arc::new(Mutex::new(None));
        let outer_clone = outer_seen.clone();
        let inner_clone = inner_seen.clone();
        let outer = Watcher::new(move || {
            *outer_clone.lock().unwrap() = active_watcher();
            let inner_clone = inner_clone.clone();
            let _inner = Watcher::new(move || {
                *inner_clone.lock().unwrap() = active_watcher();
            });
            // After the nested watcher completes, the outer one is active
            // again.
            assert_eq!(
                active_watcher().expect("outer watcher restored").id(),
                outer_clone.lock().unwrap().as_ref().unwrap().id()
            );
        });
        assert_eq!(outer_seen.lock().unwrap().as_ref().unwrap(), &outer);
        assert!(inner_seen.lock().unwrap().is_some());
        assert!(active_watcher().is_none());
    }

    #[test]
    fn teardown_is_irreversible() {
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let watcher = Watcher::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        watcher.teardown();
        assert!(!watcher.is_active());
        watcher.run();
        watcher.update();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanups_run_before_rerun_and_at_teardown() {
        let cleaned = Arc::new(AtomicI32::new(0));
        let watcher = Watcher::new(|| {});
        let cleaned_clone = cleaned.clone();
        watcher.on_cleanup(move || {
            cleaned_clone.fetch_add(1, Ordering::SeqCst);
        });
        watcher.run();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        let cleaned_clone = cleaned.clone();
        watcher.on_cleanup(move || {
            cleaned_clone.fetch_add(1, Ordering::SeqCst);
        });
        watcher.teardown();
        assert_eq!(cleaned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn on_watcher_cleanup_outside_watcher_warns_and_degrades() {
        // Must not panic.
        on_watcher_cleanup(|| {}, false);
        on_watcher_cleanup(|| {}, true);
    }
}
