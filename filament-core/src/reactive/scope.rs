//! Effect Scopes
//!
//! A scope groups watchers and nested scopes so that a whole subtree of
//! reactive computations can be torn down atomically. Watchers and child
//! scopes created while a scope is current register with it automatically;
//! stopping the scope tears everything down exactly once.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::watcher::Watcher;

type CleanupFn = Box<dyn FnOnce() + Send>;

struct ScopeInner {
    active: AtomicBool,

    /// Detached scopes do not register with (and are not stopped by) their
    /// parent.
    detached: bool,

    watchers: Mutex<Vec<Watcher>>,
    cleanups: Mutex<Vec<CleanupFn>>,
    children: Mutex<Vec<EffectScope>>,

    parent: Weak<ScopeInner>,

    /// This scope's position in the parent's child list, maintained under
    /// swap-remove. Sibling order is not guaranteed.
    index_in_parent: AtomicUsize,
}

/// A disposal grouping for watchers and nested scopes.
pub struct EffectScope {
    inner: Arc<ScopeInner>,
}

thread_local! {
    static ACTIVE_SCOPES: RefCell<Vec<EffectScope>> = const { RefCell::new(Vec::new()) };
}

/// Guard restoring the previous current scope, panic or not.
struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_SCOPES.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl EffectScope {
    /// Create a scope attached to the current scope, if any.
    pub fn new() -> Self {
        Self::create(false)
    }

    /// Create a detached scope: it is not stopped when the enclosing scope
    /// stops.
    pub fn detached() -> Self {
        Self::create(true)
    }

    fn create(detached: bool) -> Self {
        let parent = if detached { None } else { get_current_scope() };
        let scope = Self {
            inner: Arc::new(ScopeInner {
                active: AtomicBool::new(true),
                detached,
                watchers: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                parent: parent
                    .as_ref()
                    .map(|parent| Arc::downgrade(&parent.inner))
                    .unwrap_or_default(),
                index_in_parent: AtomicUsize::new(0),
            }),
        };
        if let Some(parent) = parent {
            let mut children = parent
                .inner
                .children
                .lock()
                .expect("scope child lock poisoned");
            scope
                .inner
                .index_in_parent
                .store(children.len(), Ordering::SeqCst);
            children.push(scope.clone());
        }
        scope
    }

    /// Whether the scope has not been stopped.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Run `f` with this scope as the current scope.
    ///
    /// Watchers and scopes created inside register with this scope. The
    /// previous current scope is restored afterwards, even on panic.
    /// Returns `None` (with a diagnostic) if the scope is already stopped.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.is_active() {
            tracing::warn!("cannot run an inactive effect scope");
            return None;
        }
        ACTIVE_SCOPES.with(|stack| stack.borrow_mut().push(self.clone()));
        let _guard = ScopeGuard;
        Some(f())
    }

    /// Register a cleanup callback, run when the scope stops.
    pub fn on_dispose<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .cleanups
            .lock()
            .expect("scope cleanup lock poisoned")
            .push(Box::new(cleanup));
    }

    /// Stop the scope: tear down every owned watcher, run cleanups in
    /// registration order, stop every child scope, and detach from the
    /// parent. Idempotent.
    pub fn stop(&self) {
        self.stop_inner(false);
    }

    fn stop_inner(&self, from_parent: bool) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let watchers: Vec<Watcher> = {
            let mut watchers = self.inner.watchers.lock().expect("scope watcher lock poisoned");
            watchers.drain(..).collect()
        };
        for watcher in watchers {
            watcher.teardown();
        }
        let cleanups: Vec<CleanupFn> = {
            let mut cleanups = self.inner.cleanups.lock().expect("scope cleanup lock poisoned");
            cleanups.drain(..).collect()
        };
        for cleanup in cleanups {
            cleanup();
        }
        let children: Vec<EffectScope> = {
            let mut children = self.inner.children.lock().expect("scope child lock poisoned");
            children.drain(..).collect()
        };
        for child in children {
            // The child list is already discarded, so children skip
            // re-removing themselves from it.
            child.stop_inner(true);
        }
        if !self.inner.detached && !from_parent {
            if let Some(parent) = self.inner.parent.upgrade() {
                let mut siblings = parent.children.lock().expect("scope child lock poisoned");
                let index = self.inner.index_in_parent.load(Ordering::SeqCst);
                if let Some(last) = siblings.pop() {
                    if !Arc::ptr_eq(&last.inner, &self.inner) && index < siblings.len() {
                        last.inner.index_in_parent.store(index, Ordering::SeqCst);
                        siblings[index] = last;
                    }
                }
            }
        }
    }

    pub(crate) fn add_watcher(&self, watcher: &Watcher) {
        self.inner
            .watchers
            .lock()
            .expect("scope watcher lock poisoned")
            .push(watcher.clone());
    }
}

impl Clone for EffectScope {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for EffectScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EffectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectScope")
            .field("active", &self.is_active())
            .field("detached", &self.inner.detached)
            .finish()
    }
}

/// The current active scope on this thread, if any.
pub fn get_current_scope() -> Option<EffectScope> {
    ACTIVE_SCOPES.with(|stack| stack.borrow().last().cloned())
}

/// Register a dispose callback on the current active scope.
///
/// Reports a diagnostic and does nothing when called outside a scope.
pub fn on_scope_dispose<F>(cleanup: F)
where
    F: FnOnce() + Send + 'static,
{
    match get_current_scope() {
        Some(scope) => scope.on_dispose(cleanup),
        None => tracing::warn!(
            "on_scope_dispose() is called when there is no active effect scope to be associated with"
        ),
    }
}

/// Attach a watcher to the current scope, if one is active.
pub(crate) fn register_watcher(watcher: &Watcher) {
    if let Some(scope) = get_current_scope() {
        if scope.is_active() {
            scope.add_watcher(watcher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn run_makes_scope_current() {
        let scope = EffectScope::new();
        assert!(get_current_scope().is_none());
        scope.run(|| {
            assert!(get_current_scope().is_some());
        });
        assert!(get_current_scope().is_none());
    }

    #[test]
    fn stop_is_idempotent() {
        let disposed = Arc::new(AtomicI32::new(0));
        let scope = EffectScope::new();
        let disposed_clone = disposed.clone();
        scope.on_dispose(move || {
            disposed_clone.fetch_add(1, Ordering::SeqCst);
        });
        scope.stop();
        scope.stop();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(!scope.is_active());
    }

    #[test]
    fn stopped_scope_refuses_to_run() {
        let scope = EffectScope::new();
        scope.stop();
        assert_eq!(scope.run(|| 1), None);
    }

    #[test]
    fn nested_scopes_stop_with_parent() {
        let disposed = Arc::new(AtomicI32::new(0));
        let parent = EffectScope::new();
        parent.run(|| {
            let child = EffectScope::new();
            let disposed_clone = disposed.clone();
            child.on_dispose(move || {
                disposed_clone.fetch_add(1, Ordering::SeqCst);
            });
        });
        parent.stop();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_scope_survives_parent_stop() {
        let disposed = Arc::new(AtomicI32::new(0));
        let parent = EffectScope::new();
        let detached = parent
            .run(|| {
                let detached = EffectScope::detached();
                let disposed_clone = disposed.clone();
                detached.on_dispose(move || {
                    disposed_clone.fetch_add(1, Ordering::SeqCst);
                });
                detached
            })
            .unwrap();
        parent.stop();
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        assert!(detached.is_active());
        detached.stop();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sibling_swap_remove_keeps_indices_consistent() {
        let parent = EffectScope::new();
        let (a, b, c) = parent
            .run(|| (EffectScope::new(), EffectScope::new(), EffectScope::new()))
            .unwrap();
        // Stopping the first sibling swap-removes it; the last sibling takes
        // its slot. Stopping the rest must still detach cleanly.
        a.stop();
        c.stop();
        b.stop();
        let children = parent.inner.children.lock().unwrap();
        assert!(children.is_empty());
    }
}
