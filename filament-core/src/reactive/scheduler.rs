//! Flush Scheduler
//!
//! The shared queue that batches, deduplicates, and orders watcher re-runs.
//!
//! # Ordering
//!
//! Entries run in ascending watcher-id order (creation order), so watchers
//! created earlier (parents) run before those created later. `post`
//! entries always sort after default entries regardless of id. Ties on
//! `(post, id)` are broken by a secondary enqueue sequence, so the order is
//! a deterministic total order.
//!
//! # Deduplication
//!
//! A watcher already pending in the undrained queue is not enqueued again.
//! The pending mark is cleared right before the entry runs, so a watcher
//! may legitimately re-queue itself during its own run, which is also how
//! runaway update loops are detected: a watcher re-queued more than
//! [`MAX_UPDATE_COUNT`] times within one flush is stopped with a
//! diagnostic, and the flush is abandoned early, leaving the remaining
//! entries queued for the next cycle.
//!
//! # Drain scheduling
//!
//! The drain itself is requested through a host-installed hook (a
//! microtask-equivalent "call this back once, soon" primitive); repeated
//! queue requests before the drain coalesce into one hook call. Without a
//! hook the queue drains synchronously as soon as the current trigger
//! burst's scheduling bracket closes.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::dep;
use super::watcher::{self, Watcher};

/// How many times one watcher may re-queue itself within a single flush
/// before it is considered a runaway update loop.
pub const MAX_UPDATE_COUNT: usize = 100;

/// A deferred drain request handed to the host's flush hook.
pub type FlushTask = Box<dyn FnOnce()>;

struct Entry {
    watcher: Watcher,
    seq: u64,
}

impl Entry {
    fn sort_key(&self) -> (bool, u64, u64) {
        (self.watcher.is_post(), self.watcher.id(), self.seq)
    }
}

#[derive(Default)]
struct State {
    queue: Vec<Entry>,
    pending: HashSet<u64>,
    circular: HashMap<u64, usize>,
    waiting: bool,
    flushing: bool,
    index: usize,
    next_seq: u64,
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State::default());
    static FLUSH_HOOK: RefCell<Option<Rc<dyn Fn(FlushTask)>>> = const { RefCell::new(None) };
    static PRE_QUEUE_HOOK: RefCell<Option<Rc<dyn Fn(&Watcher) -> bool>>> = const { RefCell::new(None) };
}

/// Install the host's drain-scheduling primitive.
///
/// The hook receives a task to invoke once, later, on this same thread;
/// multiple queue requests before the task runs coalesce into a single
/// call. Without a hook the engine degrades to draining synchronously at
/// the end of each trigger burst.
pub fn set_flush_hook(hook: impl Fn(FlushTask) + 'static) {
    FLUSH_HOOK.with(|slot| *slot.borrow_mut() = Some(Rc::new(hook)));
}

/// Remove the host's drain-scheduling primitive.
pub fn clear_flush_hook() {
    FLUSH_HOOK.with(|slot| *slot.borrow_mut() = None);
}

/// Install the host's pre-setup buffering predicate.
///
/// Default-flush watchers are offered to the hook before queueing; when it
/// returns `true` the watcher was buffered by the host (to be run as part
/// of its owner's first setup) and is not queued. Without a hook every
/// watcher queues normally.
pub fn set_pre_queue_hook(hook: impl Fn(&Watcher) -> bool + 'static) {
    PRE_QUEUE_HOOK.with(|slot| *slot.borrow_mut() = Some(Rc::new(hook)));
}

/// Remove the host's pre-setup buffering predicate.
pub fn clear_pre_queue_hook() {
    PRE_QUEUE_HOOK.with(|slot| *slot.borrow_mut() = None);
}

/// Queue a default-flush watcher, offering it to the pre-setup buffer
/// first.
pub fn queue_pre_watcher(watcher: &Watcher) {
    let buffered = PRE_QUEUE_HOOK.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|hook| (**hook)(watcher))
            .unwrap_or(false)
    });
    if !buffered {
        queue_watcher(watcher);
    }
}

/// Enqueue a watcher for the next flush.
///
/// Deduplicates by watcher id against the undrained queue. During a flush,
/// the new entry is spliced into sorted position ahead of the cursor, so a
/// watcher with a smaller id than the unprocessed entries still runs in the
/// current pass.
pub fn queue_watcher(watcher: &Watcher) {
    let kick = STATE.with(|state| {
        let mut state = state.borrow_mut();
        let id = watcher.id();
        if state.pending.contains(&id) {
            return false;
        }
        if watcher.no_recurse()
            && watcher::active_watcher().map(|active| active.id()) == Some(id)
        {
            return false;
        }
        state.pending.insert(id);
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = Entry {
            watcher: watcher.clone(),
            seq,
        };
        if !state.flushing {
            state.queue.push(entry);
        } else {
            // Splice into sorted position, but never before the cursor.
            let key = entry.sort_key();
            let mut at = state.queue.len();
            while at > state.index + 1 && state.queue[at - 1].sort_key() > key {
                at -= 1;
            }
            state.queue.insert(at, entry);
        }
        if !state.waiting {
            state.waiting = true;
            return true;
        }
        false
    });
    if kick {
        schedule_flush();
    }
}

fn schedule_flush() {
    let hook = FLUSH_HOOK.with(|slot| slot.borrow().clone());
    match hook {
        Some(hook) => (*hook)(Box::new(flush_queue)),
        None => {
            // Degraded mode: drain at the end of the trigger burst. If no
            // scheduling bracket is open we are the burst, so drain now.
            if !dep::scheduling_paused() {
                flush_queue();
            }
        }
    }
}

/// Drain the queue synchronously if a hookless flush was deferred past a
/// scheduling bracket. Called by `reset_scheduling`.
pub(crate) fn flush_deferred() {
    let should_flush = STATE.with(|state| {
        let state = state.borrow();
        state.waiting && !state.flushing
    });
    let hook_installed = FLUSH_HOOK.with(|slot| slot.borrow().is_some());
    if should_flush && !hook_installed {
        flush_queue();
    }
}

/// One drain pass over a sorted snapshot of the queue.
fn flush_queue() {
    let proceed = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.flushing {
            return false;
        }
        state.flushing = true;
        state.index = 0;
        state.queue.sort_by_key(Entry::sort_key);
        true
    });
    if !proceed {
        return;
    }
    let mut aborted = false;
    loop {
        let next = STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.index >= state.queue.len() {
                return None;
            }
            let watcher = state.queue[state.index].watcher.clone();
            // Clear the pending mark right before running, so the watcher
            // can re-queue itself without colliding with this entry.
            state.pending.remove(&watcher.id());
            Some(watcher)
        });
        let Some(watcher) = next else {
            break;
        };
        watcher.run();
        let runaway = STATE.with(|state| {
            let mut state = state.borrow_mut();
            let id = watcher.id();
            let requeued = state.pending.contains(&id);
            state.index += 1;
            if requeued {
                let count = state.circular.entry(id).or_insert(0);
                *count += 1;
                if *count > MAX_UPDATE_COUNT {
                    return true;
                }
            }
            false
        });
        if runaway {
            tracing::warn!(
                watcher_id = watcher.id(),
                "you may have an infinite update loop in a watcher; stopping it"
            );
            watcher.teardown();
            aborted = true;
            break;
        }
    }
    let reschedule = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if aborted {
            // Drop the processed prefix, keep the rest for the next cycle.
            let index = state.index;
            state.queue.drain(..index);
            state.queue.retain(|entry| entry.watcher.is_active());
            state.pending = state.queue.iter().map(|entry| entry.watcher.id()).collect();
            state.index = 0;
            state.circular.clear();
            state.flushing = false;
            state.waiting = !state.queue.is_empty();
            state.waiting
        } else {
            state.queue.clear();
            state.pending.clear();
            state.circular.clear();
            state.index = 0;
            state.waiting = false;
            state.flushing = false;
            false
        }
    });
    if reschedule {
        schedule_flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::{Arc, Mutex};

    fn queued_watcher(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Watcher {
        let log = log.clone();
        Watcher::with_scheduler(
            move || {
                log.lock().unwrap().push(label);
            },
            |watcher| queue_watcher(watcher),
        )
    }

    #[test]
    fn flush_runs_in_creation_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = queued_watcher(&log, "a");
        let b = queued_watcher(&log, "b");
        log.lock().unwrap().clear();

        // Collect the burst behind a hook, queue out of creation order, then
        // drain: the flush must sort by creation id.
        let tasks: Rc<RefCell<Vec<FlushTask>>> = Rc::new(RefCell::new(Vec::new()));
        let tasks_clone = tasks.clone();
        set_flush_hook(move |task| tasks_clone.borrow_mut().push(task));
        queue_watcher(&b);
        queue_watcher(&a);
        for task in tasks.borrow_mut().drain(..) {
            task();
        }
        clear_flush_hook();
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn post_entries_run_after_default_entries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = queued_watcher(&log, "post");
        let b = queued_watcher(&log, "pre");
        a.set_post(true);
        log.lock().unwrap().clear();

        // Collect into one burst, then drain.
        let tasks: Rc<RefCell<Vec<FlushTask>>> = Rc::new(RefCell::new(Vec::new()));
        let tasks_clone = tasks.clone();
        set_flush_hook(move |task| tasks_clone.borrow_mut().push(task));
        queue_watcher(&a);
        queue_watcher(&b);
        assert_eq!(tasks.borrow().len(), 1, "queue requests must coalesce");
        for task in tasks.borrow_mut().drain(..) {
            task();
        }
        clear_flush_hook();
        assert_eq!(*log.lock().unwrap(), ["pre", "post"]);
    }

    #[test]
    fn queueing_while_pending_is_deduplicated() {
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let watcher = Watcher::with_scheduler(
            move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            },
            |watcher| queue_watcher(watcher),
        );
        runs.store(0, Ordering::SeqCst);

        let tasks: Rc<RefCell<Vec<FlushTask>>> = Rc::new(RefCell::new(Vec::new()));
        let tasks_clone = tasks.clone();
        set_flush_hook(move |task| tasks_clone.borrow_mut().push(task));
        queue_watcher(&watcher);
        queue_watcher(&watcher);
        queue_watcher(&watcher);
        for task in tasks.borrow_mut().drain(..) {
            task();
        }
        clear_flush_hook();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runaway_watcher_is_stopped_with_a_diagnostic() {
        // A watcher that unconditionally re-queues itself.
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let watcher = Watcher::with_scheduler(
            move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            },
            |watcher| queue_watcher(watcher),
        );
        runs.store(0, Ordering::SeqCst);

        let requeue = watcher.clone();
        watcher.set_runner(std::sync::Arc::new(move |w: &Watcher| {
            w.run_cleanups();
            w.get();
            queue_watcher(&requeue);
        }));

        queue_watcher(&watcher);
        assert!(
            !watcher.is_active(),
            "runaway watcher must be torn down, not looped forever"
        );
        let total = runs.load(Ordering::SeqCst);
        assert!(total as usize > MAX_UPDATE_COUNT);
        assert!((total as usize) < MAX_UPDATE_COUNT + 10);
    }

    #[test]
    fn pre_queue_hook_buffers_watchers() {
        let buffered: Rc<Cell<usize>> = Rc::new(Cell::new(0));
        let buffered_clone = buffered.clone();
        set_pre_queue_hook(move |_| {
            buffered_clone.set(buffered_clone.get() + 1);
            true
        });
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let watcher = Watcher::with_scheduler(
            move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            },
            |watcher| queue_pre_watcher(watcher),
        );
        runs.store(0, Ordering::SeqCst);
        queue_pre_watcher(&watcher);
        clear_pre_queue_hook();
        assert_eq!(buffered.get(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0, "buffered watcher must not run");
    }
}
