//! Reactive Core
//!
//! This module implements Filament's fine-grained reactivity engine:
//! observation of dynamic data structures, the dependency-tracking graph,
//! derived/cached values, watchers and effect scopes, and the flush
//! scheduler that batches and orders re-execution.
//!
//! # Concepts
//!
//! ## Targets and proxies
//!
//! Application data lives in shared raw containers ([`Obj`]: records,
//! lists, maps, sets) holding dynamic [`Value`]s. Wrapping a container
//! with [`reactive`] (or its shallow/readonly variants) produces a
//! [`Reactive`] view whose every read records a dependency and whose every
//! mutation notifies the computations that depend on it.
//!
//! ## Refs and computeds
//!
//! A [`Ref`] is a single reactive cell; a [`Computed`] is a lazily
//! re-evaluated cached value derived from other reactive state.
//!
//! ## Watchers, scopes, and scheduling
//!
//! A [`Watcher`] is the unit of reactive computation. The [`watch`] /
//! [`watch_effect`] layer builds watchers declaratively and routes their
//! re-runs through a shared flush queue that batches, deduplicates, orders
//! by creation id, and guards against runaway update loops. An
//! [`EffectScope`] groups watchers so a whole subtree tears down
//! atomically.
//!
//! # Implementation Notes
//!
//! Dependency tracking uses a thread-local active-watcher stack; the
//! dep store and proxy identity caches are process-wide tables keyed by
//! target identity. This mirrors the automatic dependency tracking used
//! by fine-grained reactive UI frameworks: reads are intercepted, the
//! current computation is looked up ambiently, and mutation notification
//! is decoupled from mutation itself through a scheduling bracket.
//!
//! Misuse (writing to readonly views, invalid watch sources, runaway
//! update loops) is reported through `tracing` diagnostics and degrades
//! gracefully; the engine only propagates panics that originate in user
//! closures, and restores its ambient stacks even then.

mod collections;
mod computed;
mod debug;
mod dep;
mod key;
mod ops;
mod proxy;
mod refs;
mod scheduler;
mod scope;
mod target;
mod value;
mod watch;
mod watcher;

pub use collections::batch;
pub use computed::Computed;
pub use debug::{DebugHook, DebugOp, DebuggerEvent};
pub use dep::{
    pause_scheduling, pause_tracking, reset_scheduling, reset_tracking, track, track_ref_value,
    tracking_enabled, trigger, trigger_ref_value, Dep,
};
pub use key::{integer_key, Key};
pub use ops::{TrackOp, TriggerOp};
pub use proxy::{
    is_proxy, is_reactive, is_readonly, is_shallow, mark_raw, reactive, readonly,
    shallow_reactive, shallow_readonly, to_raw, to_reactive, to_readonly, Reactive,
};
pub use refs::{
    is_ref, to_ref, to_refs, to_value, trigger_ref, unref, CustomRefOps, Ref, RefTrack,
    RefTrigger,
};
pub use scheduler::{
    clear_flush_hook, clear_pre_queue_hook, queue_pre_watcher, queue_watcher, set_flush_hook,
    set_pre_queue_hook, FlushTask, MAX_UPDATE_COUNT,
};
pub use scope::{get_current_scope, on_scope_dispose, EffectScope};
pub use target::{Obj, TargetId, TargetKind};
pub use value::{value_changed, Value, ValueError, ValueKey};
pub use watch::{
    traverse, watch, watch_effect, watch_post_effect, watch_sync_effect, FlushMode, OnCleanup,
    WatchHandle, WatchOptions, WatchSource,
};
pub use watcher::{active_watcher, get_current_watcher, on_watcher_cleanup, Watcher};
