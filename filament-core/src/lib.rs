//! Filament Core
//!
//! This crate provides the reactivity engine underlying the Filament UI
//! framework. It implements:
//!
//! - Observation of dynamic data structures (records, lists, maps, sets)
//! - Fine-grained dependency tracking (track/trigger, deps, watchers)
//! - Derived/cached values (computed) and single-cell refs
//! - Effect scopes for atomic teardown of computation subtrees
//! - A declarative watch API with a batching, ordering flush scheduler
//!
//! The engine is UI-agnostic: it knows nothing about components,
//! templates, or rendering. A host adapter supplies two integration
//! points, a "run this callback soon, coalescing repeats" flush
//! primitive and, optionally, a pre-setup buffering predicate, and wires
//! its render functions up as watchers.
//!
//! # Example
//!
//! ```rust
//! use filament_core::reactive::{reactive, watch_sync_effect, Obj, Value};
//!
//! let state = reactive(Obj::record_from([("count", 0)]));
//! let proxy = state.as_reactive().unwrap().clone();
//!
//! let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
//! let log = seen.clone();
//! let reader = proxy.clone();
//! let _handle = watch_sync_effect(move |_cleanup| {
//!     log.lock().unwrap().push(reader.get("count"));
//! });
//!
//! proxy.set("count", 1);
//! assert_eq!(*seen.lock().unwrap(), vec![Value::Int(0), Value::Int(1)]);
//! ```

pub mod reactive;
