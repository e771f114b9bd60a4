//! Raw Targets
//!
//! A target is a shared, unwrapped container eligible for observation: a
//! record (string-keyed fields), a list, a map, or a set. Targets are owned
//! by application code; the engine attaches bookkeeping out-of-band, keyed
//! by the target's stable identity.
//!
//! # Identity and lifetime
//!
//! Every target carries a [`TargetId`] allocated from a global counter at
//! construction. The dependency store and the proxy identity caches are
//! keyed by this id, and dropping the last handle to a target removes its
//! entries from both tables, so bookkeeping never outlives the data it
//! describes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use indexmap::{IndexMap, IndexSet};

use super::value::{Value, ValueKey};
use super::{dep, proxy};

/// Unique identity of an observable target (containers and refs alike).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

impl TargetId {
    /// Allocate a fresh identity.
    ///
    /// Host adapters that feed custom observable sources through the
    /// low-level `track`/`trigger` primitives allocate their ids here.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

/// The shape of a target, resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A plain object with string field names.
    Record,

    /// An ordered sequence.
    List,

    /// A keyed collection with arbitrary keys.
    Map,

    /// A collection of distinct elements.
    Set,
}

impl TargetKind {
    /// Lowercase name, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Record => "record",
            TargetKind::List => "list",
            TargetKind::Map => "map",
            TargetKind::Set => "set",
        }
    }
}

/// The underlying storage of a target.
#[derive(Clone, Debug)]
pub(crate) enum Storage {
    Record(IndexMap<String, Value>),
    List(Vec<Value>),
    Map(IndexMap<ValueKey, Value>),
    Set(IndexSet<ValueKey>),
}

struct ObjInner {
    id: TargetId,
    kind: TargetKind,

    /// Marked by `mark_raw`: this target is never wrapped.
    skip: AtomicBool,

    storage: RwLock<Storage>,
}

impl Drop for ObjInner {
    fn drop(&mut self) {
        dep::forget_target(self.id);
        proxy::forget_target(self.id);
    }
}

/// A shared raw container.
///
/// Cloning shares the underlying storage; equality and hashing follow the
/// target identity.
pub struct Obj {
    inner: Arc<ObjInner>,
}

impl Obj {
    fn from_storage(kind: TargetKind, storage: Storage) -> Self {
        Self {
            inner: Arc::new(ObjInner {
                id: TargetId::new(),
                kind,
                skip: AtomicBool::new(false),
                storage: RwLock::new(storage),
            }),
        }
    }

    /// Create an empty record.
    pub fn record() -> Self {
        Self::from_storage(TargetKind::Record, Storage::Record(IndexMap::new()))
    }

    /// Create a record from field/value pairs.
    pub fn record_from<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let fields = fields
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self::from_storage(TargetKind::Record, Storage::Record(fields))
    }

    /// Create an empty list.
    pub fn list() -> Self {
        Self::from_storage(TargetKind::List, Storage::List(Vec::new()))
    }

    /// Create a list from items.
    pub fn list_from<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        let items = items.into_iter().map(Into::into).collect();
        Self::from_storage(TargetKind::List, Storage::List(items))
    }

    /// Create an empty map.
    pub fn map() -> Self {
        Self::from_storage(TargetKind::Map, Storage::Map(IndexMap::new()))
    }

    /// Create a map from key/value pairs.
    pub fn map_from<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (ValueKey::new(key.into()), value.into()))
            .collect();
        Self::from_storage(TargetKind::Map, Storage::Map(entries))
    }

    /// Create an empty set.
    pub fn set() -> Self {
        Self::from_storage(TargetKind::Set, Storage::Set(IndexSet::new()))
    }

    /// Create a set from elements.
    pub fn set_from<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        let items = items
            .into_iter()
            .map(|item| ValueKey::new(item.into()))
            .collect();
        Self::from_storage(TargetKind::Set, Storage::Set(items))
    }

    /// Get the target's stable identity.
    pub fn id(&self) -> TargetId {
        self.inner.id
    }

    /// Get the target's shape.
    pub fn kind(&self) -> TargetKind {
        self.inner.kind
    }

    /// Mark this target as never observable (see `mark_raw`).
    pub(crate) fn mark_skip(&self) {
        self.inner.skip.store(true, Ordering::SeqCst);
    }

    /// Whether this target is excluded from observation.
    pub fn is_skip(&self) -> bool {
        self.inner.skip.load(Ordering::SeqCst)
    }

    /// Read the storage.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Storage) -> R) -> R {
        let storage = self.inner.storage.read().expect("target storage lock poisoned");
        f(&storage)
    }

    /// Mutate the storage.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut Storage) -> R) -> R {
        let mut storage = self.inner.storage.write().expect("target storage lock poisoned");
        f(&mut storage)
    }

    /// Number of fields/items/entries, without tracking.
    pub fn raw_len(&self) -> usize {
        self.read(|storage| match storage {
            Storage::Record(fields) => fields.len(),
            Storage::List(items) => items.len(),
            Storage::Map(entries) => entries.len(),
            Storage::Set(items) => items.len(),
        })
    }

    /// Clone the storage, without tracking. Used by deep traversal and
    /// bulk-replace diffing.
    pub(crate) fn snapshot(&self) -> Storage {
        self.read(|storage| storage.clone())
    }
}

impl Clone for Obj {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Obj {}

impl std::hash::Hash for Obj {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Obj")
            .field("id", &self.inner.id.raw())
            .field("kind", &self.inner.kind)
            .finish()
    }
}
