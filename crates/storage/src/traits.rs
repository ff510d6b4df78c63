use sharedlist_core::{StorePath, Value, WriteBatch};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    ChildAdded,
    ChildRemoved,
    ChildChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChildAdded => "child_added",
            Self::ChildRemoved => "child_removed",
            Self::ChildChanged => "child_changed",
        }
    }
}

/// One direct child of a subscribed node: its key and (current or, for
/// removals, last known) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSnapshot {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

pub type FetchCallback = Box<dyn FnOnce(Result<Option<Value>, StoreError>)>;
pub type ChildCallback = Box<dyn FnMut(ChildSnapshot)>;
pub type WriteCallback = Box<dyn FnOnce(Result<(), StoreError>)>;

/// Path-addressed capability of the remote tree store.
///
/// Completions and events are delivered later on the caller's logical
/// thread, never from inside the call that requested them. In-flight
/// fetches and writes cannot be cancelled; unsubscribing only stops future
/// event delivery.
pub trait RemoteStore {
    /// One-shot read. `Ok(None)` when nothing exists at `path`.
    fn fetch_once(&self, path: &StorePath, on_complete: FetchCallback);

    fn subscribe(
        &self,
        path: &StorePath,
        kind: EventKind,
        on_event: ChildCallback,
    ) -> SubscriptionHandle;

    fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Drop every subscription registered exactly at `path`.
    fn unsubscribe_all(&self, path: &StorePath);

    /// Reserve a fresh child key under `parent` without writing anything.
    fn allocate_key(&self, parent: &StorePath) -> String;

    /// Apply every update of `batch` as one all-or-nothing write.
    fn atomic_write(&self, batch: WriteBatch, on_complete: WriteCallback);
}
