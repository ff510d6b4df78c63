use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::debug;
use sharedlist_core::{StorePath, Value, WriteBatch};
use uuid::Uuid;

use crate::error::StoreError;
use crate::traits::{
    ChildCallback, ChildSnapshot, EventKind, FetchCallback, RemoteStore, SubscriptionHandle,
    WriteCallback,
};

const MAX_DELIVERIES_PER_RUN: usize = 100_000;

/// What a queued delivery is, without its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingDelivery {
    Fetch { path: StorePath },
    Write { paths: usize },
    Event { handle: SubscriptionHandle, kind: EventKind, key: String },
}

enum Delivery {
    Fetch {
        path: StorePath,
        callback: FetchCallback,
    },
    Write {
        batch: WriteBatch,
        callback: WriteCallback,
    },
    Event {
        handle: SubscriptionHandle,
        snapshot: ChildSnapshot,
    },
}

impl Delivery {
    fn describe(&self, subscriptions: &BTreeMap<SubscriptionHandle, Subscription>) -> PendingDelivery {
        match self {
            Delivery::Fetch { path, .. } => PendingDelivery::Fetch { path: path.clone() },
            Delivery::Write { batch, .. } => PendingDelivery::Write { paths: batch.len() },
            Delivery::Event { handle, snapshot } => PendingDelivery::Event {
                handle: *handle,
                kind: subscriptions
                    .get(handle)
                    .map(|s| s.kind)
                    .unwrap_or(EventKind::ChildChanged),
                key: snapshot.key.clone(),
            },
        }
    }
}

struct Subscription {
    path: StorePath,
    kind: EventKind,
    /// Taken out while the callback runs.
    callback: Option<ChildCallback>,
}

struct Inner {
    root: Value,
    next_handle: u64,
    subscriptions: BTreeMap<SubscriptionHandle, Subscription>,
    queue: VecDeque<Delivery>,
    write_log: Vec<WriteBatch>,
    write_failures: VecDeque<StoreError>,
    failing_fetches: Vec<(StorePath, String)>,
}

/// In-process remote store with a cooperative delivery queue.
///
/// Nothing happens until the owner drives the queue with [`deliver_next`],
/// [`deliver_at`] or [`run_until_idle`], which models a single logical
/// thread on which every completion and event arrives.
///
/// [`deliver_next`]: MemoryStore::deliver_next
/// [`deliver_at`]: MemoryStore::deliver_at
/// [`run_until_idle`]: MemoryStore::run_until_idle
pub struct MemoryStore {
    inner: RefCell<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_root(Value::empty_map())
    }

    fn with_root(root: Value) -> Self {
        Self {
            inner: RefCell::new(Inner {
                root,
                next_handle: 1,
                subscriptions: BTreeMap::new(),
                queue: VecDeque::new(),
                write_log: Vec::new(),
                write_failures: VecDeque::new(),
                failing_fetches: Vec::new(),
            }),
        }
    }

    /// Restore a tree previously exported with [`snapshot`](Self::snapshot).
    /// Only the tree comes back: no subscriptions, queue or write log.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, StoreError> {
        let root = Value::from_msgpack(bytes)?;
        if root.as_map().is_none() {
            return Err(StoreError::Serialization("snapshot root is not a map".into()));
        }
        Ok(Self::with_root(root))
    }

    /// Export the tree as msgpack.
    pub fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.inner.borrow().root.to_msgpack()?)
    }

    // ========================================================================
    // Fixtures and inspection
    // ========================================================================

    /// Write directly into the tree: no events, no write log entry.
    pub fn seed(&self, path: &StorePath, value: impl Into<Value>) {
        let mut inner = self.inner.borrow_mut();
        set_node(&mut inner.root, path.segments(), Some(value.into()));
    }

    /// Apply a write made by another client: events are queued, the write
    /// log is untouched.
    pub fn apply_external(&self, batch: WriteBatch) {
        let mut inner = self.inner.borrow_mut();
        inner.apply(batch);
    }

    pub fn value_at(&self, path: &StorePath) -> Option<Value> {
        let inner = self.inner.borrow();
        inner.read(path)
    }

    /// Batches submitted through [`RemoteStore::atomic_write`], in order.
    pub fn write_log(&self) -> Vec<WriteBatch> {
        self.inner.borrow().write_log.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.borrow().subscriptions.len()
    }

    pub fn subscriptions_at(&self, path: &StorePath, kind: EventKind) -> usize {
        self.inner
            .borrow()
            .subscriptions
            .values()
            .filter(|s| &s.path == path && s.kind == kind)
            .count()
    }

    pub fn fail_next_write(&self, error: StoreError) {
        self.inner.borrow_mut().write_failures.push_back(error);
    }

    /// Make every fetch at or below `path` fail with a transport error.
    pub fn fail_fetches_under(&self, path: &StorePath, message: &str) {
        self.inner
            .borrow_mut()
            .failing_fetches
            .push((path.clone(), message.to_string()));
    }

    pub fn clear_fetch_failures(&self) {
        self.inner.borrow_mut().failing_fetches.clear();
    }

    // ========================================================================
    // Delivery queue
    // ========================================================================

    pub fn pending(&self) -> Vec<PendingDelivery> {
        let inner = self.inner.borrow();
        inner
            .queue
            .iter()
            .map(|d| d.describe(&inner.subscriptions))
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.borrow().queue.is_empty()
    }

    pub fn deliver_next(&self) -> bool {
        self.deliver_at(0)
    }

    /// Deliver the queued item at `index`. Returns false when there is none.
    pub fn deliver_at(&self, index: usize) -> bool {
        let delivery = match self.inner.borrow_mut().queue.remove(index) {
            Some(delivery) => delivery,
            None => return false,
        };
        // No borrow is held while callbacks run; they may call back in.
        match delivery {
            Delivery::Fetch { path, callback } => {
                let result = self.inner.borrow().fetch_result(&path);
                callback(result);
            }
            Delivery::Write { batch, callback } => {
                let failure = self.inner.borrow_mut().write_failures.pop_front();
                match failure {
                    Some(error) => {
                        debug!("event=write_rejected module=memory_store paths={}", batch.len());
                        callback(Err(error));
                    }
                    None => {
                        self.inner.borrow_mut().apply(batch);
                        callback(Ok(()));
                    }
                }
            }
            Delivery::Event { handle, snapshot } => self.dispatch_event(handle, snapshot),
        }
        true
    }

    /// Deliver until the queue is empty. Returns the number of deliveries.
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES_PER_RUN && self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    fn dispatch_event(&self, handle: SubscriptionHandle, snapshot: ChildSnapshot) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            match inner.subscriptions.get_mut(&handle) {
                Some(subscription) => subscription.callback.take(),
                // Unsubscribed after the event was queued.
                None => None,
            }
        };
        let Some(mut callback) = callback else {
            return;
        };
        callback(snapshot);
        let mut inner = self.inner.borrow_mut();
        if let Some(subscription) = inner.subscriptions.get_mut(&handle) {
            subscription.callback = Some(callback);
        }
    }
}

impl Inner {
    fn read(&self, path: &StorePath) -> Option<Value> {
        self.root
            .get(path)
            .filter(|value| !value.is_vacant())
            .cloned()
    }

    fn fetch_result(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        if let Some((_, message)) = self
            .failing_fetches
            .iter()
            .find(|(prefix, _)| prefix == path || prefix.is_ancestor_of(path))
        {
            return Err(StoreError::Transport(message.clone()));
        }
        Ok(self.read(path))
    }

    fn apply(&mut self, batch: WriteBatch) {
        let watched: BTreeSet<StorePath> = self
            .subscriptions
            .values()
            .filter(|s| batch.paths().any(|p| p.overlaps(&s.path)))
            .map(|s| s.path.clone())
            .collect();
        let before: BTreeMap<StorePath, Value> = watched
            .iter()
            .map(|path| (path.clone(), self.read(path).unwrap_or(Value::Null)))
            .collect();

        let paths = batch.len();
        for (path, update) in batch {
            set_node(&mut self.root, path.segments(), update);
        }
        debug!("event=write_applied module=memory_store paths={paths}");

        let mut events = Vec::new();
        for (handle, subscription) in &self.subscriptions {
            let Some(old) = before.get(&subscription.path) else {
                continue;
            };
            let new = self.read(&subscription.path).unwrap_or(Value::Null);
            for snapshot in child_diff(old, &new, subscription.kind) {
                events.push(Delivery::Event {
                    handle: *handle,
                    snapshot,
                });
            }
        }
        self.queue.extend(events);
    }
}

fn child_diff(before: &Value, after: &Value, kind: EventKind) -> Vec<ChildSnapshot> {
    let empty = BTreeMap::new();
    let old = before.as_map().unwrap_or(&empty);
    let new = after.as_map().unwrap_or(&empty);
    let snapshot = |key: &String, value: &Value| ChildSnapshot {
        key: key.clone(),
        value: value.clone(),
    };
    match kind {
        EventKind::ChildAdded => new
            .iter()
            .filter(|(key, _)| !old.contains_key(*key))
            .map(|(k, v)| snapshot(k, v))
            .collect(),
        EventKind::ChildRemoved => old
            .iter()
            .filter(|(key, _)| !new.contains_key(*key))
            .map(|(k, v)| snapshot(k, v))
            .collect(),
        EventKind::ChildChanged => new
            .iter()
            .filter(|(key, value)| old.get(*key).is_some_and(|prev| prev != *value))
            .map(|(k, v)| snapshot(k, v))
            .collect(),
    }
}

/// Drop vacant descendants so that empty maps never exist as nodes.
fn prune(value: Value) -> Value {
    match value {
        Value::Map(children) => Value::Map(
            children
                .into_iter()
                .map(|(key, child)| (key, prune(child)))
                .filter(|(_, child)| !child.is_vacant())
                .collect(),
        ),
        leaf => leaf,
    }
}

fn set_node(node: &mut Value, segments: &[String], update: Option<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        *node = update.map(prune).unwrap_or_else(Value::empty_map);
        return;
    };
    if node.as_map().is_none() {
        if update.is_none() {
            return;
        }
        *node = Value::empty_map();
    }
    let Value::Map(children) = node else {
        return;
    };
    if rest.is_empty() {
        match update.map(prune) {
            Some(value) if !value.is_vacant() => {
                children.insert(head.clone(), value);
            }
            _ => {
                children.remove(head);
            }
        }
        return;
    }
    let child = children
        .entry(head.clone())
        .or_insert_with(Value::empty_map);
    set_node(child, rest, update);
    if child.is_vacant() {
        children.remove(head);
    }
}

impl RemoteStore for MemoryStore {
    fn fetch_once(&self, path: &StorePath, on_complete: FetchCallback) {
        self.inner.borrow_mut().queue.push_back(Delivery::Fetch {
            path: path.clone(),
            callback: on_complete,
        });
    }

    fn subscribe(
        &self,
        path: &StorePath,
        kind: EventKind,
        on_event: ChildCallback,
    ) -> SubscriptionHandle {
        let mut inner = self.inner.borrow_mut();
        let handle = SubscriptionHandle::from_raw(inner.next_handle);
        inner.next_handle += 1;

        // A child-added listener first hears about every existing child.
        if kind == EventKind::ChildAdded {
            if let Some(Value::Map(children)) = inner.read(path) {
                for (key, value) in children {
                    inner.queue.push_back(Delivery::Event {
                        handle,
                        snapshot: ChildSnapshot { key, value },
                    });
                }
            }
        }

        inner.subscriptions.insert(
            handle,
            Subscription {
                path: path.clone(),
                kind,
                callback: Some(on_event),
            },
        );
        debug!(
            "event=subscribe module=memory_store path={path} kind={} handle={}",
            kind.as_str(),
            handle.raw()
        );
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner.borrow_mut().subscriptions.remove(&handle);
    }

    fn unsubscribe_all(&self, path: &StorePath) {
        self.inner
            .borrow_mut()
            .subscriptions
            .retain(|_, s| &s.path != path);
    }

    fn allocate_key(&self, _parent: &StorePath) -> String {
        Uuid::now_v7().to_string()
    }

    fn atomic_write(&self, batch: WriteBatch, on_complete: WriteCallback) {
        let mut inner = self.inner.borrow_mut();
        inner.write_log.push(batch.clone());
        inner.queue.push_back(Delivery::Write {
            batch,
            callback: on_complete,
        });
    }
}
