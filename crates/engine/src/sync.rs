use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use log::{debug, error, info, warn};
use sharedlist_core::{Entity, EntityKey, Layout, UserId, Value};
use sharedlist_storage::{ChildSnapshot, EventKind, RemoteStore, StoreError, SubscriptionHandle};

use crate::barrier::{Arrival, LoadBarrier};
use crate::error::EngineError;
use crate::mirror::{EntityHandle, EntityMirror, UpdateNotifier};
use crate::source::{CollectionSource, ListItems, UserLists};

/// Receives collection changes. Every method has a no-op default.
///
/// The engine keeps only a weak reference and never holds an internal
/// borrow while calling out, so implementations may call back into the
/// engine (including [`CollectionSyncEngine::cleanup`]).
pub trait SyncDelegate {
    /// Bulk load finished; every initially present entity is in the mirror.
    fn data_loaded(&self) {}

    fn entity_added(&self, _entity: &EntityHandle) {}

    fn entity_removed(&self, _key: &EntityKey) {}

    /// A field of a mirrored entity changed in place.
    fn entity_updated(&self, _key: &EntityKey) {}

    /// The collection index could not be fetched; the load was abandoned.
    fn load_failed(&self, _error: &EngineError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Part of the bulk load started as `epoch`.
    Initial { epoch: u64 },
    /// Discovered through a child-added event.
    Live,
}

struct State {
    mirrors: Vec<EntityMirror>,
    subscriptions: BTreeMap<EventKind, SubscriptionHandle>,
    observers_active: bool,
    delegate: Option<Weak<dyn SyncDelegate>>,
    /// Bumped by cleanup; callbacks from an older generation are ignored.
    generation: u64,
    /// Bumped by every load_data call.
    load_epoch: u64,
    barrier: Option<LoadBarrier>,
    /// Keys with a record fetch (or author lookup) still running, counted
    /// per request.
    in_flight: BTreeMap<EntityKey, usize>,
    /// In-flight keys removed remotely before their fetch finished.
    removed_in_flight: BTreeSet<EntityKey>,
}

impl State {
    fn position(&self, key: &EntityKey) -> Option<usize> {
        self.mirrors.iter().position(|m| m.key() == key)
    }

    fn contains(&self, key: &EntityKey) -> bool {
        self.position(key).is_some()
    }

    fn start_fetch(&mut self, key: &EntityKey) {
        *self.in_flight.entry(key.clone()).or_insert(0) += 1;
    }

    /// Close one request for `key`. True when the key was removed remotely
    /// while it ran.
    fn finish_fetch(&mut self, key: &EntityKey) -> bool {
        let removed = self.removed_in_flight.contains(key);
        match self.in_flight.get_mut(key) {
            Some(count) if *count > 1 => *count -= 1,
            _ => {
                self.in_flight.remove(key);
                self.removed_in_flight.remove(key);
            }
        }
        removed
    }
}

struct Shared {
    store: Rc<dyn RemoteStore>,
    source: Box<dyn CollectionSource>,
    state: RefCell<State>,
}

impl Shared {
    fn delegate(&self) -> Option<Rc<dyn SyncDelegate>> {
        let state = self.state.borrow();
        state.delegate.as_ref().and_then(Weak::upgrade)
    }

    fn label(&self) -> &'static str {
        self.source.label()
    }
}

/// Keeps an ordered local mirror of one remote collection.
///
/// `load_data` bulk-loads the collection once and then switches to live
/// mode through `activate_observers`. Mirror order is discovery order, not
/// remote order.
pub struct CollectionSyncEngine {
    shared: Rc<Shared>,
}

impl CollectionSyncEngine {
    pub fn new(store: Rc<dyn RemoteStore>, source: impl CollectionSource + 'static) -> Self {
        Self {
            shared: Rc::new(Shared {
                store,
                source: Box::new(source),
                state: RefCell::new(State {
                    mirrors: Vec::new(),
                    subscriptions: BTreeMap::new(),
                    observers_active: false,
                    delegate: None,
                    generation: 0,
                    load_epoch: 0,
                    barrier: None,
                    in_flight: BTreeMap::new(),
                    removed_in_flight: BTreeSet::new(),
                }),
            }),
        }
    }

    /// Engine over the lists `owner` has access to.
    pub fn for_user_lists(store: Rc<dyn RemoteStore>, layout: Layout, owner: UserId) -> Self {
        Self::new(store, UserLists::new(layout, owner))
    }

    /// Engine over the items of a mirrored list.
    pub fn for_list_items(
        store: Rc<dyn RemoteStore>,
        layout: Layout,
        list: &Entity,
    ) -> Result<Self, EngineError> {
        Ok(Self::new(store, ListItems::for_list(layout, list)?))
    }

    pub fn set_delegate(&self, delegate: Weak<dyn SyncDelegate>) {
        self.shared.state.borrow_mut().delegate = Some(delegate);
    }

    pub fn attach<D: SyncDelegate + 'static>(&self, delegate: &Rc<D>) {
        let weak: Weak<D> = Rc::downgrade(delegate);
        let weak: Weak<dyn SyncDelegate> = weak;
        self.set_delegate(weak);
    }

    pub fn clear_delegate(&self) {
        self.shared.state.borrow_mut().delegate = None;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Fetch the collection index once, then every listed record. Signals
    /// `entity_added` for each arrival except the last, which signals
    /// `data_loaded` after its entity is committed; then goes live.
    pub fn load_data(&self) {
        let shared = &self.shared;
        let (generation, epoch) = {
            let mut state = shared.state.borrow_mut();
            state.load_epoch += 1;
            state.barrier = None;
            (state.generation, state.load_epoch)
        };
        let path = shared.source.index_path();
        info!(
            "event=load_start module=sync source={} path={path}",
            shared.label()
        );

        let weak = Rc::downgrade(shared);
        shared.store.fetch_once(
            &path,
            Box::new(move |result| {
                if let Some(shared) = upgrade_live(&weak, generation) {
                    on_index_loaded(&shared, generation, epoch, result);
                }
            }),
        );
    }

    /// Subscribe to child-added/child-removed on the index and activate every
    /// held mirror's field observer. Repeated calls add nothing.
    pub fn activate_observers(&self) {
        activate(&self.shared);
    }

    /// Stop all delivery, drop every mirror and the delegate. In-flight
    /// fetches still complete but are ignored. The engine can be loaded
    /// again afterwards.
    pub fn cleanup(&self) {
        let shared = &self.shared;
        let store = shared.store.as_ref();
        let mut state = shared.state.borrow_mut();
        state.generation += 1;

        for mirror in state.mirrors.iter_mut() {
            mirror.deactivate(store);
        }
        let dropped = state.mirrors.len();
        state.mirrors.clear();

        for (_, handle) in std::mem::take(&mut state.subscriptions) {
            store.unsubscribe(handle);
        }
        state.observers_active = false;
        state.barrier = None;
        state.in_flight.clear();
        state.removed_in_flight.clear();
        state.delegate = None;
        info!(
            "event=cleanup module=sync source={} dropped={dropped}",
            shared.label()
        );
    }

    // ========================================================================
    // Read access
    // ========================================================================

    pub fn len(&self) -> usize {
        self.shared.state.borrow().mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entity(&self, index: usize) -> Option<EntityHandle> {
        let state = self.shared.state.borrow();
        state.mirrors.get(index).map(|m| m.entity().clone())
    }

    pub fn find(&self, key: &EntityKey) -> Option<EntityHandle> {
        let state = self.shared.state.borrow();
        state
            .mirrors
            .iter()
            .find(|m| m.key() == key)
            .map(|m| m.entity().clone())
    }

    pub fn position(&self, key: &EntityKey) -> Option<usize> {
        self.shared.state.borrow().position(key)
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        let state = self.shared.state.borrow();
        state.mirrors.iter().map(|m| m.key().clone()).collect()
    }

    pub fn observers_active(&self) -> bool {
        self.shared.state.borrow().observers_active
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().barrier.is_some()
    }

    /// Top-level index subscriptions currently held.
    pub fn subscription_count(&self) -> usize {
        self.shared.state.borrow().subscriptions.len()
    }

    pub fn active_field_observers(&self) -> usize {
        let state = self.shared.state.borrow();
        state.mirrors.iter().filter(|m| m.is_active()).count()
    }
}

impl Drop for CollectionSyncEngine {
    fn drop(&mut self) {
        let has_work = {
            let state = self.shared.state.borrow();
            !state.subscriptions.is_empty() || !state.mirrors.is_empty()
        };
        if has_work {
            self.cleanup();
        }
    }
}

// ============================================================================
// Callback bodies
// ============================================================================

/// The engine behind `weak`, if it still exists and has not been cleaned up
/// since `generation`.
fn upgrade_live(weak: &Weak<Shared>, generation: u64) -> Option<Rc<Shared>> {
    let shared = weak.upgrade()?;
    let live = shared.state.borrow().generation == generation;
    live.then_some(shared)
}

fn update_notifier(shared: &Rc<Shared>, generation: u64) -> UpdateNotifier {
    let weak = Rc::downgrade(shared);
    Rc::new(move |key: &EntityKey| {
        let Some(shared) = upgrade_live(&weak, generation) else {
            return;
        };
        if let Some(delegate) = shared.delegate() {
            delegate.entity_updated(key);
        }
    })
}

fn on_index_loaded(
    shared: &Rc<Shared>,
    generation: u64,
    epoch: u64,
    result: Result<Option<Value>, StoreError>,
) {
    let index = match result {
        Ok(index) => index,
        Err(err) => {
            error!(
                "event=load_failed module=sync source={} error={err}",
                shared.label()
            );
            let err = EngineError::from(err);
            if let Some(delegate) = shared.delegate() {
                delegate.load_failed(&err);
            }
            return;
        }
    };

    if let Some(leaf) = index.as_ref().filter(|v| v.as_map().is_none()) {
        warn!(
            "event=index_malformed module=sync source={} found={}",
            shared.label(),
            leaf.kind_name()
        );
    }
    let keys = index.map(|v| v.child_keys()).unwrap_or_default();
    if keys.is_empty() {
        info!("event=load_done module=sync source={} count=0", shared.label());
        finish_load(shared, generation);
        return;
    }

    debug!(
        "event=load_index module=sync source={} count={}",
        shared.label(),
        keys.len()
    );
    shared.state.borrow_mut().barrier = Some(LoadBarrier::new(keys.len()));
    for key in keys {
        request_entity(shared, generation, EntityKey::new(key), Phase::Initial { epoch });
    }
}

fn request_entity(shared: &Rc<Shared>, generation: u64, key: EntityKey, phase: Phase) {
    shared.state.borrow_mut().start_fetch(&key);
    let path = shared.source.record_path(&key);
    let weak = Rc::downgrade(shared);
    shared.store.fetch_once(
        &path,
        Box::new(move |result| {
            let Some(shared) = upgrade_live(&weak, generation) else {
                return;
            };
            match result {
                Ok(Some(record)) => {
                    let weak = Rc::downgrade(&shared);
                    let entity_key = key.clone();
                    shared.source.materialize(
                        shared.store.as_ref(),
                        key,
                        record,
                        Box::new(move |entity| {
                            if let Some(shared) = upgrade_live(&weak, generation) {
                                on_entity_ready(&shared, generation, entity_key, entity.map(Some), phase);
                            }
                        }),
                    );
                }
                Ok(None) => on_entity_ready(&shared, generation, key, Ok(None), phase),
                Err(err) => on_entity_ready(&shared, generation, key, Err(err.into()), phase),
            }
        }),
    );
}

fn on_entity_ready(
    shared: &Rc<Shared>,
    generation: u64,
    key: EntityKey,
    result: Result<Option<Entity>, EngineError>,
    phase: Phase,
) {
    let entity = match result {
        Ok(Some(entity)) => Some(entity),
        Ok(None) => {
            debug!(
                "event=entity_vanished module=sync source={} key={key}",
                shared.label()
            );
            None
        }
        Err(err) => {
            warn!(
                "event=entity_dropped module=sync source={} key={key} error={err}",
                shared.label()
            );
            None
        }
    };

    let (added, arrival) = {
        let mut state = shared.state.borrow_mut();
        let entity = if state.finish_fetch(&key) {
            debug!(
                "event=entity_removed_in_flight module=sync source={} key={key}",
                shared.label()
            );
            None
        } else {
            entity
        };
        let added = entity.and_then(|entity| insert(shared, &mut state, generation, entity));
        let arrival = match phase {
            Phase::Initial { epoch } if epoch == state.load_epoch => state
                .barrier
                .as_mut()
                .map(LoadBarrier::arrive)
                .unwrap_or(Arrival::Spent),
            _ => Arrival::Spent,
        };
        if arrival == Arrival::Last {
            state.barrier = None;
        }
        (added, arrival)
    };

    if arrival == Arrival::Last {
        info!(
            "event=load_done module=sync source={} count={}",
            shared.label(),
            shared.state.borrow().mirrors.len()
        );
        finish_load(shared, generation);
        return;
    }
    if let Some(handle) = added {
        if let Some(delegate) = shared.delegate() {
            delegate.entity_added(&handle);
        }
    }
}

/// Append a mirror unless the key is already held. Mirrors join active when
/// the engine is live.
fn insert(
    shared: &Rc<Shared>,
    state: &mut State,
    generation: u64,
    entity: Entity,
) -> Option<EntityHandle> {
    if state.contains(entity.key()) {
        debug!(
            "event=duplicate_suppressed module=sync source={} key={}",
            shared.label(),
            entity.key()
        );
        return None;
    }
    let mut mirror = EntityMirror::new(entity);
    if state.observers_active {
        mirror.activate(shared.store.as_ref(), update_notifier(shared, generation));
    }
    let handle = mirror.entity().clone();
    state.mirrors.push(mirror);
    Some(handle)
}

fn finish_load(shared: &Rc<Shared>, generation: u64) {
    if let Some(delegate) = shared.delegate() {
        delegate.data_loaded();
    }
    // The delegate may have torn the engine down.
    if shared.state.borrow().generation == generation {
        activate(shared);
    }
}

fn activate(shared: &Rc<Shared>) {
    let store = shared.store.as_ref();
    let index = shared.source.index_path();
    let mut state = shared.state.borrow_mut();
    let generation = state.generation;

    if !state.subscriptions.contains_key(&EventKind::ChildAdded) {
        let weak = Rc::downgrade(shared);
        let handle = store.subscribe(
            &index,
            EventKind::ChildAdded,
            Box::new(move |snapshot| {
                if let Some(shared) = upgrade_live(&weak, generation) {
                    on_child_added(&shared, generation, snapshot);
                }
            }),
        );
        state.subscriptions.insert(EventKind::ChildAdded, handle);
    }

    if !state.subscriptions.contains_key(&EventKind::ChildRemoved) {
        let weak = Rc::downgrade(shared);
        let handle = store.subscribe(
            &index,
            EventKind::ChildRemoved,
            Box::new(move |snapshot| {
                if let Some(shared) = upgrade_live(&weak, generation) {
                    on_child_removed(&shared, snapshot);
                }
            }),
        );
        state.subscriptions.insert(EventKind::ChildRemoved, handle);
    }

    if !state.observers_active {
        info!(
            "event=observers_active module=sync source={} mirrors={}",
            shared.label(),
            state.mirrors.len()
        );
    }
    state.observers_active = true;
    let notifier = update_notifier(shared, generation);
    for mirror in state.mirrors.iter_mut() {
        mirror.activate(store, Rc::clone(&notifier));
    }
}

fn on_child_added(shared: &Rc<Shared>, generation: u64, snapshot: ChildSnapshot) {
    let key = EntityKey::new(snapshot.key);
    let held = {
        let mut state = shared.state.borrow_mut();
        // Re-added after a removal: the running fetch is valid again.
        state.removed_in_flight.remove(&key);
        state.contains(&key)
    };
    if held {
        debug!(
            "event=duplicate_suppressed module=sync source={} key={key}",
            shared.label()
        );
        return;
    }
    request_entity(shared, generation, key, Phase::Live);
}

fn on_child_removed(shared: &Rc<Shared>, snapshot: ChildSnapshot) {
    let key = EntityKey::new(snapshot.key);
    let removed = {
        let mut state = shared.state.borrow_mut();
        match state.position(&key) {
            Some(index) => {
                let mut mirror = state.mirrors.remove(index);
                mirror.deactivate(shared.store.as_ref());
                true
            }
            None => {
                if state.in_flight.contains_key(&key) {
                    state.removed_in_flight.insert(key.clone());
                }
                false
            }
        }
    };
    if !removed {
        debug!(
            "event=remove_ignored module=sync source={} key={key}",
            shared.label()
        );
        return;
    }
    if let Some(delegate) = shared.delegate() {
        delegate.entity_removed(&key);
    }
}
