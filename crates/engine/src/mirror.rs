use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use log::debug;
use sharedlist_core::{Entity, EntityKey, StorePath};
use sharedlist_storage::{EventKind, RemoteStore, SubscriptionHandle};

/// Shared, read-only view of a mirrored entity. Only the owning mirror's
/// field observer writes through it, so holders always see live values.
#[derive(Clone)]
pub struct EntityHandle(Rc<RefCell<Entity>>);

impl EntityHandle {
    pub(crate) fn new(entity: Entity) -> Self {
        Self(Rc::new(RefCell::new(entity)))
    }

    pub fn read(&self) -> Ref<'_, Entity> {
        self.0.borrow()
    }

    pub fn key(&self) -> EntityKey {
        self.0.borrow().key().clone()
    }

    pub fn ptr_eq(&self, other: &EntityHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn downgrade(&self) -> Weak<RefCell<Entity>> {
        Rc::downgrade(&self.0)
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(entity) => write!(f, "EntityHandle({:?})", entity.key()),
            Err(_) => f.write_str("EntityHandle(<patching>)"),
        }
    }
}

/// Called with the entity key after a field patch has been applied.
pub type UpdateNotifier = Rc<dyn Fn(&EntityKey)>;

/// Child-changed subscription on one entity's record node.
#[derive(Debug)]
pub struct FieldChangeObserver {
    path: StorePath,
    handle: Option<SubscriptionHandle>,
}

impl FieldChangeObserver {
    pub fn new(path: StorePath) -> Self {
        Self { path, handle: None }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Subscribe unless already subscribed. Each event patches the single
    /// changed field into `entity` and then calls `notifier`.
    pub fn activate(
        &mut self,
        store: &dyn RemoteStore,
        entity: &EntityHandle,
        notifier: UpdateNotifier,
    ) {
        if self.handle.is_some() {
            return;
        }
        let target = entity.downgrade();
        let handle = store.subscribe(
            &self.path,
            EventKind::ChildChanged,
            Box::new(move |snapshot| {
                let Some(entity) = target.upgrade() else {
                    return;
                };
                let key = {
                    let mut entity = entity.borrow_mut();
                    entity.apply_patch(&snapshot.key, snapshot.value);
                    entity.key().clone()
                };
                debug!(
                    "event=field_patched module=mirror key={key} field={}",
                    snapshot.key
                );
                notifier(&key);
            }),
        );
        self.handle = Some(handle);
    }

    pub fn deactivate(&mut self, store: &dyn RemoteStore) {
        if let Some(handle) = self.handle.take() {
            store.unsubscribe(handle);
        }
    }
}

/// One mirrored entity plus the observer that keeps it current.
#[derive(Debug)]
pub struct EntityMirror {
    key: EntityKey,
    entity: EntityHandle,
    observer: FieldChangeObserver,
}

impl EntityMirror {
    pub fn new(entity: Entity) -> Self {
        let key = entity.key().clone();
        let observer = FieldChangeObserver::new(entity.record_path());
        Self {
            key,
            entity: EntityHandle::new(entity),
            observer,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    pub fn is_active(&self) -> bool {
        self.observer.is_active()
    }

    pub fn activate(&mut self, store: &dyn RemoteStore, notifier: UpdateNotifier) {
        self.observer.activate(store, &self.entity, notifier);
    }

    pub fn deactivate(&mut self, store: &dyn RemoteStore) {
        self.observer.deactivate(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharedlist_core::record::fields;
    use sharedlist_core::{ItemRecord, UserId, Value, WriteBatch};
    use sharedlist_storage::MemoryStore;
    use std::cell::Cell;

    fn item_path() -> StorePath {
        StorePath::parse("itemCollections/c1/items").unwrap()
    }

    fn setup() -> (MemoryStore, EntityMirror) {
        let store = MemoryStore::new();
        let record = ItemRecord::new("Milk", UserId::new("u1")).encode("NONE");
        store.seed(&item_path().child("i1"), record.clone());
        let entity =
            Entity::decode_item(EntityKey::new("i1"), &record, "NONE", item_path()).unwrap();
        (store, EntityMirror::new(entity))
    }

    fn counter() -> (Rc<Cell<usize>>, UpdateNotifier) {
        let count = Rc::new(Cell::new(0));
        let sink = Rc::clone(&count);
        (count, Rc::new(move |_| sink.set(sink.get() + 1)))
    }

    fn set_field(store: &MemoryStore, field: &str, value: impl Into<Value>) {
        let mut batch = WriteBatch::new();
        batch.set(item_path().child("i1").child(field), value).unwrap();
        store.apply_external(batch);
    }

    #[test]
    fn activation_is_idempotent() {
        let (store, mut mirror) = setup();
        let (_, notifier) = counter();
        mirror.activate(&store, Rc::clone(&notifier));
        mirror.activate(&store, notifier);
        assert!(mirror.is_active());
        assert_eq!(store.subscription_count(), 1);

        mirror.deactivate(&store);
        mirror.deactivate(&store);
        assert!(!mirror.is_active());
        assert_eq!(store.subscription_count(), 0);
    }

    #[test]
    fn field_change_patches_in_place() {
        let (store, mut mirror) = setup();
        let (count, notifier) = counter();
        let held = mirror.entity().clone();
        mirror.activate(&store, notifier);

        set_field(&store, fields::DONE, true);
        store.run_until_idle();

        assert_eq!(count.get(), 1);
        assert!(held.read().done());
        assert_eq!(held.read().title(), Some("Milk"));
        assert_eq!(held.read().author(), Some("u1"));
    }

    #[test]
    fn inactive_mirror_ignores_changes() {
        let (store, mirror) = setup();
        set_field(&store, fields::TITLE, "Bread");
        store.run_until_idle();
        assert_eq!(mirror.entity().read().title(), Some("Milk"));
    }

    #[test]
    fn deactivation_drops_queued_events() {
        let (store, mut mirror) = setup();
        let (count, notifier) = counter();
        mirror.activate(&store, notifier);

        set_field(&store, fields::TITLE, "Bread");
        mirror.deactivate(&store);
        store.run_until_idle();

        assert_eq!(count.get(), 0);
        assert_eq!(mirror.entity().read().title(), Some("Milk"));
    }
}
