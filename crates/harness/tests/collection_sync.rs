use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;

use sharedlist_core::{Entity, EntityKey, ItemRecord, UserId, Value};
use sharedlist_engine::{CollectionSyncEngine, SyncDelegate};
use sharedlist_harness::{Notification, RecordingDelegate, TestNetwork};
use sharedlist_storage::{EventKind, PendingDelivery};

type TestResult = Result<(), Box<dyn Error>>;

fn list_entity(network: &TestNetwork, list: &str) -> Result<Entity, Box<dyn Error>> {
    let value = network
        .value_at(&format!("lists/{list}"))
        .ok_or("list not seeded")?;
    Ok(Entity::decode_list(
        EntityKey::new(list),
        &value,
        network.layout().lists(),
    )?)
}

/// List `l1` owned by `u1`, items collection `c1` holding `items`.
fn groceries(items: &[&str]) -> Result<(TestNetwork, Entity), Box<dyn Error>> {
    let network = TestNetwork::new();
    network.seed_list("u1", "l1", "Groceries", "c1");
    for item in items {
        network.seed_item("c1", item, &format!("title-{item}"), "u1");
    }
    let list = list_entity(&network, "l1")?;
    Ok((network, list))
}

fn items_engine(
    network: &TestNetwork,
    list: &Entity,
    delegate: &Rc<RecordingDelegate>,
) -> Result<CollectionSyncEngine, Box<dyn Error>> {
    let engine =
        CollectionSyncEngine::for_list_items(network.remote(), network.layout().clone(), list)?;
    engine.attach(delegate);
    Ok(engine)
}

fn keys(names: &[&str]) -> Vec<EntityKey> {
    names.iter().map(|n| EntityKey::new(*n)).collect()
}

// ============================================================================
// Bulk load
// ============================================================================

#[test]
fn bulk_load_signals_added_for_all_but_last() -> TestResult {
    let (network, list) = groceries(&["i1", "i2", "i3"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    assert!(engine.is_empty());
    network.run_until_idle();

    assert_eq!(
        delegate.notifications(),
        vec![
            Notification::Added(EntityKey::new("i1")),
            Notification::Added(EntityKey::new("i2")),
            Notification::DataLoaded,
        ]
    );
    assert_eq!(engine.keys(), keys(&["i1", "i2", "i3"]));
    assert!(engine.observers_active());
    assert!(!engine.is_loading());
    assert_eq!(engine.subscription_count(), 2);
    assert_eq!(engine.active_field_observers(), 3);
    Ok(())
}

#[test]
fn empty_collection_loads_immediately() -> TestResult {
    let (network, list) = groceries(&[])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    network.run_until_idle();

    assert_eq!(delegate.notifications(), vec![Notification::DataLoaded]);
    assert!(engine.is_empty());
    assert!(engine.observers_active());
    Ok(())
}

#[test]
fn data_loaded_fires_once_and_last_under_any_completion_order() -> TestResult {
    for seed in 0..24 {
        let (network, list) = groceries(&["a", "b", "c", "d", "e"])?;
        network.seed_access("l1", "u2", Some("Bob"));
        network.seed_item("c1", "f", "Eggs", "u2");
        let delegate = RecordingDelegate::new();
        let engine = items_engine(&network, &list, &delegate)?;

        engine.load_data();
        network.run_shuffled(seed);

        let log = delegate.notifications();
        assert_eq!(delegate.loaded_count(), 1, "seed {seed}: {log:?}");
        assert_eq!(log.last(), Some(&Notification::DataLoaded), "seed {seed}");
        assert_eq!(delegate.added_keys().len(), 5, "seed {seed}");
        assert_eq!(engine.len(), 6, "seed {seed}");
        assert!(engine.observers_active(), "seed {seed}");
    }
    Ok(())
}

#[test]
fn author_resolves_to_display_name_when_present() -> TestResult {
    let (network, list) = groceries(&["i1"])?;
    network.seed_access("l1", "u2", Some("Bob"));
    network.seed_item("c1", "i2", "Bread", "u2");
    network.seed_item("c1", "i3", "Jam", "ghost");
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    network.run_until_idle();

    let author = |key: &str| -> Option<String> {
        let handle = engine.find(&EntityKey::new(key))?;
        let entity = handle.read();
        entity.author().map(str::to_string)
    };
    // u1's access entry is `true`, so the raw id stays.
    assert_eq!(author("i1").as_deref(), Some("u1"));
    assert_eq!(author("i2").as_deref(), Some("Bob"));
    assert_eq!(author("i3").as_deref(), Some("ghost"));
    Ok(())
}

#[test]
fn malformed_records_are_dropped_without_blocking_the_load() -> TestResult {
    let (network, list) = groceries(&["i1"])?;
    network.seed_raw("itemCollections/c1/items/bad/title", "no done flag");
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    network.run_until_idle();

    assert_eq!(delegate.notifications(), vec![Notification::DataLoaded]);
    assert_eq!(engine.keys(), keys(&["i1"]));

    // Removing an entity that was never mirrored changes nothing.
    network.external_write(vec![("itemCollections/c1/items/bad", Value::Null)]);
    network.run_until_idle();
    assert_eq!(delegate.notifications(), vec![Notification::DataLoaded]);
    assert_eq!(engine.keys(), keys(&["i1"]));
    Ok(())
}

#[test]
fn failed_entity_fetch_still_completes_the_load() -> TestResult {
    let (network, list) = groceries(&["i1", "i2", "i3"])?;
    network
        .store()
        .fail_fetches_under(&network.path("itemCollections/c1/items/i2"), "timeout");
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    network.run_until_idle();

    assert_eq!(delegate.loaded_count(), 1);
    assert_eq!(engine.keys(), keys(&["i1", "i3"]));
    Ok(())
}

#[test]
fn failed_index_fetch_reports_load_failure() -> TestResult {
    let (network, list) = groceries(&["i1"])?;
    network
        .store()
        .fail_fetches_under(&network.path("itemCollections/c1"), "offline");
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    network.run_until_idle();

    let log = delegate.notifications();
    assert_eq!(log.len(), 1);
    assert!(matches!(&log[0], Notification::LoadFailed(msg) if msg.contains("offline")));
    assert!(engine.is_empty());
    assert_eq!(engine.subscription_count(), 0);
    Ok(())
}

#[test]
fn repeated_load_data_signals_data_loaded_once() -> TestResult {
    let (network, list) = groceries(&["i1", "i2", "i3"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    engine.load_data();
    network.run_until_idle();

    assert_eq!(delegate.loaded_count(), 1);
    assert_eq!(engine.keys(), keys(&["i1", "i2", "i3"]));
    Ok(())
}

// ============================================================================
// Live mode
// ============================================================================

#[test]
fn activation_is_idempotent() -> TestResult {
    let (network, list) = groceries(&["i1", "i2"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;
    engine.load_data();
    network.run_until_idle();

    let before = network.store().subscription_count();
    engine.activate_observers();
    engine.activate_observers();
    network.run_until_idle();

    assert_eq!(network.store().subscription_count(), before);
    let index = network.path("itemCollections/c1/items");
    assert_eq!(network.store().subscriptions_at(&index, EventKind::ChildAdded), 1);
    assert_eq!(network.store().subscriptions_at(&index, EventKind::ChildRemoved), 1);
    assert_eq!(engine.active_field_observers(), 2);
    assert_eq!(delegate.loaded_count(), 1);
    Ok(())
}

#[test]
fn early_activation_never_duplicates_entities() -> TestResult {
    let (network, list) = groceries(&["i1", "i2", "i3"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    // Child-added replays race the bulk load for every key.
    engine.load_data();
    engine.activate_observers();
    network.run_until_idle();

    assert_eq!(engine.keys(), keys(&["i1", "i2", "i3"]));
    assert_eq!(delegate.loaded_count(), 1);
    let added = delegate.added_keys();
    for key in keys(&["i1", "i2", "i3"]) {
        assert!(added.iter().filter(|k| **k == key).count() <= 1, "{key} added twice");
    }
    assert_eq!(engine.active_field_observers(), 3);
    Ok(())
}

#[test]
fn live_add_remove_and_field_change() -> TestResult {
    let (network, list) = groceries(&["i1", "i2"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;
    engine.load_data();
    network.run_until_idle();
    delegate.take();

    let held = engine.find(&EntityKey::new("i1")).ok_or("i1 missing")?;

    // Another client adds an item.
    let record = ItemRecord::new("Butter", UserId::new("u1")).encode("NONE");
    network.external_write(vec![("itemCollections/c1/items/i3", record)]);
    network.run_until_idle();
    assert_eq!(
        delegate.take(),
        vec![Notification::Added(EntityKey::new("i3"))]
    );
    assert_eq!(engine.keys(), keys(&["i1", "i2", "i3"]));
    assert_eq!(engine.active_field_observers(), 3);

    // A field change patches the held entity in place.
    network.external_write(vec![(
        "itemCollections/c1/items/i1/title",
        Value::from("Oat milk"),
    )]);
    network.run_until_idle();
    assert_eq!(
        delegate.take(),
        vec![Notification::Updated(EntityKey::new("i1"))]
    );
    assert_eq!(held.read().title(), Some("Oat milk"));
    let current = engine.find(&EntityKey::new("i1")).ok_or("i1 missing")?;
    assert!(current.ptr_eq(&held));

    // Removal drops the mirror and its field observer.
    let subscriptions = network.store().subscription_count();
    network.external_write(vec![("itemCollections/c1/items/i2", Value::Null)]);
    network.run_until_idle();
    assert_eq!(
        delegate.take(),
        vec![Notification::Removed(EntityKey::new("i2"))]
    );
    assert_eq!(engine.keys(), keys(&["i1", "i3"]));
    assert_eq!(network.store().subscription_count(), subscriptions - 1);
    Ok(())
}

fn position_of_removal(network: &TestNetwork, key: &str) -> Option<usize> {
    network.store().pending().iter().position(|d| {
        matches!(d, PendingDelivery::Event { kind: EventKind::ChildRemoved, key: k, .. } if k == key)
    })
}

#[test]
fn item_removed_during_author_lookup_is_never_mirrored() -> TestResult {
    let (network, list) = groceries(&["i1"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;
    engine.load_data();
    network.run_until_idle();
    delegate.take();

    let record = ItemRecord::new("Butter", UserId::new("u1")).encode("NONE");
    network.external_write(vec![("itemCollections/c1/items/i2", record)]);
    // Child-added, then the record fetch; the author lookup is now queued.
    network.store().deliver_next();
    network.store().deliver_next();
    network.external_write(vec![("itemCollections/c1/items/i2", Value::Null)]);

    let pending = network.store().pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(
        pending[0],
        PendingDelivery::Fetch {
            path: network.path("lists/l1/users/u1")
        }
    );
    let removal = position_of_removal(&network, "i2").ok_or("no removal queued")?;
    assert_eq!(removal, 1);

    network.store().deliver_at(removal);
    network.run_until_idle();

    assert_eq!(network.value_at("itemCollections/c1/items/i2"), None);
    assert_eq!(engine.keys(), keys(&["i1"]));
    assert!(delegate.notifications().is_empty());
    assert_eq!(engine.active_field_observers(), 1);
    Ok(())
}

#[test]
fn item_removed_during_bulk_load_still_completes_the_load() -> TestResult {
    let (network, list) = groceries(&["i1", "i2"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    // Index, then both record fetches; both author lookups are queued.
    for _ in 0..3 {
        network.store().deliver_next();
    }
    assert!(engine.is_loading());
    engine.activate_observers();
    network.external_write(vec![("itemCollections/c1/items/i2", Value::Null)]);

    let removal = position_of_removal(&network, "i2").ok_or("no removal queued")?;
    network.store().deliver_at(removal);
    network.run_until_idle();

    assert_eq!(
        delegate.notifications(),
        vec![
            Notification::Added(EntityKey::new("i1")),
            Notification::DataLoaded,
        ]
    );
    assert_eq!(engine.keys(), keys(&["i1"]));
    assert!(!engine.is_loading());
    Ok(())
}

#[test]
fn item_re_added_during_its_fetch_is_kept() -> TestResult {
    let (network, list) = groceries(&["i1"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;
    engine.load_data();
    network.run_until_idle();
    delegate.take();

    let record = ItemRecord::new("Butter", UserId::new("u1")).encode("NONE");
    network.external_write(vec![("itemCollections/c1/items/i2", record.clone())]);
    network.store().deliver_next();
    network.store().deliver_next();
    network.external_write(vec![("itemCollections/c1/items/i2", Value::Null)]);
    network.external_write(vec![("itemCollections/c1/items/i2", record)]);
    // Removal and re-add both land before the author lookup.
    network.store().deliver_at(1);
    network.store().deliver_at(1);
    network.run_until_idle();

    assert_eq!(engine.keys(), keys(&["i1", "i2"]));
    assert_eq!(delegate.added_keys(), keys(&["i2"]));
    Ok(())
}

// ============================================================================
// Cleanup
// ============================================================================

#[test]
fn callbacks_after_cleanup_are_ignored() -> TestResult {
    let (network, list) = groceries(&["i1", "i2"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;

    engine.load_data();
    // Index arrives, entity fetches are still in flight.
    network.store().deliver_next();
    assert!(engine.is_loading());
    engine.cleanup();
    network.run_until_idle();

    assert!(delegate.notifications().is_empty());
    assert!(engine.is_empty());
    assert!(!engine.observers_active());
    assert_eq!(network.store().subscription_count(), 0);
    Ok(())
}

#[test]
fn cleanup_stops_live_delivery_and_engine_can_reload() -> TestResult {
    let (network, list) = groceries(&["i1", "i2"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;
    engine.load_data();
    network.run_until_idle();
    delegate.take();

    network.external_write(vec![(
        "itemCollections/c1/items/i1/title",
        Value::from("queued before cleanup"),
    )]);
    engine.cleanup();
    network.run_until_idle();
    assert!(delegate.notifications().is_empty());
    assert_eq!(network.store().subscription_count(), 0);

    engine.attach(&delegate);
    engine.load_data();
    network.run_until_idle();
    assert_eq!(delegate.loaded_count(), 1);
    assert_eq!(engine.keys(), keys(&["i1", "i2"]));
    let handle = engine.find(&EntityKey::new("i1")).ok_or("i1 missing")?;
    assert_eq!(handle.read().title(), Some("queued before cleanup"));
    Ok(())
}

struct TearDownOnLoad {
    engine: RefCell<Option<Rc<CollectionSyncEngine>>>,
    loaded: RefCell<usize>,
}

impl SyncDelegate for TearDownOnLoad {
    fn data_loaded(&self) {
        *self.loaded.borrow_mut() += 1;
        if let Some(engine) = self.engine.borrow().as_ref() {
            engine.cleanup();
        }
    }
}

#[test]
fn delegate_may_clean_up_from_data_loaded() -> TestResult {
    let (network, list) = groceries(&["i1"])?;
    let engine = Rc::new(CollectionSyncEngine::for_list_items(
        network.remote(),
        network.layout().clone(),
        &list,
    )?);
    let delegate = Rc::new(TearDownOnLoad {
        engine: RefCell::new(Some(Rc::clone(&engine))),
        loaded: RefCell::new(0),
    });
    engine.attach(&delegate);

    engine.load_data();
    network.run_until_idle();

    assert_eq!(*delegate.loaded.borrow(), 1);
    assert!(!engine.observers_active());
    assert_eq!(network.store().subscription_count(), 0);
    delegate.engine.borrow_mut().take();
    Ok(())
}

#[test]
fn dropping_the_engine_unsubscribes() -> TestResult {
    let (network, list) = groceries(&["i1", "i2"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;
    engine.load_data();
    network.run_until_idle();
    assert!(network.store().subscription_count() > 0);

    drop(engine);
    network.run_until_idle();
    assert_eq!(network.store().subscription_count(), 0);
    Ok(())
}

#[test]
fn dropped_delegate_is_never_called() -> TestResult {
    let (network, list) = groceries(&["i1", "i2"])?;
    let delegate = RecordingDelegate::new();
    let engine = items_engine(&network, &list, &delegate)?;
    drop(delegate);

    engine.load_data();
    network.run_until_idle();
    assert_eq!(engine.len(), 2);
    Ok(())
}
