use std::rc::Rc;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sharedlist_core::{
    CollectionId, ItemRecord, Layout, ListId, ListRecord, StorePath, UserId, UserProfile, Value,
    WriteBatch,
};
use sharedlist_storage::{MemoryStore, PendingDelivery, RemoteStore, StoreError};

const MAX_SHUFFLED_DELIVERIES: usize = 100_000;

/// The backend every peer talks to, with fixtures that build records the
/// same way the mutation gateway does.
pub struct TestNetwork {
    store: Rc<MemoryStore>,
    layout: Layout,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            store: Rc::new(MemoryStore::new()),
            layout: Layout::default(),
        }
    }

    /// A fresh backend holding the tree exported by [`snapshot`](Self::snapshot).
    /// Lets one expensive fixture seed many independent networks.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(Self {
            store: Rc::new(MemoryStore::from_snapshot(bytes)?),
            layout: Layout::default(),
        })
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &Rc<MemoryStore> {
        &self.store
    }

    pub fn remote(&self) -> Rc<dyn RemoteStore> {
        self.store.clone()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    // ========================================================================
    // Fixtures (no events)
    // ========================================================================

    /// A list owned by `owner` with an empty items collection.
    pub fn seed_list(&self, owner: &str, list: &str, title: &str, collection: &str) {
        let owner = UserId::new(owner);
        let list = ListId::new(list);
        let collection = CollectionId::new(collection);
        let record = ListRecord::new(title, owner.clone(), collection.clone());
        self.store.seed(&self.layout.list_record(&list), record.encode());
        self.store
            .seed(&self.layout.owner_list_entry(&owner, &list), true);
        self.store.seed(
            &self.layout.collection_list_pointer(&collection),
            list.as_str(),
        );
    }

    /// Give `user` access to `list`, with an optional display name.
    pub fn seed_access(&self, list: &str, user: &str, display_name: Option<&str>) {
        let list = ListId::new(list);
        let user = UserId::new(user);
        let entry = display_name.map(Value::from).unwrap_or(Value::Boolean(true));
        self.store.seed(&self.layout.list_user(&list, &user), entry);
        self.store
            .seed(&self.layout.owner_list_entry(&user, &list), true);
    }

    pub fn seed_item(&self, collection: &str, item: &str, title: &str, author: &str) {
        let path = self.item_path(collection, item);
        let record = ItemRecord::new(title, UserId::new(author));
        self.store
            .seed(&path, record.encode(&self.layout.not_done_sentinel));
    }

    pub fn seed_profile(&self, user: &str, name: &str, email: &str) {
        let profile = UserProfile {
            name: name.to_string(),
            email: email.to_string(),
        };
        self.store
            .seed(&self.layout.profile(&UserId::new(user)), profile.encode());
    }

    pub fn seed_raw(&self, path: &str, value: impl Into<Value>) {
        self.store.seed(&self.path(path), value);
    }

    pub fn item_path(&self, collection: &str, item: &str) -> StorePath {
        self.layout
            .collection_items(&CollectionId::new(collection))
            .child(item)
    }

    pub fn path(&self, path: &str) -> StorePath {
        match StorePath::parse(path) {
            Ok(path) => path,
            Err(err) => panic!("bad fixture path `{path}`: {err}"),
        }
    }

    // ========================================================================
    // Writes by clients outside the test
    // ========================================================================

    /// Apply `(path, value)` pairs as one external write; `Value::Null`
    /// deletes.
    pub fn external_write(&self, updates: Vec<(&str, Value)>) {
        let mut batch = WriteBatch::new();
        for (path, value) in updates {
            if let Err(err) = batch.set(self.path(path), value) {
                panic!("bad external write at `{path}`: {err}");
            }
        }
        self.store.apply_external(batch);
    }

    pub fn value_at(&self, path: &str) -> Option<Value> {
        self.store.value_at(&self.path(path))
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    pub fn run_until_idle(&self) -> usize {
        self.store.run_until_idle()
    }

    /// Drain the queue, completing fetches in a random order picked from
    /// `seed`. Events and writes keep their relative order.
    pub fn run_shuffled(&self, seed: u64) -> usize {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut delivered = 0;
        while delivered < MAX_SHUFFLED_DELIVERIES {
            let pending = self.store.pending();
            let mut candidates: Vec<usize> = pending
                .iter()
                .enumerate()
                .filter(|(_, d)| matches!(d, PendingDelivery::Fetch { .. }))
                .map(|(i, _)| i)
                .collect();
            if let Some(first_ordered) = pending
                .iter()
                .position(|d| !matches!(d, PendingDelivery::Fetch { .. }))
            {
                candidates.push(first_ordered);
            }
            if candidates.is_empty() {
                break;
            }
            let index = candidates[rng.gen_range(0..candidates.len())];
            debug!("event=deliver module=harness index={index} pending={}", pending.len());
            self.store.deliver_at(index);
            delivered += 1;
        }
        delivered
    }
}
