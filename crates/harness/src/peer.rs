use std::cell::RefCell;
use std::rc::{Rc, Weak};

use sharedlist_core::{EntityKey, UserId};
use sharedlist_engine::{
    CollectionSyncEngine, EngineError, EntityHandle, Session, SyncConfig, SyncDelegate,
};

use crate::TestNetwork;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DataLoaded,
    Added(EntityKey),
    Removed(EntityKey),
    Updated(EntityKey),
    LoadFailed(String),
}

/// Delegate that records every notification in order.
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    log: RefCell<Vec<Notification>>,
}

impl RecordingDelegate {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn weak(self: &Rc<Self>) -> Weak<dyn SyncDelegate> {
        let weak: Weak<dyn SyncDelegate> = Rc::downgrade(self) as Weak<Self>;
        weak
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.log.borrow().clone()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.log.borrow_mut())
    }

    pub fn count(&self, matches: impl Fn(&Notification) -> bool) -> usize {
        self.log.borrow().iter().filter(|n| matches(n)).count()
    }

    pub fn loaded_count(&self) -> usize {
        self.count(|n| *n == Notification::DataLoaded)
    }

    pub fn added_keys(&self) -> Vec<EntityKey> {
        self.log
            .borrow()
            .iter()
            .filter_map(|n| match n {
                Notification::Added(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, notification: Notification) {
        self.log.borrow_mut().push(notification);
    }
}

impl SyncDelegate for RecordingDelegate {
    fn data_loaded(&self) {
        self.push(Notification::DataLoaded);
    }

    fn entity_added(&self, entity: &EntityHandle) {
        self.push(Notification::Added(entity.key()));
    }

    fn entity_removed(&self, key: &EntityKey) {
        self.push(Notification::Removed(key.clone()));
    }

    fn entity_updated(&self, key: &EntityKey) {
        self.push(Notification::Updated(key.clone()));
    }

    fn load_failed(&self, error: &EngineError) {
        self.push(Notification::LoadFailed(error.to_string()));
    }
}

/// One signed-in client: a session plus recorders for its list and item
/// engines.
pub struct TestPeer {
    pub user: UserId,
    pub session: Session,
    pub lists: Rc<RecordingDelegate>,
    pub items: Rc<RecordingDelegate>,
}

impl TestPeer {
    /// Sign `user` in against `network`. Deliveries are left queued.
    pub fn sign_in(network: &TestNetwork, user: &str) -> Self {
        let config = SyncConfig {
            layout: network.layout().clone(),
            ..SyncConfig::default()
        };
        let mut session = Session::new(network.remote(), config);
        let lists = RecordingDelegate::new();
        session.set_lists_delegate(lists.weak());
        let user = UserId::new(user);
        session.on_auth_state_changed(Some(user.clone()));
        Self {
            user,
            session,
            lists,
            items: RecordingDelegate::new(),
        }
    }

    pub fn lists_engine(&self) -> Result<&CollectionSyncEngine, EngineError> {
        self.session.lists().ok_or(EngineError::NotSignedIn)
    }

    pub fn items_engine(&self) -> Result<&CollectionSyncEngine, EngineError> {
        self.session.items().ok_or(EngineError::NoOpenList)
    }

    /// Open the list with key `list` from this peer's list mirror.
    pub fn open_list(&mut self, list: &str) -> Result<(), Box<dyn std::error::Error>> {
        let handle = self
            .lists_engine()?
            .find(&EntityKey::new(list))
            .ok_or_else(|| format!("list {list} is not mirrored by {}", self.user))?;
        let entity = handle.read().clone();
        let delegate = self.items.weak();
        self.session.open_list(&entity, delegate)?;
        Ok(())
    }

    pub fn list_titles(&self) -> Vec<String> {
        titles(self.session.lists())
    }

    pub fn item_titles(&self) -> Vec<String> {
        titles(self.session.items())
    }
}

fn titles(engine: Option<&CollectionSyncEngine>) -> Vec<String> {
    let Some(engine) = engine else {
        return Vec::new();
    };
    (0..engine.len())
        .filter_map(|i| engine.entity(i))
        .filter_map(|h| h.read().title().map(str::to_string))
        .collect()
}
