use std::rc::{Rc, Weak};

use log::{info, warn};
use sharedlist_core::{Entity, EntityKey, ItemId, ListId, UserId, UserProfile, Value};
use sharedlist_storage::RemoteStore;

use crate::config::SyncConfig;
use crate::error::EngineError;
use crate::gateway::MutationGateway;
use crate::mirror::EntityHandle;
use crate::sync::{CollectionSyncEngine, SyncDelegate};

pub type ProfileCallback = Box<dyn FnOnce(Result<Option<UserProfile>, EngineError>)>;
pub type ListCallback = Box<dyn FnOnce(Result<Option<Entity>, EngineError>)>;

struct OpenList {
    list: Entity,
    items: CollectionSyncEngine,
}

/// Owns the engines of one signed-in user: the list collection, and the
/// items of at most one open list.
///
/// Signing out (or in as someone else) cleans every engine up before any
/// new one starts.
pub struct Session {
    store: Rc<dyn RemoteStore>,
    config: SyncConfig,
    gateway: MutationGateway,
    user: Option<UserId>,
    lists: Option<CollectionSyncEngine>,
    open: Option<OpenList>,
    lists_delegate: Option<Weak<dyn SyncDelegate>>,
}

impl Session {
    pub fn new(store: Rc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let gateway = MutationGateway::new(Rc::clone(&store), config.layout.clone());
        Self {
            store,
            config,
            gateway,
            user: None,
            lists: None,
            open: None,
            lists_delegate: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    pub fn current_user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Delegate for the list collection. Applies to the running engine and
    /// to every engine started by later sign-ins.
    pub fn set_lists_delegate(&mut self, delegate: Weak<dyn SyncDelegate>) {
        if let Some(lists) = &self.lists {
            lists.set_delegate(delegate.clone());
        }
        self.lists_delegate = Some(delegate);
    }

    /// React to the authentication state. The same user again is a no-op.
    pub fn on_auth_state_changed(&mut self, user: Option<UserId>) {
        if self.user == user {
            return;
        }
        self.teardown();

        let Some(user) = user else {
            info!("event=signed_out module=session");
            return;
        };
        info!("event=signed_in module=session user={user}");
        let lists = CollectionSyncEngine::for_user_lists(
            Rc::clone(&self.store),
            self.config.layout.clone(),
            user.clone(),
        );
        if let Some(delegate) = &self.lists_delegate {
            lists.set_delegate(delegate.clone());
        }
        lists.load_data();
        self.lists = Some(lists);
        self.user = Some(user);
    }

    fn teardown(&mut self) {
        if let Some(open) = self.open.take() {
            open.items.cleanup();
        }
        if let Some(lists) = self.lists.take() {
            lists.cleanup();
        }
        self.user = None;
    }

    pub fn lists(&self) -> Option<&CollectionSyncEngine> {
        self.lists.as_ref()
    }

    pub fn items(&self) -> Option<&CollectionSyncEngine> {
        self.open.as_ref().map(|open| &open.items)
    }

    pub fn open_list_entity(&self) -> Option<&Entity> {
        self.open.as_ref().map(|open| &open.list)
    }

    /// Start syncing the items of `list`, closing any list already open.
    pub fn open_list(
        &mut self,
        list: &Entity,
        delegate: Weak<dyn SyncDelegate>,
    ) -> Result<(), EngineError> {
        if self.user.is_none() {
            return Err(EngineError::NotSignedIn);
        }
        let items = CollectionSyncEngine::for_list_items(
            Rc::clone(&self.store),
            self.config.layout.clone(),
            list,
        )?;
        self.close_list();
        items.set_delegate(delegate);
        items.load_data();
        info!("event=list_opened module=session list={}", list.key());
        self.open = Some(OpenList {
            list: list.clone(),
            items,
        });
        Ok(())
    }

    pub fn close_list(&mut self) {
        if let Some(open) = self.open.take() {
            open.items.cleanup();
            info!("event=list_closed module=session list={}", open.list.key());
        }
    }

    // ========================================================================
    // Intents
    // ========================================================================

    pub fn create_list(&self, title: &str) -> Result<ListId, EngineError> {
        let user = self.user.as_ref().ok_or(EngineError::NotSignedIn)?;
        self.gateway.create_list(user, title)
    }

    /// Remove the list at `index` of the list collection.
    pub fn remove_list(&self, index: usize) -> Result<(), EngineError> {
        let lists = self.lists.as_ref().ok_or(EngineError::NotSignedIn)?;
        let list = lists
            .entity(index)
            .ok_or(EngineError::IndexOutOfRange(index))?;
        let list = list.read().clone();
        self.gateway.remove_list(&list)
    }

    pub fn add_item(&self, title: &str) -> Result<ItemId, EngineError> {
        let user = self.user.as_ref().ok_or(EngineError::NotSignedIn)?;
        let open = self.open.as_ref().ok_or(EngineError::NoOpenList)?;
        self.gateway.add_item(&open.list, title, user)
    }

    /// Toggle the item at `index` of the open list.
    pub fn toggle_done(&self, index: usize) -> Result<bool, EngineError> {
        let user = self.user.as_ref().ok_or(EngineError::NotSignedIn)?;
        let item = self.open_item(index)?;
        let item = item.read().clone();
        self.gateway.toggle_done(&item, user)
    }

    fn open_item(&self, index: usize) -> Result<EntityHandle, EngineError> {
        let open = self.open.as_ref().ok_or(EngineError::NoOpenList)?;
        open.items
            .entity(index)
            .ok_or(EngineError::IndexOutOfRange(index))
    }

    // ========================================================================
    // One-shot reads
    // ========================================================================

    /// Read a user's profile once. An absent profile is `Ok(None)`.
    pub fn fetch_profile(&self, user: &UserId, done: ProfileCallback) {
        let path = self.config.layout.profile(user);
        let user = user.clone();
        self.store.fetch_once(
            &path,
            Box::new(move |result| {
                let profile = match result {
                    Ok(Some(value)) => UserProfile::decode(&value).map(Some).map_err(|err| {
                        warn!("event=profile_malformed module=session user={user} error={err}");
                        EngineError::from(err)
                    }),
                    Ok(None) => Ok(None),
                    Err(err) => Err(err.into()),
                };
                done(profile);
            }),
        );
    }

    /// Read one list record once, outside any sync engine.
    pub fn fetch_list(&self, list_id: &ListId, done: ListCallback) {
        let layout = &self.config.layout;
        let path = layout.list_record(list_id);
        let collection = layout.lists();
        let key = EntityKey::from(list_id);
        self.store.fetch_once(
            &path,
            Box::new(move |result| {
                let list = match result {
                    Ok(Some(value)) => decode_list(key, &value, collection),
                    Ok(None) => Ok(None),
                    Err(err) => Err(err.into()),
                };
                done(list);
            }),
        );
    }
}

fn decode_list(
    key: EntityKey,
    value: &Value,
    collection: sharedlist_core::StorePath,
) -> Result<Option<Entity>, EngineError> {
    Ok(Some(Entity::decode_list(key, value, collection)?))
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
