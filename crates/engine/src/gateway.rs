use std::rc::Rc;

use log::{debug, error};
use sharedlist_core::record::fields;
use sharedlist_core::{
    CollectionId, DoneBy, Entity, EntityKind, ItemId, ItemRecord, Layout, ListId, ListRecord,
    UserId, UserProfile, Value, WriteBatch,
};
use sharedlist_storage::RemoteStore;

use crate::error::EngineError;

/// Builds and submits the multi-path writes that keep the denormalized
/// indexes consistent.
///
/// Nothing here touches a local mirror: results show up only when the
/// matching events come back from the store. Write failures are logged and
/// abandoned, never retried or rolled back.
pub struct MutationGateway {
    store: Rc<dyn RemoteStore>,
    layout: Layout,
}

impl MutationGateway {
    pub fn new(store: Rc<dyn RemoteStore>, layout: Layout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Create a list owned by `owner`. One batch touches the owner's index
    /// entry, the list record and the items collection's back-pointer.
    pub fn create_list(&self, owner: &UserId, title: &str) -> Result<ListId, EngineError> {
        require_title(title)?;
        let list_id = ListId::new(self.store.allocate_key(&self.layout.lists()));
        let collection_id = CollectionId::new(self.store.allocate_key(&self.layout.collections()));
        let record = ListRecord::new(title, owner.clone(), collection_id.clone());

        let mut batch = WriteBatch::new();
        batch.set(self.layout.owner_list_entry(owner, &list_id), true)?;
        batch.set(self.layout.list_record(&list_id), record.encode())?;
        batch.set(
            self.layout.collection_list_pointer(&collection_id),
            list_id.as_str(),
        )?;
        submit(self.store.as_ref(), "create_list", batch);
        Ok(list_id)
    }

    /// Delete a list, its items and every user's index entry for it.
    ///
    /// Reads the access map first, then writes. Access granted between the
    /// read and the write leaves a dangling index entry for that user.
    pub fn remove_list(&self, list: &Entity) -> Result<(), EngineError> {
        require_kind(list, EntityKind::List)?;
        let list_id = ListId::new(list.key().as_str());
        let collection_id = list
            .items_collection_id()
            .ok_or_else(|| missing(list, fields::ITEMS_COLLECTION_ID))?;
        let owner = list.owner_id();

        let store = Rc::clone(&self.store);
        let layout = self.layout.clone();
        self.store.fetch_once(
            &self.layout.list_users(&list_id),
            Box::new(move |result| {
                let users = match result {
                    Ok(users) => users.map(|v| v.child_keys()).unwrap_or_default(),
                    Err(err) => {
                        error!("event=read_failed module=gateway op=remove_list list={list_id} error={err}");
                        return;
                    }
                };
                match removal_batch(&layout, &list_id, &collection_id, owner.as_ref(), users) {
                    Ok(batch) => submit(store.as_ref(), "remove_list", batch),
                    Err(err) => {
                        error!("event=batch_invalid module=gateway op=remove_list list={list_id} error={err}");
                    }
                }
            }),
        );
        Ok(())
    }

    /// Add an item to `list`, authored by `author`. One path, one write.
    pub fn add_item(
        &self,
        list: &Entity,
        title: &str,
        author: &UserId,
    ) -> Result<ItemId, EngineError> {
        require_kind(list, EntityKind::List)?;
        require_title(title)?;
        let collection_id = list
            .items_collection_id()
            .ok_or_else(|| missing(list, fields::ITEMS_COLLECTION_ID))?;
        let item_id = ItemId::new(
            self.store
                .allocate_key(&self.layout.collection_items(&collection_id)),
        );
        let record = ItemRecord::new(title, author.clone());

        let mut batch = WriteBatch::new();
        batch.set(
            self.layout.item_record(&collection_id, &item_id),
            record.encode(&self.layout.not_done_sentinel),
        )?;
        submit(self.store.as_ref(), "add_item", batch);
        Ok(item_id)
    }

    /// Flip an item's done flag and record who did it. Last writer wins.
    /// Returns the new flag value.
    pub fn toggle_done(&self, item: &Entity, current_user: &UserId) -> Result<bool, EngineError> {
        require_kind(item, EntityKind::Item)?;
        let done = !item.done();
        let done_by = if done {
            DoneBy::User(current_user.clone())
        } else {
            DoneBy::Nobody
        };

        let path = item.record_path();
        let mut batch = WriteBatch::new();
        batch.set(path.child(fields::DONE), done)?;
        batch.set(
            path.child(fields::DONE_BY),
            done_by.to_value(&self.layout.not_done_sentinel),
        )?;
        submit(self.store.as_ref(), "toggle_done", batch);
        Ok(done)
    }

    /// Grant `user` access to `list`: the access map entry and the user's
    /// index entry are written together. `display_name` is what item
    /// authors resolve to; without one the entry is `true`.
    pub fn share_list(
        &self,
        list: &Entity,
        user: &UserId,
        display_name: Option<&str>,
    ) -> Result<(), EngineError> {
        require_kind(list, EntityKind::List)?;
        let list_id = ListId::new(list.key().as_str());
        let entry = match display_name {
            Some(name) => Value::from(name),
            None => Value::Boolean(true),
        };

        let mut batch = WriteBatch::new();
        batch.set(self.layout.list_user(&list_id, user), entry)?;
        batch.set(self.layout.owner_list_entry(user, &list_id), true)?;
        submit(self.store.as_ref(), "share_list", batch);
        Ok(())
    }

    /// Store the profile written at registration.
    pub fn save_profile(&self, user: &UserId, profile: &UserProfile) -> Result<(), EngineError> {
        let mut batch = WriteBatch::new();
        batch.set(self.layout.profile(user), profile.encode())?;
        submit(self.store.as_ref(), "save_profile", batch);
        Ok(())
    }
}

fn removal_batch(
    layout: &Layout,
    list_id: &ListId,
    collection_id: &CollectionId,
    owner: Option<&UserId>,
    users: Vec<String>,
) -> Result<WriteBatch, EngineError> {
    let mut batch = WriteBatch::new();
    batch.delete(layout.list_record(list_id))?;
    batch.delete(layout.collection(collection_id))?;
    for user in users.into_iter().map(UserId::new).chain(owner.cloned()) {
        batch.delete(layout.owner_list_entry(&user, list_id))?;
    }
    Ok(batch)
}

fn submit(store: &dyn RemoteStore, operation: &'static str, batch: WriteBatch) {
    let paths = batch.len();
    debug!("event=write_submit module=gateway op={operation} paths={paths}");
    store.atomic_write(
        batch,
        Box::new(move |result| match result {
            Ok(()) => debug!("event=write_done module=gateway op={operation} status=ok"),
            Err(err) => error!("event=write_failed module=gateway op={operation} error={err}"),
        }),
    );
}

fn require_title(title: &str) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::EmptyTitle);
    }
    Ok(())
}

fn require_kind(entity: &Entity, expected: EntityKind) -> Result<(), EngineError> {
    if entity.kind() != expected {
        return Err(EngineError::WrongEntityKind {
            expected,
            found: entity.kind(),
        });
    }
    Ok(())
}

fn missing(entity: &Entity, field: &'static str) -> EngineError {
    EngineError::MissingField {
        key: entity.key().to_string(),
        field,
    }
}
