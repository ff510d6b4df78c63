use log::warn;
use sharedlist_core::record::fields;
use sharedlist_core::{
    CollectionId, Entity, EntityKey, EntityKind, Layout, ListId, StorePath, UserId, Value,
};
use sharedlist_storage::RemoteStore;

use crate::error::EngineError;

pub type MaterializeCallback = Box<dyn FnOnce(Result<Entity, EngineError>)>;

/// Where a synced collection lives and how its records become entities.
pub trait CollectionSource {
    /// Short label for log lines.
    fn label(&self) -> &'static str;

    /// Node whose direct children are the collection's entity keys.
    fn index_path(&self) -> StorePath;

    /// Full record of one entity.
    fn record_path(&self, key: &EntityKey) -> StorePath;

    /// Decode a fetched record, running any secondary lookups first.
    /// `done` may be called synchronously or from a later store delivery.
    fn materialize(
        &self,
        store: &dyn RemoteStore,
        key: EntityKey,
        record: Value,
        done: MaterializeCallback,
    );
}

/// The lists a user has access to: `owners/{user}/lists` indexes `lists/{id}`.
#[derive(Debug, Clone)]
pub struct UserLists {
    layout: Layout,
    owner: UserId,
}

impl UserLists {
    pub fn new(layout: Layout, owner: UserId) -> Self {
        Self { layout, owner }
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }
}

impl CollectionSource for UserLists {
    fn label(&self) -> &'static str {
        "lists"
    }

    fn index_path(&self) -> StorePath {
        self.layout.owner_lists(&self.owner)
    }

    fn record_path(&self, key: &EntityKey) -> StorePath {
        self.layout.lists().child(key.as_str())
    }

    fn materialize(
        &self,
        _store: &dyn RemoteStore,
        key: EntityKey,
        record: Value,
        done: MaterializeCallback,
    ) {
        done(Entity::decode_list(key, &record, self.layout.lists()).map_err(EngineError::from));
    }
}

/// The items of one list. Each item's author id is swapped for the display
/// value found in the list's access map, once, when the item is loaded.
#[derive(Debug, Clone)]
pub struct ListItems {
    layout: Layout,
    list_id: ListId,
    collection: CollectionId,
}

impl ListItems {
    pub fn new(layout: Layout, list_id: ListId, collection: CollectionId) -> Self {
        Self {
            layout,
            list_id,
            collection,
        }
    }

    /// Build the source for a mirrored list entity.
    pub fn for_list(layout: Layout, list: &Entity) -> Result<Self, EngineError> {
        if list.kind() != EntityKind::List {
            return Err(EngineError::WrongEntityKind {
                expected: EntityKind::List,
                found: list.kind(),
            });
        }
        let collection = list
            .items_collection_id()
            .ok_or_else(|| EngineError::MissingField {
                key: list.key().to_string(),
                field: fields::ITEMS_COLLECTION_ID,
            })?;
        Ok(Self::new(layout, ListId::new(list.key().as_str()), collection))
    }

    pub fn list_id(&self) -> &ListId {
        &self.list_id
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }
}

impl CollectionSource for ListItems {
    fn label(&self) -> &'static str {
        "items"
    }

    fn index_path(&self) -> StorePath {
        self.layout.collection_items(&self.collection)
    }

    fn record_path(&self, key: &EntityKey) -> StorePath {
        self.index_path().child(key.as_str())
    }

    fn materialize(
        &self,
        store: &dyn RemoteStore,
        key: EntityKey,
        record: Value,
        done: MaterializeCallback,
    ) {
        let entity = match Entity::decode_item(
            key,
            &record,
            &self.layout.not_done_sentinel,
            self.index_path(),
        ) {
            Ok(entity) => entity,
            Err(err) => return done(Err(err.into())),
        };
        let Some(author) = entity.author().map(UserId::new) else {
            return done(Ok(entity));
        };

        let lookup = self.layout.list_user(&self.list_id, &author);
        let mut entity = entity;
        store.fetch_once(
            &lookup,
            Box::new(move |result| {
                match result {
                    Ok(Some(Value::Text(display))) => {
                        entity.apply_patch(fields::AUTHOR, Value::Text(display));
                    }
                    // `true` or no entry: keep the raw author id.
                    Ok(_) => {}
                    Err(err) => warn!(
                        "event=author_lookup_failed module=sync key={} author={author} error={err}",
                        entity.key()
                    ),
                }
                done(Ok(entity));
            }),
        );
    }
}
