use std::collections::BTreeMap;

use crate::error::DecodeError;
use crate::ids::{CollectionId, EntityKey, UserId};
use crate::path::StorePath;
use crate::record::{fields, require_map, DoneBy, ItemRecord, ListRecord};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    List,
    Item,
}

/// Local copy of one remote record. Fields are patched in place as
/// field-level change events arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    key: EntityKey,
    kind: EntityKind,
    fields: BTreeMap<String, Value>,
    /// Parent node of the record (`lists`, or `itemCollections/{c}/items`).
    collection: StorePath,
}

impl Entity {
    /// Validate `value` as a list record and keep its fields.
    pub fn decode_list(
        key: EntityKey,
        value: &Value,
        collection: StorePath,
    ) -> Result<Self, DecodeError> {
        ListRecord::decode(value)?;
        Ok(Self {
            key,
            kind: EntityKind::List,
            fields: require_map(value)?.clone(),
            collection,
        })
    }

    /// Validate `value` as an item record and keep its fields.
    pub fn decode_item(
        key: EntityKey,
        value: &Value,
        sentinel: &str,
        collection: StorePath,
    ) -> Result<Self, DecodeError> {
        ItemRecord::decode(value, sentinel)?;
        Ok(Self {
            key,
            kind: EntityKind::Item,
            fields: require_map(value)?.clone(),
            collection,
        })
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn collection(&self) -> &StorePath {
        &self.collection
    }

    pub fn record_path(&self) -> StorePath {
        self.collection.child(self.key.as_str())
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Apply a single-field patch. A null value removes the field.
    pub fn apply_patch(&mut self, name: &str, value: Value) {
        if value.is_null() {
            self.fields.remove(name);
        } else {
            self.fields.insert(name.to_string(), value);
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.field(fields::TITLE).and_then(Value::as_text)
    }

    pub fn done(&self) -> bool {
        self.field(fields::DONE)
            .and_then(Value::as_boolean)
            .unwrap_or(false)
    }

    pub fn done_by(&self, sentinel: &str) -> DoneBy {
        self.field(fields::DONE_BY)
            .and_then(Value::as_text)
            .map(|s| DoneBy::from_text(s, sentinel))
            .unwrap_or(DoneBy::Nobody)
    }

    /// Author display value for items (resolved at load time).
    pub fn author(&self) -> Option<&str> {
        self.field(fields::AUTHOR).and_then(Value::as_text)
    }

    pub fn owner_id(&self) -> Option<UserId> {
        self.field(fields::OWNER_ID)
            .and_then(Value::as_text)
            .map(UserId::new)
    }

    pub fn items_collection_id(&self) -> Option<CollectionId> {
        self.field(fields::ITEMS_COLLECTION_ID)
            .and_then(Value::as_text)
            .map(CollectionId::new)
    }

    /// Re-validate the current fields as a list record.
    pub fn to_list_record(&self) -> Result<ListRecord, DecodeError> {
        ListRecord::decode(&Value::Map(self.fields.clone()))
    }
}
