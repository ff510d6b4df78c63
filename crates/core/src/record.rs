use std::collections::BTreeMap;

use crate::error::DecodeError;
use crate::ids::{CollectionId, UserId};
use crate::value::Value;

pub mod fields {
    pub const TITLE: &str = "title";
    pub const OWNER_ID: &str = "ownerId";
    pub const ITEMS_COLLECTION_ID: &str = "itemsCollectionId";
    pub const USERS: &str = "users";
    pub const DONE: &str = "done";
    pub const DONE_BY: &str = "doneBy";
    pub const AUTHOR: &str = "author";
    pub const NAME: &str = "name";
    pub const EMAIL: &str = "email";
}

pub(crate) fn require_map(value: &Value) -> Result<&BTreeMap<String, Value>, DecodeError> {
    match value {
        Value::Map(children) => Ok(children),
        Value::Null => Err(DecodeError::Absent),
        other => Err(DecodeError::NotAMap {
            found: other.kind_name(),
        }),
    }
}

fn text_field(map: &BTreeMap<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match map.get(field) {
        Some(Value::Text(s)) => Ok(s.clone()),
        Some(other) => Err(DecodeError::WrongType {
            field,
            expected: "text",
            found: other.kind_name(),
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

fn bool_field(map: &BTreeMap<String, Value>, field: &'static str) -> Result<bool, DecodeError> {
    match map.get(field) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(other) => Err(DecodeError::WrongType {
            field,
            expected: "boolean",
            found: other.kind_name(),
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

/// Who completed an item. Stored remotely as a user id or the layout's
/// not-done sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneBy {
    Nobody,
    User(UserId),
}

impl DoneBy {
    pub fn from_text(text: &str, sentinel: &str) -> Self {
        if text == sentinel || text.is_empty() {
            DoneBy::Nobody
        } else {
            DoneBy::User(UserId::new(text))
        }
    }

    pub fn to_value(&self, sentinel: &str) -> Value {
        match self {
            DoneBy::Nobody => Value::from(sentinel),
            DoneBy::User(user) => Value::from(user.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRecord {
    pub title: String,
    pub owner_id: UserId,
    pub items_collection_id: CollectionId,
    /// Access map: user id to `true` or the user's display name in this list.
    pub users: BTreeMap<UserId, Value>,
}

impl ListRecord {
    pub fn new(title: &str, owner_id: UserId, items_collection_id: CollectionId) -> Self {
        let mut users = BTreeMap::new();
        users.insert(owner_id.clone(), Value::Boolean(true));
        Self {
            title: title.to_string(),
            owner_id,
            items_collection_id,
            users,
        }
    }

    pub fn decode(value: &Value) -> Result<Self, DecodeError> {
        let map = require_map(value)?;
        let users = match map.get(fields::USERS) {
            None => BTreeMap::new(),
            Some(Value::Map(users)) => users
                .iter()
                .map(|(id, v)| (UserId::new(id.as_str()), v.clone()))
                .collect(),
            Some(other) => {
                return Err(DecodeError::WrongType {
                    field: fields::USERS,
                    expected: "map",
                    found: other.kind_name(),
                });
            }
        };
        Ok(Self {
            title: text_field(map, fields::TITLE)?,
            owner_id: UserId::new(text_field(map, fields::OWNER_ID)?),
            items_collection_id: CollectionId::new(text_field(map, fields::ITEMS_COLLECTION_ID)?),
            users,
        })
    }

    pub fn encode(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(fields::TITLE.to_string(), Value::from(self.title.as_str()));
        map.insert(fields::OWNER_ID.to_string(), Value::from(self.owner_id.as_str()));
        map.insert(
            fields::ITEMS_COLLECTION_ID.to_string(),
            Value::from(self.items_collection_id.as_str()),
        );
        if !self.users.is_empty() {
            let users = self
                .users
                .iter()
                .map(|(id, v)| (id.as_str().to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>();
            map.insert(fields::USERS.to_string(), Value::Map(users));
        }
        Value::Map(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub title: String,
    pub done: bool,
    pub done_by: DoneBy,
    pub author: UserId,
}

impl ItemRecord {
    pub fn new(title: &str, author: UserId) -> Self {
        Self {
            title: title.to_string(),
            done: false,
            done_by: DoneBy::Nobody,
            author,
        }
    }

    pub fn decode(value: &Value, sentinel: &str) -> Result<Self, DecodeError> {
        let map = require_map(value)?;
        let done_by = match map.get(fields::DONE_BY) {
            None => DoneBy::Nobody,
            Some(Value::Text(s)) => DoneBy::from_text(s, sentinel),
            Some(other) => {
                return Err(DecodeError::WrongType {
                    field: fields::DONE_BY,
                    expected: "text",
                    found: other.kind_name(),
                });
            }
        };
        Ok(Self {
            title: text_field(map, fields::TITLE)?,
            done: bool_field(map, fields::DONE)?,
            done_by,
            author: UserId::new(text_field(map, fields::AUTHOR)?),
        })
    }

    pub fn encode(&self, sentinel: &str) -> Value {
        let mut map = BTreeMap::new();
        map.insert(fields::TITLE.to_string(), Value::from(self.title.as_str()));
        map.insert(fields::DONE.to_string(), Value::from(self.done));
        map.insert(fields::DONE_BY.to_string(), self.done_by.to_value(sentinel));
        map.insert(fields::AUTHOR.to_string(), Value::from(self.author.as_str()));
        Value::Map(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
}

impl UserProfile {
    pub fn decode(value: &Value) -> Result<Self, DecodeError> {
        let map = require_map(value)?;
        Ok(Self {
            name: text_field(map, fields::NAME)?,
            email: text_field(map, fields::EMAIL)?,
        })
    }

    pub fn encode(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(fields::NAME.to_string(), Value::from(self.name.as_str()));
        map.insert(fields::EMAIL.to_string(), Value::from(self.email.as_str()));
        Value::Map(map)
    }
}
