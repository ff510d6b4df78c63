use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, ItemId, ListId, UserId};
use crate::path::StorePath;

const LISTS_CHILD: &str = "lists";
const ITEMS_CHILD: &str = "items";
const USERS_CHILD: &str = "users";
const LIST_POINTER_CHILD: &str = "listId";

/// Logical layout of the denormalized remote tree.
///
/// ```text
/// owners/{owner}/lists/{list}          -> true
/// lists/{list}                         -> {title, ownerId, itemsCollectionId, users}
/// itemCollections/{c}/listId           -> list id
/// itemCollections/{c}/items/{item}     -> {title, done, doneBy, author}
/// users/{user}                         -> {name, email}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub owners_root: String,
    pub lists_root: String,
    pub collections_root: String,
    pub profiles_root: String,
    /// Value of `doneBy` while an item is not completed.
    pub not_done_sentinel: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            owners_root: "owners".to_string(),
            lists_root: "lists".to_string(),
            collections_root: "itemCollections".to_string(),
            profiles_root: "users".to_string(),
            not_done_sentinel: "NONE".to_string(),
        }
    }
}

impl Layout {
    fn root(name: &str) -> StorePath {
        StorePath::root().child(name)
    }

    pub fn owner_lists(&self, owner: &UserId) -> StorePath {
        Self::root(&self.owners_root)
            .child(owner.as_str())
            .child(LISTS_CHILD)
    }

    pub fn owner_list_entry(&self, owner: &UserId, list: &ListId) -> StorePath {
        self.owner_lists(owner).child(list.as_str())
    }

    pub fn lists(&self) -> StorePath {
        Self::root(&self.lists_root)
    }

    pub fn list_record(&self, list: &ListId) -> StorePath {
        self.lists().child(list.as_str())
    }

    pub fn list_users(&self, list: &ListId) -> StorePath {
        self.list_record(list).child(USERS_CHILD)
    }

    pub fn list_user(&self, list: &ListId, user: &UserId) -> StorePath {
        self.list_users(list).child(user.as_str())
    }

    pub fn collections(&self) -> StorePath {
        Self::root(&self.collections_root)
    }

    pub fn collection(&self, collection: &CollectionId) -> StorePath {
        self.collections().child(collection.as_str())
    }

    pub fn collection_list_pointer(&self, collection: &CollectionId) -> StorePath {
        self.collection(collection).child(LIST_POINTER_CHILD)
    }

    pub fn collection_items(&self, collection: &CollectionId) -> StorePath {
        self.collection(collection).child(ITEMS_CHILD)
    }

    pub fn item_record(&self, collection: &CollectionId, item: &ItemId) -> StorePath {
        self.collection_items(collection).child(item.as_str())
    }

    pub fn profile(&self, user: &UserId) -> StorePath {
        Self::root(&self.profiles_root).child(user.as_str())
    }
}
