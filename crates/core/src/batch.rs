use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::path::StorePath;
use crate::value::Value;

/// A set of absolute-path updates that the store applies all-or-nothing.
/// `None` marks a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    updates: BTreeMap<StorePath, Option<Value>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a value. Writing `Null` is a delete.
    pub fn set(&mut self, path: StorePath, value: impl Into<Value>) -> Result<(), CoreError> {
        let value = value.into();
        let update = if value.is_null() { None } else { Some(value) };
        self.stage(path, update)
    }

    pub fn delete(&mut self, path: StorePath) -> Result<(), CoreError> {
        self.stage(path, None)
    }

    fn stage(&mut self, path: StorePath, update: Option<Value>) -> Result<(), CoreError> {
        if path.is_root() {
            return Err(CoreError::InvalidPath("cannot write the root node".into()));
        }
        // Re-staging the same path replaces it; nesting is ambiguous.
        if let Some(existing) = self
            .updates
            .keys()
            .find(|existing| *existing != &path && existing.overlaps(&path))
        {
            return Err(CoreError::OverlappingWrite {
                first: existing.to_string(),
                second: path.to_string(),
            });
        }
        self.updates.insert(path, update);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &StorePath> {
        self.updates.keys()
    }

    /// `Some(None)` for a staged delete, `None` when the path is untouched.
    pub fn get(&self, path: &StorePath) -> Option<Option<&Value>> {
        self.updates.get(path).map(Option::as_ref)
    }

    pub fn touches(&self, path: &StorePath) -> bool {
        self.updates.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StorePath, Option<&Value>)> {
        self.updates.iter().map(|(path, update)| (path, update.as_ref()))
    }
}

impl IntoIterator for WriteBatch {
    type Item = (StorePath, Option<Value>);
    type IntoIter = std::collections::btree_map::IntoIter<StorePath, Option<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.updates.into_iter()
    }
}
