use sharedlist_core::{CoreError, DecodeError, EntityKind};
use sharedlist_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("malformed record: {0}")]
    Decode(#[from] DecodeError),

    #[error("title must not be empty")]
    EmptyTitle,

    #[error("expected a {expected:?} entity, got {found:?}")]
    WrongEntityKind {
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("entity {key} has no `{field}` field")]
    MissingField { key: String, field: &'static str },

    #[error("no user is signed in")]
    NotSignedIn,

    #[error("no list is open")]
    NoOpenList,

    #[error("no entity at index {0}")]
    IndexOutOfRange(usize),
}
