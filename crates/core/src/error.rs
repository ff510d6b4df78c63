use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("overlapping write paths: {first} and {second}")]
    OverlappingWrite { first: String, second: String },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// A remote node that does not have the shape of the record it should hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record is absent")]
    Absent,

    #[error("expected a map, found {found}")]
    NotAMap { found: &'static str },

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has wrong type: expected {expected}, found {found}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}
