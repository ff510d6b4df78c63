pub mod batch;
pub mod entity;
pub mod error;
pub mod ids;
pub mod layout;
pub mod path;
pub mod record;
pub mod value;

pub use batch::WriteBatch;
pub use entity::{Entity, EntityKind};
pub use error::{CoreError, DecodeError};
pub use ids::*;
pub use layout::Layout;
pub use path::StorePath;
pub use record::{DoneBy, ItemRecord, ListRecord, UserProfile};
pub use value::Value;
