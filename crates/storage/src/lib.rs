pub mod error;
pub mod memory;
pub mod traits;

pub use error::StoreError;
pub use memory::{MemoryStore, PendingDelivery};
pub use traits::*;
