pub mod barrier;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod mirror;
pub mod session;
pub mod source;
pub mod sync;

pub use barrier::{Arrival, LoadBarrier};
pub use config::SyncConfig;
pub use error::EngineError;
pub use gateway::MutationGateway;
pub use logging::{default_log_level, init_logging, logging_status};
pub use mirror::{EntityHandle, EntityMirror, FieldChangeObserver, UpdateNotifier};
pub use session::{ListCallback, ProfileCallback, Session};
pub use source::{CollectionSource, ListItems, MaterializeCallback, UserLists};
pub use sync::{CollectionSyncEngine, SyncDelegate};
