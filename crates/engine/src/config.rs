use serde::{Deserialize, Serialize};
use sharedlist_core::Layout;

/// Runtime configuration of a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub layout: Layout,
    /// Passed to [`crate::logging::init_logging`] by hosts that bootstrap
    /// logging from this config.
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            log_level: crate::logging::default_log_level().to_string(),
        }
    }
}
