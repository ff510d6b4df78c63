//! Shared fixtures for the integration tests: one in-memory backend
//! (`TestNetwork`) and any number of signed-in clients (`TestPeer`).

pub mod network;
pub mod peer;

pub use network::TestNetwork;
pub use peer::{Notification, RecordingDelegate, TestPeer};
