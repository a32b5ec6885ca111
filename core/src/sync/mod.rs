//! Conversation list and active message log synchronisation.

mod engine;
pub mod log;

pub use engine::{SyncEngine, SyncSettings, DEFAULT_EDIT_WINDOW, DEFAULT_POLL_INTERVAL};
pub use log::{MessageLog, Reconciled};
