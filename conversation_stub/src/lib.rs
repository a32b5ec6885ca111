//! In-memory implementation of the conversation, audio-object and broadcast
//! HTTP service consumed by `chatcore`.

pub mod api;
pub mod config;
pub mod store;

pub use api::{build_router, run_http_server, AppState};
pub use store::Store;
