pub mod audio;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod recipients;
pub mod services;
pub mod session;
pub mod sync;
pub mod transport;

pub use context::{Role, UserContext};
pub use error::{AudioError, ChatError, Result, ValidationError};
pub use events::SyncEvent;
pub use session::{Devices, SessionSettings, ViewSession};
pub use sync::SyncEngine;
pub use transport::{ConversationTransport, HttpTransport};
