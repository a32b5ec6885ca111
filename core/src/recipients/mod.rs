//! Broadcast audience selection.

mod editor;
mod resolver;

pub use editor::FilterEditor;
pub use resolver::{
    CommittedBroadcast, RecipientCount, RecipientResolver, ResolverStatus, DEFAULT_DEBOUNCE,
};
