use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Notifications a view repaints on. Payloads carry ids only; the current
/// data is read back through the engine's snapshot accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConversationsReplaced,
    UnreadCleared { conversation_id: String },
    ActiveConversationChanged(Option<String>),
    MessagesReplaced { conversation_id: String },
    MessageInserted { id: String },
    MessageReconciled { provisional_id: String, id: String },
    MessageEdited { id: String },
    MessageRemoved { id: String },
    SendFailed { provisional_id: String, reason: String },
    DeleteFailed { id: String, reason: String },
}

/// Small fan-out bus. Closed subscribers are dropped on the next publish.
pub struct EventBus<E> {
    subscribers: Vec<UnboundedSender<E>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&mut self) -> UnboundedReceiver<E> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: E) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
