use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use bytes::Bytes;
use chat_api::{
    AudioAttachment, Conversation, CreateConversationRequest, DeliveryStatus, EditMessageRequest,
    Message, SendMessageRequest, PROVISIONAL_PREFIX,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::log::{MessageLog, Reconciled};
use crate::audio::VoiceSink;
use crate::context::UserContext;
use crate::error::{ChatError, Result, ValidationError};
use crate::events::{EventBus, SyncEvent};
use crate::recipients::CommittedBroadcast;
use crate::services::timer::PeriodicTask;
use crate::transport::ConversationTransport;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_EDIT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    /// Messages older than this can no longer be edited.
    pub edit_window: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            edit_window: DEFAULT_EDIT_WINDOW,
        }
    }
}

#[derive(Default)]
struct EngineState {
    conversations: Vec<Conversation>,
    active: Option<String>,
    /// Bumped on every active conversation switch.
    epoch: u64,
    fetch_seq: u64,
    applied_seq: u64,
    /// Bumped whenever a send, edit or delete changes the log locally.
    local_seq: u64,
    log: MessageLog,
    draft: String,
    list_task: Option<PeriodicTask>,
    message_task: Option<PeriodicTask>,
    closed: bool,
}

impl EngineState {
    fn active_conversation(&self) -> Option<&Conversation> {
        let id = self.active.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }
}

struct Inner {
    transport: Arc<dyn ConversationTransport>,
    user: UserContext,
    settings: SyncSettings,
    state: Mutex<EngineState>,
    events: Mutex<EventBus<SyncEvent>>,
    next_provisional: AtomicU64,
    list_in_flight: AtomicBool,
}

/// A message about to be inserted optimistically.
struct Outgoing {
    text: String,
    audio: Option<AudioAttachment>,
    recipient_count: Option<u32>,
    broadcast: bool,
}

/// Clears the list in-flight flag when a refresh ends or is aborted.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps the conversation list and the active conversation's message log in
/// step with the service, and applies local sends, edits and deletes
/// optimistically where allowed.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn ConversationTransport>,
        user: UserContext,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                user,
                settings,
                state: Mutex::new(EngineState::default()),
                events: Mutex::new(EventBus::new()),
                next_provisional: AtomicU64::new(0),
                list_in_flight: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn user(&self) -> &UserContext {
        &self.inner.user
    }

    pub fn settings(&self) -> SyncSettings {
        self.inner.settings
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SyncEvent> {
        self.inner.events.lock().subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        self.inner.events.lock().publish(event);
    }

    /// Start the periodic conversation list refresh. The first refresh runs
    /// immediately.
    pub fn start(&self) {
        let mut st = self.inner.state.lock();
        if st.closed || st.list_task.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        st.list_task = Some(PeriodicTask::spawn(
            "conversation-list",
            self.inner.settings.poll_interval,
            move || {
                let engine = Self::from_weak(&weak);
                async move {
                    if let Some(engine) = engine {
                        engine.refresh_conversation_list().await;
                    }
                }
            },
        ));
    }

    /// Stop all periodic work. Snapshots stay readable.
    pub fn shutdown(&self) {
        let (list, messages) = {
            let mut st = self.inner.state.lock();
            st.closed = true;
            (st.list_task.take(), st.message_task.take())
        };
        drop(list);
        drop(messages);
        info!(user = %self.inner.user.user_id, "sync engine stopped");
    }

    /// Replace the conversation list with the service's. Failures keep the
    /// previous list. A call made while another is in flight does nothing.
    pub async fn refresh_conversation_list(&self) {
        if self.inner.list_in_flight.swap(true, Ordering::AcqRel) {
            debug!("conversation list refresh already in flight");
            return;
        }
        let _guard = InFlight(&self.inner.list_in_flight);
        match self.inner.transport.list_conversations().await {
            Ok(conversations) => {
                debug!(count = conversations.len(), "conversation list refreshed");
                self.inner.state.lock().conversations = conversations;
                self.emit(SyncEvent::ConversationsReplaced);
            }
            Err(e) => warn!(error = %e, "conversation list refresh failed"),
        }
    }

    /// Switch the active conversation. Switching to the conversation that is
    /// already active does nothing.
    pub async fn set_active_conversation(&self, id: Option<String>) {
        let epoch = {
            let mut st = self.inner.state.lock();
            if st.active == id {
                return;
            }
            st.message_task = None;
            st.log.clear();
            st.draft.clear();
            st.epoch += 1;
            st.active = id.clone();
            st.epoch
        };
        self.emit(SyncEvent::ActiveConversationChanged(id.clone()));
        let Some(id) = id else {
            return;
        };
        info!(conversation = %id, "conversation activated");

        let weak = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn_after(
            "active-messages",
            self.inner.settings.poll_interval,
            move || {
                let engine = Self::from_weak(&weak);
                async move {
                    if let Some(engine) = engine {
                        if let Err(e) = engine.refresh_active_messages().await {
                            warn!(error = %e, "message refresh failed");
                        }
                    }
                }
            },
        );
        {
            let mut st = self.inner.state.lock();
            if st.closed || st.epoch != epoch {
                return;
            }
            st.message_task = Some(task);
        }

        self.mark_read(&id);
        if let Err(e) = self.refresh_active_messages().await {
            warn!(conversation = %id, error = %e, "initial message fetch failed");
        }
    }

    /// Fetch the active conversation's log and replace the local one. The
    /// answer is dropped when the active conversation or the local log changed
    /// meanwhile, or when a newer fetch was already applied.
    pub async fn refresh_active_messages(&self) -> Result<()> {
        let (id, epoch, seq, local_seq) = {
            let mut st = self.inner.state.lock();
            let Some(id) = st.active.clone() else {
                return Ok(());
            };
            st.fetch_seq += 1;
            (id, st.epoch, st.fetch_seq, st.local_seq)
        };
        let messages = self.inner.transport.list_messages(&id).await?;
        let applied = {
            let mut st = self.inner.state.lock();
            // A fetch issued before a local change may predate it on the server.
            if st.epoch != epoch || seq <= st.applied_seq || st.local_seq != local_seq {
                false
            } else {
                st.applied_seq = seq;
                st.log.replace_confirmed(messages);
                true
            }
        };
        if applied {
            self.emit(SyncEvent::MessagesReplaced {
                conversation_id: id,
            });
        } else {
            debug!(conversation = %id, seq, "discarding stale message fetch");
        }
        Ok(())
    }

    pub async fn send(&self, text: &str) -> Result<Message> {
        let text = non_empty(text)?;
        let (conversation_id, provisional_id) = self.insert_provisional(Outgoing {
            text: text.clone(),
            audio: None,
            recipient_count: None,
            broadcast: false,
        })?;
        let req = SendMessageRequest {
            text: Some(text),
            ..Default::default()
        };
        let result = self
            .inner
            .transport
            .send_message(&conversation_id, &req)
            .await;
        self.settle(&provisional_id, result)
    }

    /// Send to the broadcast conversation with a committed audience.
    pub async fn send_broadcast(
        &self,
        text: &str,
        committed: &CommittedBroadcast,
    ) -> Result<Message> {
        let text = non_empty(text)?;
        let (conversation_id, provisional_id) = self.insert_provisional(Outgoing {
            text: text.clone(),
            audio: None,
            recipient_count: Some(committed.recipient_count),
            broadcast: true,
        })?;
        let req = SendMessageRequest {
            text: Some(text),
            broadcast_filter: Some(committed.filter.clone()),
            ..Default::default()
        };
        let result = self
            .inner
            .transport
            .send_message(&conversation_id, &req)
            .await;
        self.settle(&provisional_id, result)
    }

    /// Upload an encoded recording and send it as a voice message to the
    /// active conversation.
    pub async fn send_voice(&self, encoded: Bytes, duration_secs: u32) -> Result<Message> {
        let conversation_id = self
            .active_conversation()
            .ok_or(ChatError::NoActiveConversation)?;
        self.send_voice_to(&conversation_id, encoded, duration_secs)
            .await
    }

    /// Send a voice message to `conversation_id`. A provisional entry is
    /// shown only while that conversation is the active one.
    pub async fn send_voice_to(
        &self,
        conversation_id: &str,
        encoded: Bytes,
        duration_secs: u32,
    ) -> Result<Message> {
        let provisional_id = {
            let mut st = self.inner.state.lock();
            if st.active.as_deref() == Some(conversation_id) {
                Some(self.push_provisional(
                    &mut st,
                    conversation_id,
                    Outgoing {
                        text: String::new(),
                        audio: Some(AudioAttachment::new("", duration_secs)),
                        recipient_count: None,
                        broadcast: false,
                    },
                ))
            } else {
                None
            }
        };
        if let Some(id) = &provisional_id {
            self.inserted(conversation_id, id);
        }
        let result = self
            .upload_and_send(conversation_id, encoded, duration_secs)
            .await;
        match provisional_id {
            Some(id) => self.settle(&id, result),
            None => {
                match &result {
                    Ok(m) => info!(conversation = %conversation_id, id = %m.id, "voice message sent to inactive conversation"),
                    Err(e) => warn!(conversation = %conversation_id, error = %e, "voice send failed"),
                }
                result
            }
        }
    }

    async fn upload_and_send(
        &self,
        conversation_id: &str,
        encoded: Bytes,
        duration_secs: u32,
    ) -> Result<Message> {
        let url = self
            .inner
            .transport
            .upload_audio(encoded, duration_secs)
            .await?;
        let req = SendMessageRequest {
            audio_url: Some(url),
            audio_duration_seconds: Some(duration_secs),
            ..Default::default()
        };
        self.inner
            .transport
            .send_message(conversation_id, &req)
            .await
    }

    fn insert_provisional(&self, out: Outgoing) -> Result<(String, String)> {
        let mut st = self.inner.state.lock();
        let conversation_id = st.active.clone().ok_or(ChatError::NoActiveConversation)?;
        if out.broadcast && !self.broadcast_allowed(&st) {
            return Err(ChatError::NotAuthorized("broadcast"));
        }
        let provisional_id = self.push_provisional(&mut st, &conversation_id, out);
        drop(st);
        self.inserted(&conversation_id, &provisional_id);
        Ok((conversation_id, provisional_id))
    }

    fn push_provisional(
        &self,
        st: &mut EngineState,
        conversation_id: &str,
        out: Outgoing,
    ) -> String {
        let n = self.inner.next_provisional.fetch_add(1, Ordering::Relaxed) + 1;
        let provisional_id = format!("{PROVISIONAL_PREFIX}{n}");
        st.log.push(Message {
            id: provisional_id.clone(),
            conversation_id: conversation_id.to_string(),
            text: out.text,
            audio: out.audio,
            sender_id: self.inner.user.user_id.clone(),
            sender_name: self.inner.user.display_name.clone(),
            status: DeliveryStatus::Sent,
            edited: false,
            created_at: now_unix(),
            recipient_count: out.recipient_count,
        });
        st.draft.clear();
        provisional_id
    }

    fn inserted(&self, conversation_id: &str, provisional_id: &str) {
        debug!(conversation = %conversation_id, id = %provisional_id, "provisional message inserted");
        self.emit(SyncEvent::MessageInserted {
            id: provisional_id.to_string(),
        });
    }

    /// Resolve a provisional message: reconcile with the confirmed message or
    /// remove it.
    fn settle(&self, provisional_id: &str, result: Result<Message>) -> Result<Message> {
        match result {
            Ok(confirmed) => {
                let outcome = {
                    let mut st = self.inner.state.lock();
                    st.local_seq += 1;
                    st.log.reconcile(provisional_id, confirmed.clone())
                };
                if outcome == Reconciled::Missing {
                    debug!(id = %provisional_id, "confirmed message arrived after switch");
                } else {
                    self.emit(SyncEvent::MessageReconciled {
                        provisional_id: provisional_id.to_string(),
                        id: confirmed.id.clone(),
                    });
                }
                Ok(confirmed)
            }
            Err(e) => {
                warn!(id = %provisional_id, error = %e, "send failed");
                let removed = {
                    let mut st = self.inner.state.lock();
                    st.local_seq += 1;
                    st.log.remove(provisional_id).is_some()
                };
                if removed {
                    self.emit(SyncEvent::MessageRemoved {
                        id: provisional_id.to_string(),
                    });
                }
                self.emit(SyncEvent::SendFailed {
                    provisional_id: provisional_id.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Edit a confirmed message inside the edit window. Returns `None` when
    /// the text is unchanged and nothing was sent. Local content changes only
    /// after the service accepts the edit.
    pub async fn edit(&self, message_id: &str, new_text: &str) -> Result<Option<Message>> {
        let text = non_empty(new_text)?;
        let conversation_id = {
            let st = self.inner.state.lock();
            let conversation_id = st.active.clone().ok_or(ChatError::NoActiveConversation)?;
            let message = st
                .log
                .get(message_id)
                .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
            if message.is_provisional() {
                return Err(ValidationError::Provisional.into());
            }
            let window = self.inner.settings.edit_window.as_secs();
            let age = now_unix().saturating_sub(message.created_at);
            if age >= 0 && age as u64 >= window {
                return Err(ValidationError::EditWindowExpired {
                    window_secs: window,
                }
                .into());
            }
            if message.text == text {
                return Ok(None);
            }
            conversation_id
        };
        let req = EditMessageRequest {
            message_id: message_id.to_string(),
            text,
        };
        let updated = match self.inner.transport.edit_message(&conversation_id, &req).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(id = %message_id, error = %e, "edit failed");
                return Err(e);
            }
        };
        let applied = {
            let mut st = self.inner.state.lock();
            st.local_seq += 1;
            st.log.update(message_id, |m| {
                m.text = updated.text.clone();
                m.edited = true;
            })
        };
        if applied {
            self.emit(SyncEvent::MessageEdited {
                id: message_id.to_string(),
            });
        }
        Ok(Some(updated))
    }

    /// Remove a confirmed message. The local removal is not undone when the
    /// service call fails; the next refresh restores the message.
    pub async fn delete(&self, message_id: &str) -> Result<()> {
        let conversation_id = {
            let mut st = self.inner.state.lock();
            let conversation_id = st.active.clone().ok_or(ChatError::NoActiveConversation)?;
            let message = st
                .log
                .get(message_id)
                .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
            if message.is_provisional() {
                return Err(ValidationError::Provisional.into());
            }
            st.log.remove(message_id);
            st.local_seq += 1;
            conversation_id
        };
        self.emit(SyncEvent::MessageRemoved {
            id: message_id.to_string(),
        });
        if let Err(e) = self
            .inner
            .transport
            .delete_message(&conversation_id, message_id)
            .await
        {
            warn!(id = %message_id, error = %e, "delete failed");
            self.emit(SyncEvent::DeleteFailed {
                id: message_id.to_string(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    /// Zero the local unread count and acknowledge in the background.
    pub fn mark_read(&self, conversation_id: &str) {
        let cleared = {
            let mut st = self.inner.state.lock();
            st.conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
                .map(|c| c.unread_count = 0)
                .is_some()
        };
        if cleared {
            self.emit(SyncEvent::UnreadCleared {
                conversation_id: conversation_id.to_string(),
            });
        }
        let transport = self.inner.transport.clone();
        let id = conversation_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = transport.mark_read(&id).await {
                warn!(conversation = %id, error = %e, "mark read failed");
            }
        });
    }

    pub async fn create_conversation(
        &self,
        participant_ids: Vec<String>,
        name: Option<String>,
    ) -> Result<Conversation> {
        let req = CreateConversationRequest {
            participant_ids,
            name,
        };
        let created = self.inner.transport.create_conversation(&req).await?;
        {
            let mut st = self.inner.state.lock();
            if !st.conversations.iter().any(|c| c.id == created.id) {
                st.conversations.insert(0, created.clone());
            }
        }
        info!(conversation = %created.id, "conversation created");
        self.emit(SyncEvent::ConversationsReplaced);
        Ok(created)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.lock().conversations.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().log.to_vec()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.inner.state.lock().log.get(id).cloned()
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.inner.state.lock().active.clone()
    }

    pub fn draft(&self) -> String {
        self.inner.state.lock().draft.clone()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.inner.state.lock().draft = text.into();
    }

    /// Whether the view should offer broadcast composition right now.
    pub fn can_send_broadcast(&self) -> bool {
        let st = self.inner.state.lock();
        self.broadcast_allowed(&st)
    }

    fn broadcast_allowed(&self, st: &EngineState) -> bool {
        self.inner.user.can_broadcast()
            && st.active_conversation().map_or(false, |c| c.is_broadcast)
    }
}

#[async_trait]
impl VoiceSink for SyncEngine {
    fn voice_target(&self) -> Option<String> {
        self.active_conversation()
    }

    async fn send_voice(
        &self,
        target: Option<&str>,
        encoded: Bytes,
        duration_secs: u32,
    ) -> Result<Message> {
        match target {
            Some(id) => self.send_voice_to(id, encoded, duration_secs).await,
            None => SyncEngine::send_voice(self, encoded, duration_secs).await,
        }
    }
}

fn non_empty(text: &str) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ValidationError::EmptyText.into());
    }
    Ok(text.to_string())
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;
    use crate::transport::mock::{MockCall, MockOp, MockTransport};
    use chat_api::{BroadcastFilter, RecipientClass};
    use tokio::time::sleep;

    fn conversation(id: &str, broadcast: bool) -> Conversation {
        Conversation {
            id: id.into(),
            name: Some(id.to_uppercase()),
            is_group: broadcast,
            is_broadcast: broadcast,
            participants: Vec::new(),
            last_message: None,
            unread_count: 3,
            last_activity: 0,
        }
    }

    fn message(id: &str, conversation: &str, text: &str, created_at: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: conversation.into(),
            text: text.into(),
            audio: None,
            sender_id: "me".into(),
            sender_name: "Me".into(),
            status: DeliveryStatus::Delivered,
            edited: false,
            created_at,
            recipient_count: None,
        }
    }

    fn setup(user: UserContext) -> (Arc<MockTransport>, SyncEngine) {
        let mock = MockTransport::default().shared();
        mock.add_conversation(conversation("c1", false));
        mock.add_conversation(conversation("c2", false));
        mock.add_conversation(conversation("news", true));
        mock.set_messages(
            "c1",
            vec![message("m1", "c1", "hello", now_unix() - 30)],
        );
        let engine = SyncEngine::new(mock.clone(), user, SyncSettings::default());
        (mock, engine)
    }

    fn ids(engine: &SyncEngine) -> Vec<String> {
        engine.messages().into_iter().map(|m| m.id).collect()
    }

    async fn active(user: UserContext) -> (Arc<MockTransport>, SyncEngine) {
        let (mock, engine) = setup(user);
        engine.refresh_conversation_list().await;
        engine.set_active_conversation(Some("c1".into())).await;
        (mock, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn activation_fetches_and_marks_read() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        tokio::task::yield_now().await;
        assert_eq!(ids(&engine), ["m1"]);
        assert_eq!(mock.count(MockOp::MarkRead), 1);
        let c1 = engine
            .conversations()
            .into_iter()
            .find(|c| c.id == "c1")
            .unwrap();
        assert_eq!(c1.unread_count, 0);

        engine.set_active_conversation(Some("c1".into())).await;
        assert_eq!(mock.count(MockOp::ListMessages), 1);

        sleep(Duration::from_millis(3100)).await;
        assert_eq!(mock.count(MockOp::ListMessages), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_reconciles_in_place() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.set_delay(MockOp::Send, Duration::from_millis(200));
        let mut events = engine.subscribe();
        engine.set_draft("  hi there ");

        let sender = engine.clone();
        let send = tokio::spawn(async move { sender.send("  hi there ").await });
        sleep(Duration::from_millis(50)).await;
        let pending = engine.messages();
        assert_eq!(pending.len(), 2);
        assert!(pending[1].is_provisional());
        assert_eq!(pending[1].text, "hi there");
        assert_eq!(engine.draft(), "");

        let confirmed = send.await.unwrap().unwrap();
        assert_eq!(ids(&engine), ["m1", confirmed.id.as_str()]);
        assert!(matches!(events.recv().await, Some(SyncEvent::MessageInserted { .. })));
        assert_eq!(
            events.recv().await,
            Some(SyncEvent::MessageReconciled {
                provisional_id: pending[1].id.clone(),
                id: confirmed.id,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_removes_provisional() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.fail_next(MockOp::Send);
        let lists_before = mock.count(MockOp::ListConversations);
        let err = engine.send("lost").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(ids(&engine), ["m1"]);
        assert_eq!(mock.count(MockOp::ListConversations), lists_before);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_and_no_conversation_are_rejected_locally() {
        let (mock, engine) = setup(UserContext::new("me", "Me"));
        assert!(matches!(
            engine.send("   ").await,
            Err(ChatError::Validation(ValidationError::EmptyText))
        ));
        assert!(matches!(
            engine.send("hi").await,
            Err(ChatError::NoActiveConversation)
        ));
        assert_eq!(mock.count(MockOp::Send), 0);
        assert!(engine.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fetch_for_previous_conversation_is_dropped() {
        let (mock, engine) = setup(UserContext::new("me", "Me"));
        mock.set_messages("c2", vec![message("b1", "c2", "bee", now_unix())]);
        mock.set_conversation_delay("c1", Duration::from_secs(1));

        let first = engine.clone();
        let slow = tokio::spawn(async move {
            first.set_active_conversation(Some("c1".into())).await;
        });
        sleep(Duration::from_millis(100)).await;
        engine.set_active_conversation(Some("c2".into())).await;
        assert_eq!(ids(&engine), ["b1"]);

        slow.await.unwrap();
        assert_eq!(engine.active_conversation().as_deref(), Some("c2"));
        assert_eq!(ids(&engine), ["b1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn provisional_survives_refresh() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.set_delay(MockOp::Send, Duration::from_secs(5));
        let sender = engine.clone();
        let send = tokio::spawn(async move { sender.send("slow").await });
        sleep(Duration::from_millis(10)).await;

        engine.refresh_active_messages().await.unwrap();
        let messages = engine.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].is_provisional());

        let confirmed = send.await.unwrap().unwrap();
        assert_eq!(ids(&engine), ["m1", confirmed.id.as_str()]);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_outside_window_makes_no_call() {
        let (mock, engine) = setup(UserContext::new("me", "Me"));
        mock.set_messages(
            "c1",
            vec![message("old", "c1", "before", now_unix() - 16 * 60)],
        );
        engine.set_active_conversation(Some("c1".into())).await;
        let err = engine.edit("old", "after").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Validation(ValidationError::EditWindowExpired { window_secs: 900 })
        ));
        assert_eq!(mock.count(MockOp::Edit), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_applies_only_on_success() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        assert_eq!(engine.edit("m1", "hello").await.unwrap(), None);
        assert_eq!(mock.count(MockOp::Edit), 0);

        mock.fail_next(MockOp::Edit);
        assert!(engine.edit("m1", "changed").await.is_err());
        let m1 = engine.message("m1").unwrap();
        assert_eq!(m1.text, "hello");
        assert!(!m1.edited);

        let updated = engine.edit("m1", "changed").await.unwrap().unwrap();
        assert!(updated.edited);
        let m1 = engine.message("m1").unwrap();
        assert_eq!(m1.text, "changed");
        assert!(m1.edited);
    }

    #[tokio::test(start_paused = true)]
    async fn provisional_messages_cannot_be_edited_or_deleted() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.set_delay(MockOp::Send, Duration::from_secs(1));
        let sender = engine.clone();
        let _send = tokio::spawn(async move { sender.send("wait").await });
        sleep(Duration::from_millis(10)).await;
        let provisional = engine.messages()[1].id.clone();
        assert!(matches!(
            engine.edit(&provisional, "x").await,
            Err(ChatError::Validation(ValidationError::Provisional))
        ));
        assert!(matches!(
            engine.delete(&provisional).await,
            Err(ChatError::Validation(ValidationError::Provisional))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_is_optimistic_and_not_restored() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.fail_next(MockOp::Delete);
        let mut events = engine.subscribe();
        assert!(engine.delete("m1").await.is_err());
        assert!(engine.messages().is_empty());
        assert_eq!(
            events.recv().await,
            Some(SyncEvent::MessageRemoved { id: "m1".into() })
        );
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::DeleteFailed { .. })
        ));

        engine.refresh_active_messages().await.unwrap();
        assert_eq!(ids(&engine), ["m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_issued_before_send_keeps_confirmed_message() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.set_snapshot_fetches(true);
        mock.set_delay(MockOp::ListMessages, Duration::from_millis(300));
        let poller = engine.clone();
        let poll = tokio::spawn(async move { poller.refresh_active_messages().await });
        sleep(Duration::from_millis(10)).await;

        let confirmed = engine.send("fresh").await.unwrap();
        assert_eq!(ids(&engine), ["m1", confirmed.id.as_str()]);
        poll.await.unwrap().unwrap();
        assert_eq!(ids(&engine), ["m1", confirmed.id.as_str()]);

        engine.refresh_active_messages().await.unwrap();
        assert_eq!(ids(&engine), ["m1", confirmed.id.as_str()]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_issued_before_delete_does_not_restore_message() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.set_snapshot_fetches(true);
        mock.set_delay(MockOp::ListMessages, Duration::from_millis(300));
        let poller = engine.clone();
        let poll = tokio::spawn(async move { poller.refresh_active_messages().await });
        sleep(Duration::from_millis(10)).await;

        engine.delete("m1").await.unwrap();
        poll.await.unwrap().unwrap();
        assert!(engine.messages().is_empty());

        engine.refresh_active_messages().await.unwrap();
        assert!(engine.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_requires_role_and_broadcast_conversation() {
        let committed = CommittedBroadcast {
            filter: BroadcastFilter::for_class(RecipientClass::Student),
            recipient_count: 42,
        };

        let (mock, plain) = setup(UserContext::new("me", "Me"));
        plain.refresh_conversation_list().await;
        plain.set_active_conversation(Some("news".into())).await;
        assert!(!plain.can_send_broadcast());
        assert!(matches!(
            plain.send_broadcast("all", &committed).await,
            Err(ChatError::NotAuthorized(_))
        ));
        assert_eq!(mock.count(MockOp::Send), 0);

        let sender = UserContext::new("me", "Me").with_role(Role::BroadcastSender);
        let (mock, engine) = active(sender).await;
        assert!(!engine.can_send_broadcast());
        engine.set_active_conversation(Some("news".into())).await;
        assert!(engine.can_send_broadcast());
        mock.resolve_with(|_| 42);

        let sent = engine.send_broadcast("all", &committed).await.unwrap();
        assert_eq!(sent.recipient_count, Some(42));
        assert!(mock.calls().iter().any(|c| matches!(
            c,
            MockCall::Send(id, req) if id == "news" && req.broadcast_filter.is_some()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn voice_message_uploads_then_sends() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        let sent = engine
            .send_voice(Bytes::from(vec![7u8; 4096]), 12)
            .await
            .unwrap();
        let audio = sent.audio.unwrap();
        assert!(audio.url.starts_with("mock://audio/"));
        assert_eq!(audio.duration_secs, 12);
        let calls = mock.calls();
        let upload = calls
            .iter()
            .position(|c| matches!(c, MockCall::Upload { bytes: 4096, duration_secs: 12 }))
            .unwrap();
        let send = calls
            .iter()
            .position(|c| matches!(c, MockCall::Send(..)))
            .unwrap();
        assert!(upload < send);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_removes_voice_provisional() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.fail_next(MockOp::Upload);
        assert!(engine.send_voice(Bytes::from_static(b"abc"), 3).await.is_err());
        assert_eq!(ids(&engine), ["m1"]);
        assert_eq!(mock.count(MockOp::Send), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn voice_stays_with_its_conversation_across_a_switch() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        mock.set_delay(MockOp::Upload, Duration::from_millis(500));
        let target = VoiceSink::voice_target(&engine);
        assert_eq!(target.as_deref(), Some("c1"));

        let e = engine.clone();
        let send = tokio::spawn(async move {
            VoiceSink::send_voice(&e, target.as_deref(), Bytes::from_static(b"abcd"), 4).await
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.messages().len(), 2);

        engine.set_active_conversation(Some("c2".into())).await;
        let sent = send.await.unwrap().unwrap();
        assert_eq!(sent.conversation_id, "c1");
        assert!(mock.calls().iter().any(|c| matches!(
            c,
            MockCall::Send(id, req) if id == "c1" && req.audio_url.is_some()
        )));
        assert!(engine.messages().iter().all(|m| m.conversation_id == "c2"));
    }

    #[tokio::test(start_paused = true)]
    async fn voice_to_inactive_conversation_skips_provisional() {
        let (mock, engine) = active(UserContext::new("me", "Me")).await;
        let mut events = engine.subscribe();
        let sent = engine
            .send_voice_to("c2", Bytes::from_static(b"abcd"), 4)
            .await
            .unwrap();
        assert_eq!(sent.conversation_id, "c2");
        assert_eq!(ids(&engine), ["m1"]);
        assert!(events.try_recv().is_err());
        assert_eq!(mock.count(MockOp::Send), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn list_refresh_keeps_snapshot_on_failure() {
        let (mock, engine) = setup(UserContext::new("me", "Me"));
        engine.refresh_conversation_list().await;
        assert_eq!(engine.conversations().len(), 3);
        mock.fail_next(MockOp::ListConversations);
        engine.refresh_conversation_list().await;
        assert_eq!(engine.conversations().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_list_refreshes_coalesce() {
        let (mock, engine) = setup(UserContext::new("me", "Me"));
        mock.set_delay(MockOp::ListConversations, Duration::from_millis(500));
        let a = engine.clone();
        let first = tokio::spawn(async move { a.refresh_conversation_list().await });
        sleep(Duration::from_millis(10)).await;
        engine.refresh_conversation_list().await;
        first.await.unwrap();
        assert_eq!(mock.count(MockOp::ListConversations), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_polls_until_shutdown() {
        let (mock, engine) = setup(UserContext::new("me", "Me"));
        engine.start();
        sleep(Duration::from_millis(6100)).await;
        assert_eq!(mock.count(MockOp::ListConversations), 3);
        engine.shutdown();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.count(MockOp::ListConversations), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn created_conversation_joins_list() {
        let (mock, engine) = setup(UserContext::new("me", "Me"));
        let created = engine
            .create_conversation(vec!["u2".into()], Some("Pair".into()))
            .await
            .unwrap();
        assert_eq!(engine.conversations()[0].id, created.id);
        assert_eq!(mock.count(MockOp::CreateConversation), 1);
    }
}
