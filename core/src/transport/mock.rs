//! Scriptable in-memory transport for tests and headless runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chat_api::{
    AudioAttachment, BroadcastFilter, Conversation, CreateConversationRequest, DeliveryStatus,
    EditMessageRequest, FilterOptions, LastMessage, Message, SendMessageRequest,
};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::time::{sleep, Duration};

use super::{AudioDownload, ConversationTransport};
use crate::error::{ChatError, Result};

/// Operations that can be delayed or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListConversations,
    CreateConversation,
    ListMessages,
    Send,
    Edit,
    Delete,
    MarkRead,
    Upload,
    Download,
    FilterOptions,
    Resolve,
}

/// A recorded call, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    ListConversations,
    CreateConversation(CreateConversationRequest),
    ListMessages(String),
    Send(String, SendMessageRequest),
    Edit(String, EditMessageRequest),
    Delete(String, String),
    MarkRead(String),
    Upload { bytes: usize, duration_secs: u32 },
    Download(String),
    FilterOptions,
    Resolve(BroadcastFilter),
}

/// An object served by [`MockTransport::download_audio`].
#[derive(Debug, Clone)]
pub struct MockAudioObject {
    pub data: Bytes,
    /// Whether the total length is reported with the stream.
    pub report_length: bool,
    pub chunk_size: usize,
    /// Pause before each chunk is yielded.
    pub chunk_delay: Duration,
    /// Fail the stream after this many chunks.
    pub fail_after_chunks: Option<usize>,
}

impl MockAudioObject {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            report_length: true,
            chunk_size: 1024,
            chunk_delay: Duration::ZERO,
            fail_after_chunks: None,
        }
    }
}

type Resolver = Box<dyn Fn(&BroadcastFilter) -> u32 + Send + Sync>;

#[derive(Default)]
struct MockState {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<Message>>,
    audio: HashMap<String, MockAudioObject>,
    options: FilterOptions,
    failing: HashSet<MockOp>,
    fail_once: HashSet<MockOp>,
    delays: HashMap<MockOp, Duration>,
    conversation_delays: HashMap<String, Duration>,
    resolve_delays: VecDeque<Duration>,
    snapshot_fetches: bool,
    next_id: u64,
    now: Option<i64>,
}

/// In-memory [`ConversationTransport`] that records every call.
pub struct MockTransport {
    user_id: String,
    user_name: String,
    state: Mutex<MockState>,
    calls: Mutex<Vec<MockCall>>,
    resolver: Mutex<Option<Resolver>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new("me", "Me")
    }
}

impl MockTransport {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            state: Mutex::new(MockState::default()),
            calls: Mutex::new(Vec::new()),
            resolver: Mutex::new(None),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        let mut st = self.state.lock();
        st.messages.entry(conversation.id.clone()).or_default();
        st.conversations.push(conversation);
    }

    pub fn set_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        self.state
            .lock()
            .messages
            .insert(conversation_id.to_string(), messages);
    }

    pub fn messages_of(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_audio_object(&self, url: &str, object: MockAudioObject) {
        self.state.lock().audio.insert(url.to_string(), object);
    }

    pub fn set_filter_options(&self, options: FilterOptions) {
        self.state.lock().options = options;
    }

    pub fn resolve_with<F>(&self, f: F)
    where
        F: Fn(&BroadcastFilter) -> u32 + Send + Sync + 'static,
    {
        *self.resolver.lock() = Some(Box::new(f));
    }

    /// Delays for successive resolve calls, consumed in order.
    pub fn push_resolve_delay(&self, delay: Duration) {
        self.state.lock().resolve_delays.push_back(delay);
    }

    pub fn set_failing(&self, op: MockOp, failing: bool) {
        let mut st = self.state.lock();
        if failing {
            st.failing.insert(op);
        } else {
            st.failing.remove(&op);
        }
    }

    pub fn fail_next(&self, op: MockOp) {
        self.state.lock().fail_once.insert(op);
    }

    pub fn set_delay(&self, op: MockOp, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    /// Delay message fetches for one conversation only.
    pub fn set_conversation_delay(&self, conversation_id: &str, delay: Duration) {
        self.state
            .lock()
            .conversation_delays
            .insert(conversation_id.to_string(), delay);
    }

    /// Answer message fetches with the server state at issue time instead of
    /// the state after the delay.
    pub fn set_snapshot_fetches(&self, on: bool) {
        self.state.lock().snapshot_fetches = on;
    }

    /// Pin the server clock used for created messages.
    pub fn set_now(&self, unix_secs: i64) {
        self.state.lock().now = Some(unix_secs);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| call_op(c) == op)
            .count()
    }

    async fn enter(&self, call: MockCall) -> Result<()> {
        let op = call_op(&call);
        let delay = {
            let mut st = self.state.lock();
            let base = st.delays.get(&op).copied().unwrap_or_default();
            match &call {
                MockCall::ListMessages(id) => st
                    .conversation_delays
                    .get(id)
                    .copied()
                    .unwrap_or(base),
                MockCall::Resolve(_) => st.resolve_delays.pop_front().unwrap_or(base),
                _ => base,
            }
        };
        self.calls.lock().push(call);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let mut st = self.state.lock();
        if st.fail_once.remove(&op) || st.failing.contains(&op) {
            return Err(ChatError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: format!("injected {op:?} failure"),
            });
        }
        Ok(())
    }

    fn now(&self) -> i64 {
        self.state
            .lock()
            .now
            .unwrap_or_else(|| time::OffsetDateTime::now_utc().unix_timestamp())
    }
}

fn call_op(call: &MockCall) -> MockOp {
    match call {
        MockCall::ListConversations => MockOp::ListConversations,
        MockCall::CreateConversation(_) => MockOp::CreateConversation,
        MockCall::ListMessages(_) => MockOp::ListMessages,
        MockCall::Send(..) => MockOp::Send,
        MockCall::Edit(..) => MockOp::Edit,
        MockCall::Delete(..) => MockOp::Delete,
        MockCall::MarkRead(_) => MockOp::MarkRead,
        MockCall::Upload { .. } => MockOp::Upload,
        MockCall::Download(_) => MockOp::Download,
        MockCall::FilterOptions => MockOp::FilterOptions,
        MockCall::Resolve(_) => MockOp::Resolve,
    }
}

fn not_found(what: &str) -> ChatError {
    ChatError::Status {
        status: StatusCode::NOT_FOUND,
        body: format!("{what} not found"),
    }
}

#[async_trait]
impl ConversationTransport for MockTransport {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.enter(MockCall::ListConversations).await?;
        Ok(self.state.lock().conversations.clone())
    }

    async fn create_conversation(&self, req: &CreateConversationRequest) -> Result<Conversation> {
        self.enter(MockCall::CreateConversation(req.clone())).await?;
        let now = self.now();
        let mut st = self.state.lock();
        st.next_id += 1;
        let conversation = Conversation {
            id: format!("conv-{}", st.next_id),
            name: req.name.clone(),
            is_group: req.participant_ids.len() > 1,
            is_broadcast: false,
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
            last_activity: now,
        };
        st.messages.insert(conversation.id.clone(), Vec::new());
        st.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let snapshot = self
            .state
            .lock()
            .snapshot_fetches
            .then(|| self.messages_of(conversation_id));
        self.enter(MockCall::ListMessages(conversation_id.to_string()))
            .await?;
        Ok(snapshot.unwrap_or_else(|| self.messages_of(conversation_id)))
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        req: &SendMessageRequest,
    ) -> Result<Message> {
        self.enter(MockCall::Send(conversation_id.to_string(), req.clone()))
            .await?;
        let recipient_count = req.broadcast_filter.as_ref().map(|f| {
            self.resolver
                .lock()
                .as_ref()
                .map_or(0, |resolve| resolve(f))
        });
        let now = self.now();
        let mut st = self.state.lock();
        st.next_id += 1;
        let message = Message {
            id: format!("srv-{}", st.next_id),
            conversation_id: conversation_id.to_string(),
            text: req.text.clone().unwrap_or_default(),
            audio: req
                .audio_url
                .as_ref()
                .map(|url| AudioAttachment::new(url, req.audio_duration_seconds.unwrap_or(0))),
            sender_id: self.user_id.clone(),
            sender_name: self.user_name.clone(),
            status: DeliveryStatus::Sent,
            edited: false,
            created_at: now,
            recipient_count,
        };
        st.messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        if let Some(conv) = st
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conv.last_activity = now;
            conv.last_message = Some(LastMessage {
                text: message.text.clone(),
                sender_name: message.sender_name.clone(),
                has_audio: message.audio.is_some(),
                created_at: now,
            });
        }
        Ok(message)
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        req: &EditMessageRequest,
    ) -> Result<Message> {
        self.enter(MockCall::Edit(conversation_id.to_string(), req.clone()))
            .await?;
        let mut st = self.state.lock();
        let message = st
            .messages
            .get_mut(conversation_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == req.message_id))
            .ok_or_else(|| not_found("message"))?;
        message.text = req.text.clone();
        message.edited = true;
        Ok(message.clone())
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.enter(MockCall::Delete(
            conversation_id.to_string(),
            message_id.to_string(),
        ))
        .await?;
        let mut st = self.state.lock();
        if let Some(log) = st.messages.get_mut(conversation_id) {
            log.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.enter(MockCall::MarkRead(conversation_id.to_string()))
            .await?;
        let mut st = self.state.lock();
        if let Some(conv) = st
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conv.unread_count = 0;
        }
        Ok(())
    }

    async fn upload_audio(&self, encoded: Bytes, duration_secs: u32) -> Result<String> {
        self.enter(MockCall::Upload {
            bytes: encoded.len(),
            duration_secs,
        })
        .await?;
        let mut st = self.state.lock();
        st.next_id += 1;
        let url = format!("mock://audio/{}.webm", st.next_id);
        st.audio.insert(url.clone(), MockAudioObject::new(encoded));
        Ok(url)
    }

    async fn download_audio(&self, url: &str) -> Result<AudioDownload> {
        self.enter(MockCall::Download(url.to_string())).await?;
        let object = self
            .state
            .lock()
            .audio
            .get(url)
            .cloned()
            .ok_or_else(|| not_found("audio object"))?;
        let total_bytes = object.report_length.then_some(object.data.len() as u64);
        let chunk_size = object.chunk_size.max(1);
        let mut chunks: Vec<Result<Bytes>> = (0..object.data.len())
            .step_by(chunk_size)
            .map(|start| {
                let end = (start + chunk_size).min(object.data.len());
                Ok(object.data.slice(start..end))
            })
            .collect();
        if let Some(n) = object.fail_after_chunks {
            chunks.truncate(n);
            chunks.push(Err(ChatError::from(crate::error::AudioError::Download(
                "connection reset".into(),
            ))));
        }
        let delay = object.chunk_delay;
        let body = stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                chunk
            })
            .boxed();
        Ok(AudioDownload { total_bytes, body })
    }

    async fn filter_options(&self) -> Result<FilterOptions> {
        self.enter(MockCall::FilterOptions).await?;
        Ok(self.state.lock().options.clone())
    }

    async fn resolve_recipients(&self, filter: &BroadcastFilter) -> Result<u32> {
        self.enter(MockCall::Resolve(filter.clone())).await?;
        Ok(self
            .resolver
            .lock()
            .as_ref()
            .map_or(0, |resolve| resolve(filter)))
    }
}
