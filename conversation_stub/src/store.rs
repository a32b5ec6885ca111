use std::collections::HashMap;

use bytes::Bytes;
use chat_api::{
    AudioAttachment, BroadcastFilter, CityOption, Conversation, DeliveryStatus, FilterOption,
    FilterOptions, LastMessage, Message, Participant, RecipientClass, RecipientProfile,
    SendMessageRequest,
};
use time::OffsetDateTime;
use uuid::Uuid;

/// Messages can be edited for this long after creation.
pub const EDIT_WINDOW_SECS: i64 = 15 * 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("empty_message")]
    EmptyMessage,
    #[error("edit_window_expired")]
    EditWindowExpired,
    #[error("invalid_broadcast")]
    InvalidBroadcast,
    #[error("unknown_participant")]
    UnknownParticipant,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct StubUser {
    pub participant: Participant,
    pub token: String,
    pub can_broadcast: bool,
}

#[derive(Debug, Clone)]
pub struct AudioObject {
    pub data: Bytes,
    pub duration_secs: u32,
}

#[derive(Debug, Clone)]
struct StoredConversation {
    id: String,
    name: Option<String>,
    is_group: bool,
    is_broadcast: bool,
    participant_ids: Vec<String>,
    last_activity: i64,
    messages: Vec<Message>,
    unread: HashMap<String, u32>,
}

/// In-memory state of the stub service.
#[derive(Debug, Default)]
pub struct Store {
    users: Vec<StubUser>,
    conversations: Vec<StoredConversation>,
    audio: HashMap<String, AudioObject>,
    directory: Vec<RecipientProfile>,
    options: FilterOptions,
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

impl Store {
    /// A small school: three staff accounts, a direct chat, a staff group, an
    /// announcements broadcast and a recipient directory. `me_token`
    /// authenticates the broadcast-capable account `me`.
    pub fn demo(me_token: &str) -> Self {
        let mut store = Self::default();
        store.add_user("me", "Maria", "Lopez", "admin", me_token, true);
        store.add_user("ana", "Ana", "Silva", "teacher", "ana-token", false);
        store.add_user("bo", "Bo", "Berg", "teacher", "bo-token", false);

        let direct = store.insert_conversation(None, false, false, &["me", "ana"]);
        store.insert_conversation(Some("Staff"), true, false, &["me", "ana", "bo"]);
        store.insert_conversation(Some("Announcements"), true, true, &["me", "ana", "bo"]);
        let _ = store.seed_message(&direct, "ana", "Welcome aboard!", now() - 120);

        let opt = |id: &str, name: &str| FilterOption {
            id: id.into(),
            name: name.into(),
        };
        let city = |id: &str, name: &str, region: &str| CityOption {
            id: id.into(),
            name: name.into(),
            region_id: region.into(),
        };
        store.options = FilterOptions {
            grades: vec![opt("5", "Grade 5"), opt("6", "Grade 6")],
            regions: vec![opt("north", "North"), opt("south", "South")],
            cities: vec![
                city("n-harbor", "Harbor", "north"),
                city("n-ridge", "Ridge", "north"),
                city("s-vale", "Vale", "south"),
            ],
            schools: vec![opt("oak", "Oak School"), opt("elm", "Elm School")],
            branches: vec![opt("main", "Main"), opt("annex", "Annex")],
            languages: vec![opt("en", "English"), opt("es", "Spanish")],
            schedules: vec![opt("am", "Morning"), opt("pm", "Afternoon")],
        };
        let profiles = [
            ("s1", RecipientClass::Student, "5", "north", "n-harbor", "oak", "en", "am"),
            ("s2", RecipientClass::Student, "5", "north", "n-ridge", "oak", "es", "am"),
            ("s3", RecipientClass::Student, "6", "north", "n-harbor", "elm", "en", "pm"),
            ("s4", RecipientClass::Student, "6", "south", "s-vale", "elm", "en", "pm"),
            ("s5", RecipientClass::Student, "5", "south", "s-vale", "oak", "es", "am"),
            ("t1", RecipientClass::Teacher, "5", "north", "n-harbor", "oak", "en", "am"),
            ("t2", RecipientClass::Teacher, "6", "south", "s-vale", "elm", "es", "pm"),
        ];
        store.directory = profiles
            .iter()
            .map(
                |&(id, class, grade, region, city, school, language, schedule)| RecipientProfile {
                    id: id.into(),
                    class,
                    grade: Some(grade.into()),
                    region: Some(region.into()),
                    city: Some(city.into()),
                    school: Some(school.into()),
                    branch: Some("main".into()),
                    language: Some(language.into()),
                    schedule: Some(schedule.into()),
                },
            )
            .collect();
        store
    }

    pub fn add_user(
        &mut self,
        id: &str,
        first_name: &str,
        last_name: &str,
        role: &str,
        token: &str,
        can_broadcast: bool,
    ) {
        self.users.push(StubUser {
            participant: Participant {
                id: id.into(),
                first_name: first_name.into(),
                last_name: last_name.into(),
                role: role.into(),
                avatar_url: None,
            },
            token: token.into(),
            can_broadcast,
        });
    }

    pub fn user_by_token(&self, token: &str) -> Option<&StubUser> {
        self.users.iter().find(|u| u.token == token)
    }

    fn user(&self, id: &str) -> StoreResult<&StubUser> {
        self.users
            .iter()
            .find(|u| u.participant.id == id)
            .ok_or(StoreError::UnknownParticipant)
    }

    fn insert_conversation(
        &mut self,
        name: Option<&str>,
        is_group: bool,
        is_broadcast: bool,
        participants: &[&str],
    ) -> String {
        let id = new_id("conv");
        self.conversations.push(StoredConversation {
            id: id.clone(),
            name: name.map(str::to_string),
            is_group,
            is_broadcast,
            participant_ids: participants.iter().map(|p| p.to_string()).collect(),
            last_activity: now(),
            messages: Vec::new(),
            unread: HashMap::new(),
        });
        id
    }

    /// Conversation visible to `user_id`.
    fn conversation_mut(
        &mut self,
        user_id: &str,
        conversation_id: &str,
    ) -> StoreResult<&mut StoredConversation> {
        let conv = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or(StoreError::NotFound)?;
        if !conv.participant_ids.iter().any(|p| p == user_id) {
            return Err(StoreError::NotFound);
        }
        Ok(conv)
    }

    fn view(&self, conv: &StoredConversation, user_id: &str) -> Conversation {
        Conversation {
            id: conv.id.clone(),
            name: conv.name.clone(),
            is_group: conv.is_group,
            is_broadcast: conv.is_broadcast,
            participants: conv
                .participant_ids
                .iter()
                .filter_map(|id| self.user(id).ok())
                .map(|u| u.participant.clone())
                .collect(),
            last_message: conv.messages.last().map(|m| LastMessage {
                text: m.text.clone(),
                sender_name: m.sender_name.clone(),
                has_audio: m.audio.is_some(),
                created_at: m.created_at,
            }),
            unread_count: conv.unread.get(user_id).copied().unwrap_or(0),
            last_activity: conv.last_activity,
        }
    }

    /// Conversations of a user, most recent activity first.
    pub fn list_conversations(&self, user_id: &str) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.participant_ids.iter().any(|p| p == user_id))
            .map(|c| self.view(c, user_id))
            .collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list
    }

    pub fn create_conversation(
        &mut self,
        user_id: &str,
        participant_ids: &[String],
        name: Option<String>,
    ) -> StoreResult<Conversation> {
        let mut members = vec![user_id.to_string()];
        for id in participant_ids {
            self.user(id)?;
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        if members.len() < 2 {
            return Err(StoreError::UnknownParticipant);
        }
        let refs: Vec<&str> = members.iter().map(String::as_str).collect();
        let is_group = members.len() > 2;
        let id = self.insert_conversation(name.as_deref(), is_group, false, &refs);
        let conv = self
            .conversations
            .iter()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound)?;
        Ok(self.view(conv, user_id))
    }

    pub fn list_messages(&self, user_id: &str, conversation_id: &str) -> StoreResult<Vec<Message>> {
        self.conversations
            .iter()
            .find(|c| c.id == conversation_id && c.participant_ids.iter().any(|p| p == user_id))
            .map(|c| c.messages.clone())
            .ok_or(StoreError::NotFound)
    }

    /// Append a message as `author` at a given time, bypassing request checks.
    pub fn seed_message(
        &mut self,
        conversation_id: &str,
        author: &str,
        text: &str,
        created_at: i64,
    ) -> StoreResult<Message> {
        let sender_name = self.user(author)?.participant.display_name();
        let conv = self.conversation_mut(author, conversation_id)?;
        let message = Message {
            id: new_id("msg"),
            conversation_id: conversation_id.into(),
            text: text.into(),
            audio: None,
            sender_id: author.into(),
            sender_name,
            status: DeliveryStatus::Delivered,
            edited: false,
            created_at,
            recipient_count: None,
        };
        push_message(conv, message.clone());
        Ok(message)
    }

    pub fn send_message(
        &mut self,
        user_id: &str,
        conversation_id: &str,
        req: &SendMessageRequest,
    ) -> StoreResult<Message> {
        let text = req.text.as_deref().unwrap_or("").trim().to_string();
        let audio = match &req.audio_url {
            Some(url) => Some(AudioAttachment::new(
                url.clone(),
                req.audio_duration_seconds
                    .or_else(|| self.audio_duration(url))
                    .unwrap_or(0),
            )),
            None => None,
        };
        if text.is_empty() && audio.is_none() {
            return Err(StoreError::EmptyMessage);
        }
        let sender = self.user(user_id)?;
        let sender_name = sender.participant.display_name();
        let can_broadcast = sender.can_broadcast;
        let recipient_count = match &req.broadcast_filter {
            Some(filter) => Some(self.resolve(filter)),
            None => None,
        };
        let conv = self.conversation_mut(user_id, conversation_id)?;
        match (conv.is_broadcast, recipient_count) {
            (true, Some(_)) if can_broadcast => {}
            (true, _) => return Err(StoreError::Forbidden),
            (false, Some(_)) => return Err(StoreError::InvalidBroadcast),
            (false, None) => {}
        }
        let message = Message {
            id: new_id("msg"),
            conversation_id: conversation_id.into(),
            text,
            audio,
            sender_id: user_id.into(),
            sender_name,
            status: DeliveryStatus::Sent,
            edited: false,
            created_at: now(),
            recipient_count,
        };
        push_message(conv, message.clone());
        Ok(message)
    }

    pub fn edit_message(
        &mut self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> StoreResult<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        let conv = self.conversation_mut(user_id, conversation_id)?;
        let message = conv
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(StoreError::NotFound)?;
        if message.sender_id != user_id {
            return Err(StoreError::Forbidden);
        }
        if now() - message.created_at >= EDIT_WINDOW_SECS {
            return Err(StoreError::EditWindowExpired);
        }
        message.text = text.to_string();
        message.edited = true;
        Ok(message.clone())
    }

    pub fn delete_message(
        &mut self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> StoreResult<()> {
        let conv = self.conversation_mut(user_id, conversation_id)?;
        let pos = conv
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(StoreError::NotFound)?;
        if conv.messages[pos].sender_id != user_id {
            return Err(StoreError::Forbidden);
        }
        conv.messages.remove(pos);
        Ok(())
    }

    pub fn mark_read(&mut self, user_id: &str, conversation_id: &str) -> StoreResult<()> {
        let conv = self.conversation_mut(user_id, conversation_id)?;
        conv.unread.insert(user_id.to_string(), 0);
        for m in conv.messages.iter_mut().filter(|m| m.sender_id != user_id) {
            m.status = DeliveryStatus::Read;
        }
        Ok(())
    }

    /// Store an audio object and return its service-relative URL.
    pub fn put_audio(&mut self, data: Bytes, duration_secs: u32) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.audio.insert(id.clone(), AudioObject { data, duration_secs });
        format!("api/audio-objects/{id}")
    }

    pub fn audio(&self, id: &str) -> Option<AudioObject> {
        self.audio.get(id).cloned()
    }

    fn audio_duration(&self, url: &str) -> Option<u32> {
        let id = url.rsplit('/').next()?;
        self.audio.get(id).map(|a| a.duration_secs)
    }

    pub fn filter_options(&self) -> FilterOptions {
        self.options.clone()
    }

    pub fn resolve(&self, filter: &BroadcastFilter) -> u32 {
        self.directory.iter().filter(|r| filter.matches(r)).count() as u32
    }
}

fn push_message(conv: &mut StoredConversation, message: Message) {
    conv.last_activity = message.created_at.max(conv.last_activity);
    for p in conv.participant_ids.iter().filter(|p| **p != message.sender_id) {
        *conv.unread.entry(p.clone()).or_default() += 1;
    }
    conv.messages.push(message);
}
