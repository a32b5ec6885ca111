use serde::{Deserialize, Serialize};

mod filter;

pub use filter::{
    BroadcastFilter, CityOption, Dimension, FilterOption, FilterOptions, RecipientClass,
    RecipientProfile,
};

/// Prefix reserved for locally generated message ids. The server never
/// issues ids starting with it.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Returns true when `id` was generated on the client and is still awaiting
/// a server-assigned identity.
pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// Member of a conversation as seen in the conversation list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Participant {
    pub fn display_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (false, true) => self.first_name.clone(),
            _ => self.last_name.clone(),
        }
    }
}

/// Summary of the newest message, shown in the conversation list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LastMessage {
    #[serde(default)]
    pub text: String,
    pub sender_name: String,
    #[serde(default)]
    pub has_audio: bool,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_broadcast: bool,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    pub last_activity: i64,
}

/// Delivery state reported by the server for a confirmed message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Audio,
}

/// Voice recording attached to a message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AudioAttachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub duration_secs: u32,
}

impl AudioAttachment {
    pub fn new(url: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            kind: AttachmentKind::Audio,
            url: url.into(),
            duration_secs,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub audio: Option<AudioAttachment>,
    pub sender_id: String,
    pub sender_name: String,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub edited: bool,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_count: Option<u32>,
}

impl Message {
    pub fn is_provisional(&self) -> bool {
        is_provisional_id(&self.id)
    }
}

/// Body of `POST conversations`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CreateConversationRequest {
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of `POST conversations/{id}/messages`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_filter: Option<BroadcastFilter>,
}

/// Body of `PATCH conversations/{id}/messages`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EditMessageRequest {
    pub message_id: String,
    pub text: String,
}

/// Query of `DELETE conversations/{id}/messages`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeleteMessageQuery {
    pub message_id: String,
}

/// Response of `POST audio-objects`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResolveRecipientsRequest {
    pub filter: BroadcastFilter,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ResolveRecipientsResponse {
    pub count: u32,
}

/// Error payload returned by the service on non-2xx responses.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}
