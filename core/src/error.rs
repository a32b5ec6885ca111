//! Error types for the client core.
//!
//! Every failure a caller can observe is a [`ChatError`]. Validation
//! failures are raised locally before any transport call is made.

use reqwest::StatusCode;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Network-level failure (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// A response body could not be interpreted.
    #[error("malformed response: {0}")]
    Decode(String),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("rejected: {0}")]
    Validation(#[from] ValidationError),

    /// The caller lacks the capability for this operation.
    #[error("not authorized: {0}")]
    NotAuthorized(&'static str),

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("message {0} not found")]
    NotFound(String),

    #[error("invalid service url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e)
        }
    }
}

impl ChatError {
    /// Transport and server-side failures that leave local state revertible.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status { .. })
    }
}

/// Local precondition failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message text is empty")]
    EmptyText,
    #[error("message is still awaiting confirmation")]
    Provisional,
    #[error("edit window of {window_secs}s has elapsed")]
    EditWindowExpired { window_secs: u64 },
    #[error("a recording session is already active")]
    RecordingActive,
    #[error("no recording session is active")]
    NotRecording,
    #[error("recipient count must be resolved and non-zero")]
    NoRecipients,
    #[error("recipient count is still resolving")]
    Resolving,
    #[error("operation not allowed while player is {0}")]
    PlayerState(&'static str),
}

/// Failures of the audio devices and decoder seams.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("microphone unavailable: {0}")]
    Microphone(String),
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("download interrupted: {0}")]
    Download(String),
    #[error("cancelled")]
    Cancelled,
}
