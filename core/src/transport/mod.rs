//! Request/response client for the conversation and audio-object services.

use async_trait::async_trait;
use bytes::Bytes;
use chat_api::{
    BroadcastFilter, Conversation, CreateConversationRequest, EditMessageRequest, ErrorBody,
    FilterOptions, Message, ResolveRecipientsRequest, ResolveRecipientsResponse,
    SendMessageRequest, UploadResponse,
};
use futures::{stream::BoxStream, StreamExt};
use reqwest::{multipart, Client, Response};
use tracing::debug;
use url::Url;

use crate::error::{ChatError, Result};

pub mod mock;

/// Streamed body of an audio object.
pub struct AudioDownload {
    /// Total size when the service reports it.
    pub total_bytes: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for AudioDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDownload")
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Calls consumed from the conversation, audio-object and broadcast
/// services. Every call is independent; failures surface as [`ChatError`].
#[async_trait]
pub trait ConversationTransport: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn create_conversation(&self, req: &CreateConversationRequest) -> Result<Conversation>;
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
    async fn send_message(&self, conversation_id: &str, req: &SendMessageRequest)
        -> Result<Message>;
    async fn edit_message(&self, conversation_id: &str, req: &EditMessageRequest)
        -> Result<Message>;
    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()>;
    async fn mark_read(&self, conversation_id: &str) -> Result<()>;
    /// Upload an encoded voice buffer, returning its object URL.
    async fn upload_audio(&self, encoded: Bytes, duration_secs: u32) -> Result<String>;
    async fn download_audio(&self, url: &str) -> Result<AudioDownload>;
    async fn filter_options(&self) -> Result<FilterOptions>;
    async fn resolve_recipients(&self, filter: &BroadcastFilter) -> Result<u32>;
}

/// HTTP implementation of [`ConversationTransport`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(client: Client, base_url: &str, token: impl Into<String>) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client,
            base,
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    /// `api/conversations/{id}/{tail}` with the id percent-encoded as one
    /// path segment.
    fn conversation_url(&self, conversation_id: &str, tail: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["api", "conversations", conversation_id, tail]);
        Ok(url)
    }

    fn messages_url(&self, conversation_id: &str) -> Result<Url> {
        self.conversation_url(conversation_id, "messages")
    }

    /// The token only goes to the service's own origin.
    fn sends_token_to(&self, url: &Url) -> bool {
        url.origin() == self.base.origin()
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text)
        .map(|e| e.error)
        .unwrap_or(text);
    Err(ChatError::Status { status, body })
}

#[async_trait]
impl ConversationTransport for HttpTransport {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let url = self.endpoint("api/conversations")?;
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn create_conversation(&self, req: &CreateConversationRequest) -> Result<Conversation> {
        let url = self.endpoint("api/conversations")?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let url = self.messages_url(conversation_id)?;
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        req: &SendMessageRequest,
    ) -> Result<Message> {
        let url = self.messages_url(conversation_id)?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        req: &EditMessageRequest,
    ) -> Result<Message> {
        let url = self.messages_url(conversation_id)?;
        let resp = self
            .client
            .patch(url)
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        let url = self.messages_url(conversation_id)?;
        let resp = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .query(&[("message_id", message_id)])
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let url = self.conversation_url(conversation_id, "read")?;
        let resp = self.client.post(url).bearer_auth(&self.token).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn upload_audio(&self, encoded: Bytes, duration_secs: u32) -> Result<String> {
        let url = self.endpoint("api/audio-objects")?;
        let size = encoded.len();
        let part = multipart::Part::bytes(encoded.to_vec())
            .file_name("voice.webm")
            .mime_str("audio/webm")?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("duration_seconds", duration_secs.to_string());
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadResponse = check(resp).await?.json().await?;
        debug!(bytes = size, duration_secs, url = %uploaded.url, "voice uploaded");
        Ok(uploaded.url)
    }

    async fn download_audio(&self, url: &str) -> Result<AudioDownload> {
        let url = self.endpoint(url)?;
        let mut req = self.client.get(url.clone());
        if self.sends_token_to(&url) {
            req = req.bearer_auth(&self.token);
        } else {
            debug!(host = ?url.host_str(), "downloading foreign audio object without token");
        }
        let resp = check(req.send().await?).await?;
        let total_bytes = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(ChatError::from))
            .boxed();
        Ok(AudioDownload { total_bytes, body })
    }

    async fn filter_options(&self) -> Result<FilterOptions> {
        let url = self.endpoint("api/broadcast/filter-options")?;
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn resolve_recipients(&self, filter: &BroadcastFilter) -> Result<u32> {
        let url = self.endpoint("api/broadcast/resolve-recipients")?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&ResolveRecipientsRequest {
                filter: filter.clone(),
            })
            .send()
            .await?;
        let resolved: ResolveRecipientsResponse = check(resp).await?.json().await?;
        Ok(resolved.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash() {
        let t = HttpTransport::new("http://127.0.0.1:9000/school", "t").unwrap();
        assert_eq!(
            t.endpoint("api/conversations").unwrap().as_str(),
            "http://127.0.0.1:9000/school/api/conversations"
        );
    }

    #[test]
    fn absolute_object_urls_pass_through() {
        let t = HttpTransport::new("http://127.0.0.1:9000", "t").unwrap();
        assert_eq!(
            t.endpoint("http://cdn.example/a/1.webm").unwrap().as_str(),
            "http://cdn.example/a/1.webm"
        );
    }

    #[test]
    fn token_stays_with_service_origin() {
        let t = HttpTransport::new("http://127.0.0.1:9000/school", "t").unwrap();
        let own = t.endpoint("api/audio-objects/1").unwrap();
        assert!(t.sends_token_to(&own));
        let foreign = t.endpoint("http://cdn.example/a/1.webm").unwrap();
        assert!(!t.sends_token_to(&foreign));
        let other_port = t.endpoint("http://127.0.0.1:9001/api/audio-objects/1").unwrap();
        assert!(!t.sends_token_to(&other_port));
    }

    #[test]
    fn conversation_ids_are_one_path_segment() {
        let t = HttpTransport::new("http://127.0.0.1:9000/school", "t").unwrap();
        assert_eq!(
            t.messages_url("c1").unwrap().as_str(),
            "http://127.0.0.1:9000/school/api/conversations/c1/messages"
        );
        assert_eq!(
            t.conversation_url("a/b c?x", "read").unwrap().as_str(),
            "http://127.0.0.1:9000/school/api/conversations/a%2Fb%20c%3Fx/read"
        );
    }

    #[test]
    fn invalid_base_is_rejected() {
        assert!(matches!(
            HttpTransport::new("not a url", "t"),
            Err(ChatError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpTransport::new("mailto:ops@example.org", "t"),
            Err(ChatError::InvalidUrl(_))
        ));
    }
}
