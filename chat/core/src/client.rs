//! HTTP API Client
//!
//! REST client for the review backend.
//!
//! # Endpoints
//!
//! - `GET /chats`, `POST /chats`, `PUT /chats/{id}`, `DELETE /chats/{id}`
//! - `GET /chats/{id}/messages`
//! - `POST /chat` - one complete reply
//! - `POST /chat/stream` - `text/event-stream` reply
//! - `POST /analyze-pr`, `POST /analyze-commit`, `POST /pr/review`
//! - `GET /health`
//!
//! Non-streaming requests use the configured request timeout. Streaming
//! requests only have a connect timeout: a reply can legitimately take
//! minutes, and stalls are caught by the per-chunk idle timeout of the
//! frame stream.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::config::ClientConfig;
use crate::messages::{
    ChatId, ChatRecord, ChatResponse, HealthStatus, Message, ReviewAction, DEFAULT_CHAT_TITLE,
};
use crate::transport::{ByteStream, TransportError};

/// MIME type of a streamed reply
pub const EVENT_STREAM: &str = "text/event-stream";

/// The two ways of requesting an assistant reply
///
/// Implemented by [`HttpChatClient`]; tests substitute scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Request a complete reply (`POST /chat`)
    async fn send_message(&self, chat_id: &ChatId, text: &str)
        -> Result<ChatResponse, TransportError>;

    /// Request a streamed reply (`POST /chat/stream`)
    ///
    /// Resolves once the response headers arrive; the body is returned as
    /// raw chunks.
    async fn stream_message(&self, chat_id: &ChatId, text: &str)
        -> Result<ByteStream, TransportError>;
}

#[derive(Serialize)]
struct SendBody<'a> {
    chat_id: &'a ChatId,
    message: &'a str,
}

/// Review backend client
#[derive(Clone, Debug)]
pub struct HttpChatClient {
    base_url: String,
    request_timeout: std::time::Duration,
    http_client: reqwest::Client,
}

impl HttpChatClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            http_client,
        })
    }

    /// Backend base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn chat_url(&self, chat_id: &ChatId) -> String {
        self.url(&format!("/chats/{chat_id}"))
    }

    /// Send with the request timeout and map non-2xx to an error
    async fn execute(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = request.timeout(self.request_timeout).send().await?;
        check_status(response).await
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = self.execute(request).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// List all conversations
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn list_chats(&self) -> Result<Vec<ChatRecord>, TransportError> {
        self.execute_json(self.http_client.get(self.url("/chats")))
            .await
    }

    /// Create a conversation (titled "New Chat" unless given)
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn create_chat(&self, title: Option<&str>) -> Result<ChatRecord, TransportError> {
        let title = title.unwrap_or(DEFAULT_CHAT_TITLE);
        let record: ChatRecord = self
            .execute_json(self.http_client.post(self.url("/chats")).json(&json!({ "title": title })))
            .await?;
        tracing::debug!(chat_id = %record.id, "Created chat");
        Ok(record)
    }

    /// Rename a conversation
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn update_chat_title(
        &self,
        chat_id: &ChatId,
        title: &str,
    ) -> Result<ChatRecord, TransportError> {
        self.execute_json(
            self.http_client
                .put(self.chat_url(chat_id))
                .json(&json!({ "title": title })),
        )
        .await
    }

    /// Delete a conversation
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn delete_chat(&self, chat_id: &ChatId) -> Result<(), TransportError> {
        self.execute(self.http_client.delete(self.chat_url(chat_id)))
            .await?;
        tracing::debug!(chat_id = %chat_id, "Deleted chat");
        Ok(())
    }

    /// Persisted messages of a conversation, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn get_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, TransportError> {
        self.execute_json(
            self.http_client
                .get(self.url(&format!("/chats/{chat_id}/messages"))),
        )
        .await
    }

    /// Run a PR analysis directly
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn analyze_pr(
        &self,
        pr_url: &str,
        analysis_type: &str,
    ) -> Result<serde_json::Value, TransportError> {
        self.execute_json(
            self.http_client
                .post(self.url("/analyze-pr"))
                .query(&[("pr_url", pr_url), ("analysis_type", analysis_type)]),
        )
        .await
    }

    /// Run a commit analysis directly
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn analyze_commit(&self, commit_url: &str) -> Result<serde_json::Value, TransportError> {
        self.execute_json(
            self.http_client
                .post(self.url("/analyze-commit"))
                .query(&[("commit_url", commit_url)]),
        )
        .await
    }

    /// Submit a review on a pull request
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn submit_review(
        &self,
        pr_url: &str,
        action: ReviewAction,
        body: &str,
    ) -> Result<serde_json::Value, TransportError> {
        self.execute_json(self.http_client.post(self.url("/pr/review")).json(&json!({
            "pr_url": pr_url,
            "review_type": action,
            "body": body,
        })))
        .await
    }

    /// Backend health
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn health(&self) -> Result<HealthStatus, TransportError> {
        self.execute_json(self.http_client.get(self.url("/health")))
            .await
    }
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), body = %body, "Backend returned error status");
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChatBackend for HttpChatClient {
    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
    ) -> Result<ChatResponse, TransportError> {
        self.execute_json(self.http_client.post(self.url("/chat")).json(&SendBody {
            chat_id,
            message: text,
        }))
        .await
    }

    async fn stream_message(
        &self,
        chat_id: &ChatId,
        text: &str,
    ) -> Result<ByteStream, TransportError> {
        let response = self
            .http_client
            .post(self.url("/chat/stream"))
            .header(ACCEPT, EVENT_STREAM)
            .json(&SendBody {
                chat_id,
                message: text,
            })
            .send()
            .await?;
        let response = check_status(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(EVENT_STREAM) {
            tracing::debug!(content_type, "Stream response has unexpected content type");
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed())
    }
}
