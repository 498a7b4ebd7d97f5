//! End-to-end streaming tests
//!
//! These tests drive the full pipeline (HTTP client, SSE decoder, event
//! parser, session, dispatcher, store) against a mock backend.
//! Tests cover:
//! - Cumulative updates and a single persisted reply
//! - Malformed frames, mid-stream errors, HTTP failures
//! - Cancellation and cancel-and-replace
//! - Metadata merging and renames around the terminal event
//! - Chunk boundaries anywhere in the byte stream

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use review_chat_core::session::{run_stream, SessionUpdate, StreamSession};
use review_chat_core::transport::{frame_stream, ByteStream};
use review_chat_core::{
    ChatBackend, ChatId, ChatResponse, ChatUpdate, ClientConfig, DispatchError, Dispatcher,
    HttpChatClient, MessageId, MessageRole, StreamMode, TransportError,
};

// =============================================================================
// Helpers
// =============================================================================

fn sse(frames: &[&str]) -> String {
    frames.iter().map(|f| format!("data: {f}\n\n")).collect()
}

async fn mock_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
}

fn http_dispatcher(server: &MockServer) -> (Dispatcher<HttpChatClient>, ChatId) {
    let config = ClientConfig::with_base_url(server.uri());
    let client = HttpChatClient::new(&config).unwrap();
    let mut dispatcher = Dispatcher::new(client, &config);
    let chat = dispatcher.store_mut().create_conversation();
    (dispatcher, chat)
}

fn roles<B: ChatBackend>(dispatcher: &Dispatcher<B>, chat: &ChatId) -> Vec<MessageRole> {
    dispatcher
        .store()
        .get(chat)
        .unwrap()
        .messages
        .iter()
        .map(|m| m.role)
        .collect()
}

/// Backend whose stream emits fixed chunks and then never ends
struct StallingBackend {
    chunks: Vec<&'static str>,
}

#[async_trait]
impl ChatBackend for StallingBackend {
    async fn send_message(
        &self,
        _chat_id: &ChatId,
        _text: &str,
    ) -> Result<ChatResponse, TransportError> {
        Err(TransportError::Decode("buffered mode not scripted".to_string()))
    }

    async fn stream_message(
        &self,
        _chat_id: &ChatId,
        _text: &str,
    ) -> Result<ByteStream, TransportError> {
        let chunks: Vec<Result<Bytes, TransportError>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        Ok(stream::iter(chunks).chain(stream::pending()).boxed())
    }
}

// =============================================================================
// Streaming pipeline
// =============================================================================

#[tokio::test]
async fn test_cumulative_updates_and_single_reply() {
    let server = MockServer::start().await;
    mock_stream(
        &server,
        sse(&[
            r#"{"content":"Hel"}"#,
            r#"{"content":"lo"}"#,
            r#"{"done":true,"id":"m1"}"#,
        ]),
    )
    .await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    dispatcher.send(&chat, "hi", StreamMode::Streaming).unwrap();
    let updates = dispatcher.settle(&chat).await;

    let streamed: Vec<&str> = updates
        .iter()
        .filter_map(|u| match u {
            ChatUpdate::Streaming { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, vec!["Hel", "Hello"]);

    let conversation = dispatcher.store().get(&chat).unwrap();
    let assistants: Vec<_> = conversation
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .collect();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].content, "Hello");
    assert_eq!(assistants[0].id, MessageId::from("m1"));
    assert!(!conversation.is_streaming());
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let server = MockServer::start().await;
    mock_stream(
        &server,
        sse(&[
            r#"{"content":"Hel"}"#,
            r#"{"content": not json"#,
            r#"{"content":"lo"}"#,
            r#"{"done":true,"id":"m1"}"#,
        ]),
    )
    .await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    dispatcher.send(&chat, "hi", StreamMode::Streaming).unwrap();
    dispatcher.settle(&chat).await;

    let conversation = dispatcher.store().get(&chat).unwrap();
    assert_eq!(conversation.last_message().unwrap().content, "Hello");
    assert_eq!(conversation.error(), None);
}

#[tokio::test]
async fn test_metadata_merges_into_reply() {
    let server = MockServer::start().await;
    mock_stream(
        &server,
        sse(&[
            r#"{"pr_metadata":{"pr_title":"Add cache","pr_state":"open","additions":10}}"#,
            r#"{"content":"Reviewing the cache change."}"#,
            r#"{"pr_metadata":{"additions":12,"pr_merged":true}}"#,
            r#"{"done":true,"id":"m5"}"#,
        ]),
    )
    .await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    let info = dispatcher
        .send(&chat, "https://github.com/o/r/pull/42", StreamMode::Streaming)
        .unwrap();
    assert_eq!(info.url_kind, Some(review_chat_core::UrlKind::PullRequest));
    dispatcher.settle(&chat).await;

    let reply = dispatcher.store().get(&chat).unwrap().last_message().unwrap().clone();
    let pr = reply.pr_metadata.unwrap();
    assert_eq!(pr.pr_title.as_deref(), Some("Add cache"));
    assert_eq!(pr.pr_state.as_deref(), Some("open"));
    assert_eq!(pr.additions, Some(12));
    assert_eq!(pr.pr_merged, Some(true));
}

#[tokio::test]
async fn test_mid_stream_error_keeps_user_message() {
    let server = MockServer::start().await;
    mock_stream(
        &server,
        sse(&[r#"{"content":"Hel"}"#, r#"{"error":"GitHub rate limit exceeded"}"#]),
    )
    .await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    dispatcher.send(&chat, "hi", StreamMode::Streaming).unwrap();
    dispatcher.settle(&chat).await;

    let conversation = dispatcher.store().get(&chat).unwrap();
    assert_eq!(roles(&dispatcher, &chat), vec![MessageRole::User]);
    assert_eq!(conversation.error(), Some("GitHub rate limit exceeded"));
    assert!(!conversation.is_streaming());
}

#[tokio::test]
async fn test_http_failure_sets_error_slot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    dispatcher.send(&chat, "hi", StreamMode::Streaming).unwrap();
    let updates = dispatcher.settle(&chat).await;

    assert!(matches!(updates.as_slice(), [ChatUpdate::Failed { .. }]));
    let conversation = dispatcher.store().get(&chat).unwrap();
    assert!(conversation.error().unwrap().contains("503"));
    assert_eq!(roles(&dispatcher, &chat), vec![MessageRole::User]);

    dispatcher.store_mut().dismiss_error(&chat).unwrap();
    assert_eq!(dispatcher.store().get(&chat).unwrap().error(), None);
}

#[tokio::test]
async fn test_stream_closed_without_done() {
    let server = MockServer::start().await;
    mock_stream(&server, sse(&[r#"{"content":"partial"}"#])).await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    dispatcher.send(&chat, "hi", StreamMode::Streaming).unwrap();
    dispatcher.settle(&chat).await;

    let reply = dispatcher.store().get(&chat).unwrap().last_message().unwrap().clone();
    assert_eq!(reply.role, MessageRole::Assistant);
    assert_eq!(reply.content, "partial");
}

// =============================================================================
// Buffered mode
// =============================================================================

#[tokio::test]
async fn test_buffered_mode_single_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_json(serde_json::json!({"chat_id": "c1", "message": "hello"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"id":"m3","content":"Hi!","commit_metadata":{"commit_sha":"abc1234"}}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let config = ClientConfig::with_base_url(server.uri());
    let mut dispatcher = Dispatcher::new(HttpChatClient::new(&config).unwrap(), &config);
    let now = chrono::Utc::now();
    dispatcher
        .store_mut()
        .insert_conversation(review_chat_core::ChatRecord {
            id: ChatId::from("c1"),
            title: "New Chat".to_string(),
            created_at: now,
            updated_at: now,
        });
    let chat = ChatId::from("c1");

    dispatcher.send(&chat, "hello", StreamMode::Buffered).unwrap();
    let updates = dispatcher.settle(&chat).await;

    assert!(matches!(updates.as_slice(), [ChatUpdate::Completed { .. }]));
    let reply = dispatcher.store().get(&chat).unwrap().last_message().unwrap().clone();
    assert_eq!(reply.content, "Hi!");
    assert_eq!(
        reply.commit_metadata.unwrap().commit_sha.as_deref(),
        Some("abc1234")
    );
}

// =============================================================================
// Renames around the terminal event
// =============================================================================

#[tokio::test]
async fn test_rename_before_and_after_completion() {
    let server = MockServer::start().await;
    mock_stream(
        &server,
        sse(&[r#"{"content":"Sure."}"#, r#"{"done":true,"id":"m1","new_title":"Cache review"}"#]),
    )
    .await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    // User renames while the reply streams; the server title arrives later
    dispatcher.send(&chat, "review please", StreamMode::Streaming).unwrap();
    dispatcher.store_mut().edit_title(&chat, "Mine").unwrap();
    let updates = dispatcher.settle(&chat).await;
    assert!(updates
        .iter()
        .any(|u| matches!(u, ChatUpdate::Renamed { title, .. } if title == "Cache review")));
    assert_eq!(dispatcher.store().get(&chat).unwrap().title, "Cache review");

    // Rename after the reply completed
    dispatcher.store_mut().edit_title(&chat, "Final name").unwrap();
    assert_eq!(dispatcher.store().get(&chat).unwrap().title, "Final name");
    assert_eq!(dispatcher.store().get(&chat).unwrap().messages.len(), 2);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_after_first_chunk() {
    let backend = StallingBackend {
        chunks: vec!["data: {\"content\":\"Hel\"}\n\n"],
    };
    let config = ClientConfig::default();
    let mut dispatcher = Dispatcher::new(backend, &config);
    let chat = dispatcher.store_mut().create_conversation();

    dispatcher.send(&chat, "hi", StreamMode::Streaming).unwrap();
    let first = dispatcher.next_update(&chat).await.unwrap();
    assert!(matches!(first, ChatUpdate::Streaming { ref content, .. } if content == "Hel"));

    assert!(dispatcher.cancel(&chat).unwrap());
    assert!(dispatcher.settle(&chat).await.is_empty());

    let conversation = dispatcher.store().get(&chat).unwrap();
    assert_eq!(roles(&dispatcher, &chat), vec![MessageRole::User]);
    assert_eq!(conversation.error(), None);
    assert!(!conversation.is_streaming());
}

#[tokio::test]
async fn test_single_active_stream_per_conversation() {
    let backend = StallingBackend {
        chunks: vec!["data: {\"content\":\"partial\"}\n"],
    };
    let config = ClientConfig::default();
    let mut dispatcher = Dispatcher::new(backend, &config);
    let chat = dispatcher.store_mut().create_conversation();
    let other = dispatcher.store_mut().create_conversation();

    dispatcher.send(&chat, "first", StreamMode::Streaming).unwrap();
    dispatcher.send(&other, "elsewhere", StreamMode::Streaming).unwrap();
    dispatcher.send(&chat, "second", StreamMode::Streaming).unwrap();

    assert_eq!(dispatcher.active_count(), 2);
    assert!(dispatcher.store().get(&chat).unwrap().is_streaming());

    dispatcher.cancel_all();
    assert_eq!(dispatcher.active_count(), 0);
    assert_eq!(
        roles(&dispatcher, &chat),
        vec![MessageRole::User, MessageRole::User]
    );
}

#[tokio::test]
async fn test_empty_submission_never_reaches_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let (mut dispatcher, chat) = http_dispatcher(&server);

    assert_eq!(
        dispatcher.send(&chat, "  \n ", StreamMode::Streaming),
        Err(DispatchError::EmptyMessage)
    );
    assert!(dispatcher.store().get(&chat).unwrap().messages.is_empty());
}

// =============================================================================
// Chunk boundaries
// =============================================================================

async fn completed_content(chunks: Vec<Vec<u8>>) -> String {
    let body: Vec<Result<Bytes, TransportError>> =
        chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
    let (tx, mut rx) = mpsc::channel(64);
    run_stream(
        frame_stream(stream::iter(body)),
        StreamSession::new(),
        CancellationToken::new(),
        tx,
    )
    .await;

    let mut last = None;
    while let Some(update) = rx.recv().await {
        last = Some(update);
    }
    match last {
        Some(SessionUpdate::Completed(reply)) => reply.content,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_chunking_does_not_change_result() {
    let body = sse(&[
        r#"{"content":"Größe "}"#,
        r#"{"content":"passt ✓"}"#,
        r#"{"done":true,"id":"m1"}"#,
    ])
    .into_bytes();

    let whole = completed_content(vec![body.clone()]).await;
    assert_eq!(whole, "Größe passt ✓");

    for split in 1..body.len() {
        let (a, b) = body.split_at(split);
        let content = completed_content(vec![a.to_vec(), b.to_vec()]).await;
        assert_eq!(content, whole, "split at {split}");
    }

    let bytewise: Vec<Vec<u8>> = body.iter().map(|b| vec![*b]).collect();
    assert_eq!(completed_content(bytewise).await, whole);
}
