//! Review Chat Core - Streaming Conversations with a Code Review Backend
//!
//! This crate is the client side of a conversational code-review assistant:
//! it sends user messages (often containing GitHub PR or commit links) to the
//! review backend and turns the streamed reply into conversation state. It
//! has no UI dependencies; a terminal, desktop, or headless surface drives it
//! through the [`Dispatcher`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         UI / CLI surface                          │
//! └───────────────┬──────────────────────────────────▲───────────────┘
//!          send / cancel                        ChatUpdate
//! ┌───────────────┼──────────────────────────────────┼───────────────┐
//! │               ▼            REVIEW CHAT CORE      │               │
//! │  ┌─────────────────────┐                ┌────────┴────────────┐  │
//! │  │     Dispatcher      │───── owns ────▶│  ConversationStore  │  │
//! │  └──────────┬──────────┘                └────────▲────────────┘  │
//! │        spawn│ (one task per exchange)            │ apply in order │
//! │  ┌──────────▼──────────────────────────────────┐ │               │
//! │  │ HttpChatClient ─▶ SseDecoder ─▶ parse_frame │ │               │
//! │  │                        ─▶ StreamSession ────┼─┘ mpsc          │
//! │  └─────────────────────────────────────────────┘                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use review_chat_core::{load_config, Dispatcher, HttpChatClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let client = HttpChatClient::new(&config)?;
//!     let mut dispatcher = Dispatcher::new(client, &config);
//!
//!     let chat = dispatcher.store_mut().create_conversation();
//!     dispatcher.send(&chat, "https://github.com/o/r/pull/1", config.default_mode)?;
//!
//!     while let Some(update) = dispatcher.next_update(&chat).await {
//!         // Render update
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: SSE byte-stream decoding and transport errors
//! - [`events`]: Typed events decoded from one frame
//! - [`session`]: Per-exchange accumulation and the reader loop
//! - [`store`]: Conversations, transcripts, streaming buffers, error slot
//! - [`dispatcher`]: Sending, cancelling, and applying updates
//! - [`client`]: REST client for the review backend
//! - [`github`]: PR and commit link detection
//! - [`messages`]: Wire data types and metadata merging
//! - [`config`]: TOML + environment configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod github;
pub mod messages;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use client::{ChatBackend, HttpChatClient};
pub use dispatcher::{ChatUpdate, DispatchError, Dispatcher, RequestHandleInfo};
pub use events::{parse_frame, Completion, StreamEvent};
pub use github::{detect_url_kind, find_commit_url, find_pr_url, InputAffordance, UrlKind};
pub use messages::{
    ChatId, ChatRecord, ChatResponse, CommitMetadata, HealthStatus, Message, MessageId,
    MessageRole, PrMetadata, ReviewAction,
};
pub use session::{SessionState, SessionUpdate, StreamSession};
pub use store::{Conversation, ConversationStore, StoreError};
pub use transport::{SseDecoder, TransportError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ClientConfig, ConfigError,
    ConfigOverrides, ConfigSource, StreamMode,
};
