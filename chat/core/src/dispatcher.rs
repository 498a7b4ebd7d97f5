//! Request Dispatcher
//!
//! Sends a user message, runs the reply in a background task, and applies the
//! task's updates to the [`ConversationStore`].
//!
//! # Architecture
//!
//! ```text
//!  send() ──▶ store: user message + streaming buffer
//!    │
//!    └─▶ tokio task ─ backend ─▶ SSE decoder ─▶ parser ─▶ session
//!                                                           │
//!                          mpsc (bounded, decode order) ◀───┘
//!                                   │
//!  next_update() / poll_updates() ◀─┘ ──▶ store mutation ──▶ ChatUpdate
//! ```
//!
//! Reader tasks never touch the store. Every mutation happens on the task
//! that owns the dispatcher, in the order the updates were decoded.
//!
//! # Cancellation
//!
//! Each exchange has a [`CancellationToken`]. It fires on [`Dispatcher::cancel`],
//! on a new send to the same conversation (cancel-and-replace), when the
//! conversation is deleted, and when the dispatcher is dropped. The handle's
//! receiver is dropped at the same time, so nothing from a cancelled exchange
//! is ever applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::client::ChatBackend;
use crate::config::{ClientConfig, StreamMode};
use crate::github::{detect_url_kind, UrlKind};
use crate::messages::{ChatId, Message};
use crate::session::{run_stream, CompletedReply, SessionState, SessionUpdate, StreamSession};
use crate::store::{ConversationStore, StoreError};
use crate::transport::frame_stream_with_idle_timeout;

/// Reason shown when a buffered request fails
pub const SEND_FAILED_REASON: &str = "Failed to send message. Please try again.";

/// Reason shown when a reply task stops without a result
pub const TASK_LOST_REASON: &str = "reply ended unexpectedly";

// ============================================================================
// Types
// ============================================================================

/// Dispatch errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Empty or whitespace-only submissions are never sent
    #[error("message is empty")]
    EmptyMessage,

    /// Store rejected the operation
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Change applied to the store, reported to the caller
#[derive(Clone, Debug, PartialEq)]
pub enum ChatUpdate {
    /// The in-flight reply grew
    Streaming {
        /// Conversation
        chat_id: ChatId,
        /// Cumulative reply content
        content: String,
    },
    /// The reply was persisted
    Completed {
        /// Conversation
        chat_id: ChatId,
        /// The new assistant message
        message: Message,
    },
    /// The conversation got a new title
    Renamed {
        /// Conversation
        chat_id: ChatId,
        /// New title
        title: String,
    },
    /// The reply failed; the error slot is set
    Failed {
        /// Conversation
        chat_id: ChatId,
        /// Reason shown to the user
        reason: String,
    },
}

impl ChatUpdate {
    /// Conversation this update belongs to
    #[must_use]
    pub fn chat_id(&self) -> &ChatId {
        match self {
            Self::Streaming { chat_id, .. }
            | Self::Completed { chat_id, .. }
            | Self::Renamed { chat_id, .. }
            | Self::Failed { chat_id, .. } => chat_id,
        }
    }
}

/// Summary of a dispatched request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHandleInfo {
    /// Dispatcher-local request number
    pub request_id: u64,
    /// Conversation
    pub chat_id: ChatId,
    /// How the reply is requested
    pub mode: StreamMode,
    /// GitHub link detected in the message, if any
    pub url_kind: Option<UrlKind>,
    /// When the request was dispatched
    pub started_at: DateTime<Utc>,
}

/// A live exchange; dropping it cancels the exchange
#[derive(Debug)]
struct RequestHandle {
    info: RequestHandleInfo,
    token: CancellationToken,
    updates: mpsc::Receiver<SessionUpdate>,
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Owns the store and the live exchanges
pub struct Dispatcher<B: ChatBackend> {
    backend: Arc<B>,
    store: ConversationStore,
    handles: HashMap<ChatId, RequestHandle>,
    pending: VecDeque<ChatUpdate>,
    next_request_id: u64,
    idle_timeout: Option<Duration>,
    channel_capacity: usize,
}

impl<B: ChatBackend> Dispatcher<B> {
    /// Create a dispatcher with an empty store
    pub fn new(backend: B, config: &ClientConfig) -> Self {
        Self::with_store(backend, ConversationStore::new(), config)
    }

    /// Create a dispatcher over an existing store
    pub fn with_store(backend: B, store: ConversationStore, config: &ClientConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            store,
            handles: HashMap::new(),
            pending: VecDeque::new(),
            next_request_id: 1,
            idle_timeout: config.stream_idle_timeout(),
            channel_capacity: config.update_channel_capacity.max(1),
        }
    }

    /// The backend
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The conversation store
    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Mutable access to the store
    ///
    /// Streaming buffers of live exchanges should only be changed through the
    /// dispatcher.
    pub fn store_mut(&mut self) -> &mut ConversationStore {
        &mut self.store
    }

    /// Whether a reply is in flight for `chat_id`
    #[must_use]
    pub fn is_active(&self, chat_id: &ChatId) -> bool {
        self.handles.contains_key(chat_id)
    }

    /// Summary of the live exchange for `chat_id`
    #[must_use]
    pub fn request(&self, chat_id: &ChatId) -> Option<&RequestHandleInfo> {
        self.handles.get(chat_id).map(|h| &h.info)
    }

    /// Number of live exchanges
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.handles.len()
    }

    /// Send a user message and start the reply
    ///
    /// The text is trimmed; an empty result is rejected before anything else
    /// happens. A reply already in flight for this conversation is cancelled
    /// and its partial content discarded; one that finished but was never
    /// read is kept (see [`cancel`](Self::cancel)).
    ///
    /// # Errors
    ///
    /// [`DispatchError::EmptyMessage`] for blank text, or a store error for an
    /// unknown conversation.
    pub fn send(
        &mut self,
        chat_id: &ChatId,
        text: &str,
        mode: StreamMode,
    ) -> Result<RequestHandleInfo, DispatchError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }
        if self.store.get(chat_id).is_none() {
            return Err(StoreError::UnknownConversation(chat_id.clone()).into());
        }

        if self.cancel(chat_id)? {
            tracing::debug!(chat_id = %chat_id, "Replaced in-flight reply");
        }

        self.store.append_user_message(chat_id, text)?;
        self.store.begin_assistant_stream(chat_id)?;

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let info = RequestHandleInfo {
            request_id,
            chat_id: chat_id.clone(),
            mode,
            url_kind: detect_url_kind(text),
            started_at: Utc::now(),
        };

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let backend = Arc::clone(&self.backend);
        let chat = chat_id.clone();
        let message = text.to_string();
        let task_token = token.clone();

        match mode {
            StreamMode::Streaming => {
                let idle_timeout = self.idle_timeout;
                tokio::spawn(async move {
                    let state =
                        streaming_exchange(backend, chat, message, task_token, tx, idle_timeout)
                            .await;
                    tracing::debug!(request_id, ?state, "Streaming exchange ended");
                });
            }
            StreamMode::Buffered => {
                tokio::spawn(async move {
                    let state = buffered_exchange(backend, chat, message, task_token, tx).await;
                    tracing::debug!(request_id, ?state, "Buffered exchange ended");
                });
            }
        }

        tracing::info!(
            request_id,
            chat_id = %chat_id,
            ?mode,
            url_kind = ?info.url_kind,
            "Dispatched message"
        );

        self.handles.insert(
            chat_id.clone(),
            RequestHandle {
                info: info.clone(),
                token,
                updates: rx,
            },
        );
        Ok(info)
    }

    /// Cancel the reply in flight for `chat_id`
    ///
    /// The streaming buffer is discarded and no error is raised. Updates
    /// queued for the chat but not yet returned are dropped. A reply that had
    /// already finished, with its terminal update still unread, is applied
    /// instead of discarded. Returns whether anything was cancelled.
    ///
    /// # Errors
    ///
    /// Returns a store error for an unknown conversation.
    pub fn cancel(&mut self, chat_id: &ChatId) -> Result<bool, DispatchError> {
        self.pending.retain(|u| u.chat_id() != chat_id);

        let mut cancelled = false;
        if let Some(mut handle) = self.handles.remove(chat_id) {
            let mut queued = Vec::new();
            while let Ok(update) = handle.updates.try_recv() {
                queued.push(update);
            }

            if queued.last().is_some_and(SessionUpdate::is_terminal) {
                tracing::debug!(
                    chat_id = %chat_id,
                    request_id = handle.info.request_id,
                    "Reply finished before cancel; applying it"
                );
                drop(handle);
                for update in queued {
                    self.apply(chat_id, update);
                }
            } else {
                tracing::debug!(chat_id = %chat_id, "Cancelled reply");
                cancelled = true;
            }
        }

        let had_buffer = self.store.cancel_assistant_stream(chat_id)?;
        Ok(cancelled || had_buffer)
    }

    /// Cancel every live exchange
    pub fn cancel_all(&mut self) {
        let chats: Vec<ChatId> = self.handles.keys().cloned().collect();
        for chat_id in chats {
            if let Err(e) = self.cancel(&chat_id) {
                tracing::debug!(chat_id = %chat_id, error = %e, "Cancel skipped");
            }
        }
    }

    /// Delete a conversation locally, cancelling its reply first
    ///
    /// # Errors
    ///
    /// Returns a store error for an unknown conversation.
    pub fn delete_conversation(&mut self, chat_id: &ChatId) -> Result<(), DispatchError> {
        self.cancel(chat_id)?;
        self.pending.retain(|u| u.chat_id() != chat_id);
        self.store.delete_conversation(chat_id)?;
        Ok(())
    }

    /// Wait for the next update of `chat_id` and apply it
    ///
    /// Returns `None` once the exchange has ended (or none was running).
    pub async fn next_update(&mut self, chat_id: &ChatId) -> Option<ChatUpdate> {
        loop {
            if let Some(pos) = self.pending.iter().position(|u| u.chat_id() == chat_id) {
                return self.pending.remove(pos);
            }

            let handle = self.handles.get_mut(chat_id)?;
            let received = handle.updates.recv().await;
            match received {
                Some(update) => self.apply(chat_id, update),
                None => self.task_lost(chat_id),
            }
        }
    }

    /// Apply every update that has already arrived, without waiting
    pub fn poll_updates(&mut self) -> Vec<ChatUpdate> {
        let chats: Vec<ChatId> = self.handles.keys().cloned().collect();
        for chat_id in chats {
            loop {
                let Some(handle) = self.handles.get_mut(&chat_id) else {
                    break;
                };
                match handle.updates.try_recv() {
                    Ok(update) => self.apply(&chat_id, update),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.task_lost(&chat_id);
                        break;
                    }
                }
            }
        }
        self.pending.drain(..).collect()
    }

    /// Wait until the exchange for `chat_id` ends, returning every update
    pub async fn settle(&mut self, chat_id: &ChatId) -> Vec<ChatUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = self.next_update(chat_id).await {
            updates.push(update);
        }
        updates
    }

    // ========================================================================
    // Store application
    // ========================================================================

    fn apply(&mut self, chat_id: &ChatId, update: SessionUpdate) {
        if update.is_terminal() {
            self.handles.remove(chat_id);
        }

        let result = match update {
            SessionUpdate::Streaming {
                content,
                pr_metadata,
                commit_metadata,
            } => self
                .store
                .update_assistant_stream(chat_id, &content, pr_metadata, commit_metadata)
                .map(|changed| {
                    if changed {
                        self.pending.push_back(ChatUpdate::Streaming {
                            chat_id: chat_id.clone(),
                            content,
                        });
                    }
                }),
            SessionUpdate::Completed(reply) => self.complete(chat_id, reply),
            SessionUpdate::Failed { reason } => {
                self.store.fail_assistant_stream(chat_id, &reason).map(|()| {
                    self.pending.push_back(ChatUpdate::Failed {
                        chat_id: chat_id.clone(),
                        reason,
                    });
                })
            }
        };

        if let Err(e) = result {
            tracing::debug!(chat_id = %chat_id, error = %e, "Dropped update");
        }
    }

    fn complete(&mut self, chat_id: &ChatId, reply: CompletedReply) -> Result<(), StoreError> {
        let message = self
            .store
            .finalize_assistant_stream(
                chat_id,
                &reply.content,
                reply.pr_metadata,
                reply.commit_metadata,
                reply.message_id,
            )?
            .clone();
        self.pending.push_back(ChatUpdate::Completed {
            chat_id: chat_id.clone(),
            message,
        });

        if let Some(title) = reply.new_title {
            self.store.rename_conversation(chat_id, &title)?;
            self.pending.push_back(ChatUpdate::Renamed {
                chat_id: chat_id.clone(),
                title: title.trim().to_string(),
            });
        }
        Ok(())
    }

    fn task_lost(&mut self, chat_id: &ChatId) {
        self.handles.remove(chat_id);
        let streaming = self.store.get(chat_id).is_some_and(|c| c.is_streaming());
        if streaming {
            tracing::warn!(chat_id = %chat_id, "Reply task ended without a result");
            self.apply(
                chat_id,
                SessionUpdate::Failed {
                    reason: TASK_LOST_REASON.to_string(),
                },
            );
        }
    }
}

impl<B: ChatBackend> Drop for Dispatcher<B> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            tracing::debug!(count = self.handles.len(), "Cancelling replies on shutdown");
        }
    }
}

// ============================================================================
// Reader tasks
// ============================================================================

/// Send one update unless the exchange is cancelled first
async fn deliver(
    updates: &mpsc::Sender<SessionUpdate>,
    cancel: &CancellationToken,
    update: SessionUpdate,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = updates.send(update) => sent.is_ok(),
    }
}

async fn streaming_exchange<B: ChatBackend>(
    backend: Arc<B>,
    chat_id: ChatId,
    message: String,
    cancel: CancellationToken,
    updates: mpsc::Sender<SessionUpdate>,
    idle_timeout: Option<Duration>,
) -> SessionState {
    let mut session = StreamSession::new();
    session.begin();

    let body = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            session.cancel();
            return session.state();
        }
        body = backend.stream_message(&chat_id, &message) => body,
    };

    match body {
        Ok(bytes) => {
            let frames = frame_stream_with_idle_timeout(bytes, idle_timeout);
            run_stream(frames, session, cancel, updates).await
        }
        Err(e) => {
            if let Some(update) = session.transport_failed(&e) {
                deliver(&updates, &cancel, update).await;
            }
            session.state()
        }
    }
}

async fn buffered_exchange<B: ChatBackend>(
    backend: Arc<B>,
    chat_id: ChatId,
    message: String,
    cancel: CancellationToken,
    updates: mpsc::Sender<SessionUpdate>,
) -> SessionState {
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return SessionState::Cancelled,
        result = backend.send_message(&chat_id, &message) => result,
    };

    let (update, state) = match result {
        Ok(response) => (
            SessionUpdate::Completed(CompletedReply {
                content: response.content,
                message_id: Some(response.id),
                new_title: response.new_title.filter(|t| !t.trim().is_empty()),
                pr_metadata: response.pr_metadata,
                commit_metadata: response.commit_metadata,
            }),
            SessionState::Finalized,
        ),
        Err(e) => {
            tracing::warn!(chat_id = %chat_id, error = %e, "Buffered send failed");
            (
                SessionUpdate::Failed {
                    reason: SEND_FAILED_REASON.to_string(),
                },
                SessionState::Errored,
            )
        }
    };

    if deliver(&updates, &cancel, update).await {
        state
    } else {
        SessionState::Cancelled
    }
}
