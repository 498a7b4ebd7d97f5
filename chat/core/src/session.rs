//! Stream Session Controller
//!
//! One [`StreamSession`] owns exactly one request/response exchange. It folds
//! [`StreamEvent`]s into cumulative content and a merged metadata snapshot,
//! and reports [`SessionUpdate`]s for the conversation store to apply.
//!
//! # State Machine
//!
//! ```text
//!  Idle ──begin──▶ AwaitingFirstByte ──delta/metadata──▶ Streaming ──completion──▶ Finalized
//!    │                    │                                  │
//!    └────────────────────┴──────── cancel ─────────────────┴──▶ Cancelled
//!    └────────────────────┴──── error / transport ──────────┴──▶ Errored
//! ```
//!
//! Updates always carry the full accumulated text, never the delta, so a
//! consumer can apply them without reassembling anything. Cancellation emits
//! nothing: a cancelled reply is dropped, not partially saved.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{parse_frame, Completion, StreamEvent};
use crate::messages::{merge_commit, merge_pr, CommitMetadata, MessageId, PrMetadata};
use crate::transport::{FrameStream, TransportError};

/// Reason reported when the connection closes before any content arrived
pub const EMPTY_STREAM_REASON: &str = "stream ended before a response was received";

/// Lifecycle of a stream session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, request not sent yet
    Idle,
    /// Request sent, nothing received yet
    AwaitingFirstByte,
    /// Content or metadata is arriving
    Streaming,
    /// Completed normally
    Finalized,
    /// Cancelled by the user or by teardown
    Cancelled,
    /// Failed
    Errored,
}

impl SessionState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled | Self::Errored)
    }
}

/// A finished assistant reply
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedReply {
    /// Final cumulative content
    pub content: String,
    /// Server message id (`None` if the backend did not send one)
    pub message_id: Option<MessageId>,
    /// Generated conversation title
    pub new_title: Option<String>,
    /// Merged PR metadata
    pub pr_metadata: Option<PrMetadata>,
    /// Merged commit metadata
    pub commit_metadata: Option<CommitMetadata>,
}

/// State change reported by a session
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    /// Still streaming: everything received so far
    Streaming {
        /// Cumulative content
        content: String,
        /// Merged PR metadata so far
        pr_metadata: Option<PrMetadata>,
        /// Merged commit metadata so far
        commit_metadata: Option<CommitMetadata>,
    },
    /// Terminal success
    Completed(CompletedReply),
    /// Terminal failure
    Failed {
        /// Human-readable reason
        reason: String,
    },
}

impl SessionUpdate {
    /// Whether this is the last update of its session
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Streaming { .. })
    }
}

/// Accumulation state for one exchange
#[derive(Debug)]
pub struct StreamSession {
    state: SessionState,
    content: String,
    pr_metadata: Option<PrMetadata>,
    commit_metadata: Option<CommitMetadata>,
    started_at: Option<Instant>,
    first_event_at: Option<Instant>,
    frames_skipped: u32,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    /// Create an idle session
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            content: String::new(),
            pr_metadata: None,
            commit_metadata: None,
            started_at: None,
            first_event_at: None,
            frames_skipped: 0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Content accumulated so far
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Malformed frames skipped so far
    #[must_use]
    pub fn frames_skipped(&self) -> u32 {
        self.frames_skipped
    }

    /// Time from `begin` to the first content or metadata
    #[must_use]
    pub fn time_to_first_event(&self) -> Option<Duration> {
        Some(self.first_event_at?.duration_since(self.started_at?))
    }

    /// Mark the request as sent
    pub fn begin(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::AwaitingFirstByte;
            self.started_at = Some(Instant::now());
        }
    }

    fn mark_streaming(&mut self) {
        if self.state == SessionState::AwaitingFirstByte {
            self.state = SessionState::Streaming;
            self.first_event_at = Some(Instant::now());
        }
    }

    fn streaming_update(&self) -> SessionUpdate {
        SessionUpdate::Streaming {
            content: self.content.clone(),
            pr_metadata: self.pr_metadata.clone(),
            commit_metadata: self.commit_metadata.clone(),
        }
    }

    fn release(&mut self) {
        self.content = String::new();
        self.pr_metadata = None;
        self.commit_metadata = None;
    }

    /// Fold one event into the session
    ///
    /// Returns the update to publish, if any. Events arriving after a
    /// terminal state are ignored.
    pub fn apply(&mut self, event: StreamEvent) -> Option<SessionUpdate> {
        if self.state.is_terminal() {
            tracing::debug!(state = ?self.state, "Ignoring event after terminal state");
            return None;
        }
        self.begin();

        match event {
            StreamEvent::ContentDelta { text } => {
                self.mark_streaming();
                self.content.push_str(&text);
                Some(self.streaming_update())
            }
            StreamEvent::MetadataUpdate {
                pr_metadata,
                commit_metadata,
            } => {
                self.mark_streaming();
                if let Some(pr) = pr_metadata {
                    tracing::debug!(title = ?pr.pr_title, "PR metadata received");
                    merge_pr(&mut self.pr_metadata, &pr);
                }
                if let Some(commit) = commit_metadata {
                    tracing::debug!(sha = ?commit.commit_sha, "Commit metadata received");
                    merge_commit(&mut self.commit_metadata, &commit);
                }
                Some(self.streaming_update())
            }
            StreamEvent::Completion(completion) => Some(self.complete(completion)),
            StreamEvent::StreamError { message } => Some(self.fail(message)),
            StreamEvent::Unparseable { .. } => {
                self.frames_skipped += 1;
                None
            }
        }
    }

    fn complete(&mut self, completion: Completion) -> SessionUpdate {
        self.state = SessionState::Finalized;
        let accumulated = std::mem::take(&mut self.content);
        let reply = CompletedReply {
            content: completion.final_text.unwrap_or(accumulated),
            message_id: completion.message_id,
            new_title: completion.new_title,
            pr_metadata: self.pr_metadata.take(),
            commit_metadata: self.commit_metadata.take(),
        };
        tracing::debug!(
            message_id = ?reply.message_id,
            chars = reply.content.len(),
            skipped = self.frames_skipped,
            "Stream session finalized"
        );
        SessionUpdate::Completed(reply)
    }

    fn fail(&mut self, reason: String) -> SessionUpdate {
        self.state = SessionState::Errored;
        self.release();
        tracing::warn!(reason = %reason, "Stream session failed");
        SessionUpdate::Failed { reason }
    }

    /// Cancel the session, discarding everything received
    ///
    /// Returns `true` if the session was live.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Cancelled;
        self.release();
        tracing::debug!("Stream session cancelled");
        true
    }

    /// The transport failed mid-exchange
    pub fn transport_failed(&mut self, error: &TransportError) -> Option<SessionUpdate> {
        if self.state.is_terminal() {
            return None;
        }
        Some(self.fail(error.to_string()))
    }

    /// The connection closed without a `done` frame
    ///
    /// Content received so far is finalized without a server id; an exchange
    /// that produced nothing is an error.
    pub fn end_of_stream(&mut self) -> Option<SessionUpdate> {
        if self.state.is_terminal() {
            return None;
        }
        if self.content.is_empty() {
            return Some(self.fail(EMPTY_STREAM_REASON.to_string()));
        }
        tracing::debug!("Stream closed without done marker; finalizing received content");
        Some(self.complete(Completion::default()))
    }
}

/// Drive a frame stream through the parser and a session
///
/// Updates are sent in decode order. The loop stops after the first terminal
/// update, when `cancel` fires, or when the receiver goes away; the frame
/// stream (and with it the HTTP body) is dropped on every path. Cancellation
/// is checked at every suspension point, so nothing is sent after it fires.
pub async fn run_stream(
    mut frames: FrameStream,
    mut session: StreamSession,
    cancel: CancellationToken,
    updates: mpsc::Sender<SessionUpdate>,
) -> SessionState {
    session.begin();

    'frames: loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                session.cancel();
                break 'frames;
            }
            next = frames.next() => next,
        };

        let mut pending = Vec::new();
        match next {
            Some(Ok(frame)) => {
                for event in parse_frame(&frame) {
                    pending.extend(session.apply(event));
                    if session.state().is_terminal() {
                        break;
                    }
                }
            }
            Some(Err(e)) => pending.extend(session.transport_failed(&e)),
            None => pending.extend(session.end_of_stream()),
        }

        for update in pending {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    session.cancel();
                    break 'frames;
                }
                sent = updates.send(update) => {
                    if sent.is_err() {
                        tracing::debug!("Update receiver dropped; stopping stream");
                        session.cancel();
                        break 'frames;
                    }
                }
            }
        }

        if session.state().is_terminal() {
            break;
        }
    }

    drop(frames);
    session.state()
}
