//! Chat Messages and Metadata
//!
//! Data carried between the backend and the client: conversation records,
//! persisted messages, and the PR/commit metadata snapshots the backend
//! attaches to assistant replies.
//!
//! # Wire Compatibility
//!
//! Field names follow the backend's JSON (`chat_id`, `created_at`,
//! `pr_metadata`, ...). Every metadata field is optional, and fields this
//! client does not know about are kept in an `extra` map so that merging two
//! partial snapshots never drops data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default title for a conversation nobody has named yet
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Number of patch lines shown before a diff preview is truncated
pub const DEFAULT_DIFF_PREVIEW_LINES: usize = 50;

// ============================================================================
// Identifiers
// ============================================================================

/// Conversation identifier (assigned by the backend)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    /// Generate a local identifier for a conversation not yet known to the backend
    #[must_use]
    pub fn local() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Message identifier
///
/// Persisted messages carry the id the backend assigned. User messages and
/// assistant replies finalized without a server id get a local UUID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new local message ID
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The person typing
    User,
    /// The AI assistant
    Assistant,
}

// ============================================================================
// Records
// ============================================================================

/// A persisted chat message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message ID
    pub id: MessageId,
    /// Conversation this message belongs to
    pub chat_id: ChatId,
    /// Who sent it
    pub role: MessageRole,
    /// Message text (markdown)
    pub content: String,
    /// When the message was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Pull request the assistant analysed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_metadata: Option<PrMetadata>,
    /// Commit the assistant analysed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_metadata: Option<CommitMetadata>,
}

impl Message {
    /// Create a user message stamped now
    #[must_use]
    pub fn user(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            chat_id,
            role: MessageRole::User,
            content: content.into(),
            created_at: Utc::now(),
            pr_metadata: None,
            commit_metadata: None,
        }
    }

    /// Create an assistant message stamped now
    #[must_use]
    pub fn assistant(chat_id: ChatId, id: MessageId, content: impl Into<String>) -> Self {
        Self {
            id,
            chat_id,
            role: MessageRole::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            pr_metadata: None,
            commit_metadata: None,
        }
    }
}

/// Conversation summary as listed by `GET /chats`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    /// Conversation ID
    pub id: ChatId,
    /// Current title
    pub title: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Buffered reply from `POST /chat`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Server-assigned ID of the assistant message
    pub id: MessageId,
    /// Full reply text
    pub content: String,
    /// PR metadata, when the message contained a PR URL
    #[serde(default)]
    pub pr_metadata: Option<PrMetadata>,
    /// Commit metadata, when the message contained a commit URL
    #[serde(default)]
    pub commit_metadata: Option<CommitMetadata>,
    /// Title generated from the first message of a conversation
    #[serde(default)]
    pub new_title: Option<String>,
}

/// Backend health as reported by `GET /health`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall service status ("healthy", ...)
    pub status: String,
    /// GitHub integration status
    #[serde(default)]
    pub github: serde_json::Value,
}

/// Review action submitted through `POST /pr/review`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewAction {
    /// Approve the pull request
    Approve,
    /// Request changes
    RequestChanges,
    /// Leave a review comment
    Comment,
}

// ============================================================================
// PR / Commit Metadata
// ============================================================================

/// Copy `src` into `dst` when `src` carries a value
fn merge_field<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(value) = src {
        *dst = Some(value.clone());
    }
}

/// A commit listed inside a pull request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Commit SHA
    #[serde(default)]
    pub sha: String,
    /// Commit message
    #[serde(default)]
    pub message: String,
    /// Commit author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// A file touched by a PR or commit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path of the file
    #[serde(default)]
    pub filename: String,
    /// Change status ("added", "modified", "removed", "renamed")
    #[serde(default)]
    pub status: String,
    /// Lines added
    #[serde(default)]
    pub additions: u64,
    /// Lines removed
    #[serde(default)]
    pub deletions: u64,
    /// Unified diff text, when GitHub returned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// Classification of a single unified-diff line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffLineKind {
    /// `+` line
    Added,
    /// `-` line
    Removed,
    /// `@@` hunk header
    Hunk,
    /// Unchanged line or file header
    Context,
}

/// A classified diff line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffLine {
    /// Line classification
    pub kind: DiffLineKind,
    /// Line text without the diff marker
    pub text: String,
}

/// First lines of a patch, ready for display
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffPreview {
    /// Classified lines
    pub lines: Vec<DiffLine>,
    /// Whether lines were cut off
    pub truncated: bool,
}

impl DiffLine {
    /// Classify one patch line
    #[must_use]
    pub fn classify(line: &str) -> Self {
        let kind = if line.starts_with("+++") || line.starts_with("---") {
            DiffLineKind::Context
        } else if line.starts_with('+') {
            DiffLineKind::Added
        } else if line.starts_with('-') {
            DiffLineKind::Removed
        } else if line.starts_with("@@") {
            DiffLineKind::Hunk
        } else {
            DiffLineKind::Context
        };

        let text = match kind {
            DiffLineKind::Added | DiffLineKind::Removed => line[1..].to_string(),
            DiffLineKind::Hunk | DiffLineKind::Context => line.to_string(),
        };

        Self { kind, text }
    }
}

impl FileChange {
    /// Classify the first `max_lines` lines of the patch
    ///
    /// Returns `None` when the file has no patch.
    #[must_use]
    pub fn diff_preview(&self, max_lines: usize) -> Option<DiffPreview> {
        let patch = self.patch.as_deref()?;
        let total = patch.lines().count();
        let lines = patch.lines().take(max_lines).map(DiffLine::classify).collect();
        Some(DiffPreview {
            lines,
            truncated: total > max_lines,
        })
    }
}

/// Display state of a pull request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrDisplayState {
    /// Open PR
    Open,
    /// Closed without merging
    Closed,
    /// Merged
    Merged,
}

/// Snapshot of a GitHub pull request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrMetadata {
    /// PR URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// PR title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_title: Option<String>,
    /// PR author login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_author: Option<String>,
    /// "open" or "closed"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_state: Option<String>,
    /// Whether the PR was merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_merged: Option<bool>,
    /// PR description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_body: Option<String>,
    /// Number of files changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u64>,
    /// Lines added
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additions: Option<u64>,
    /// Lines removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u64>,
    /// Commits in the PR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commits: Option<Vec<CommitSummary>>,
    /// Files changed by the PR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileChange>>,
    /// Fields this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PrMetadata {
    /// Shallow merge: fields present in `update` overwrite, absent ones are kept
    pub fn merge(&mut self, update: &Self) {
        merge_field(&mut self.pr_url, &update.pr_url);
        merge_field(&mut self.pr_title, &update.pr_title);
        merge_field(&mut self.pr_author, &update.pr_author);
        merge_field(&mut self.pr_state, &update.pr_state);
        merge_field(&mut self.pr_merged, &update.pr_merged);
        merge_field(&mut self.pr_body, &update.pr_body);
        merge_field(&mut self.files_changed, &update.files_changed);
        merge_field(&mut self.additions, &update.additions);
        merge_field(&mut self.deletions, &update.deletions);
        merge_field(&mut self.commits, &update.commits);
        merge_field(&mut self.files, &update.files);
        for (key, value) in &update.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// Whether the PR is open, closed, or merged (merged wins)
    #[must_use]
    pub fn display_state(&self) -> PrDisplayState {
        if self.pr_merged.unwrap_or(false) {
            PrDisplayState::Merged
        } else if self.pr_state.as_deref() == Some("closed") {
            PrDisplayState::Closed
        } else {
            PrDisplayState::Open
        }
    }
}

/// Snapshot of a GitHub commit
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Commit URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_url: Option<String>,
    /// Full SHA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Commit message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    /// Author name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_author: Option<String>,
    /// Commit date (ISO-8601 string as sent by the backend)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_date: Option<String>,
    /// Number of files changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u64>,
    /// Lines added
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additions: Option<u64>,
    /// Lines removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u64>,
    /// Files changed by the commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileChange>>,
    /// Fields this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CommitMetadata {
    /// Shallow merge: fields present in `update` overwrite, absent ones are kept
    pub fn merge(&mut self, update: &Self) {
        merge_field(&mut self.commit_url, &update.commit_url);
        merge_field(&mut self.commit_sha, &update.commit_sha);
        merge_field(&mut self.commit_message, &update.commit_message);
        merge_field(&mut self.commit_author, &update.commit_author);
        merge_field(&mut self.commit_date, &update.commit_date);
        merge_field(&mut self.files_changed, &update.files_changed);
        merge_field(&mut self.additions, &update.additions);
        merge_field(&mut self.deletions, &update.deletions);
        merge_field(&mut self.files, &update.files);
        for (key, value) in &update.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// First line of the commit message
    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.commit_message.as_deref().and_then(|m| m.lines().next())
    }

    /// Abbreviated (7 character) SHA
    #[must_use]
    pub fn short_sha(&self) -> Option<&str> {
        self.commit_sha
            .as_deref()
            .map(|sha| sha.get(..7).unwrap_or(sha))
    }
}

/// Merge an optional update into an optional snapshot
pub(crate) fn merge_pr(dst: &mut Option<PrMetadata>, update: &PrMetadata) {
    match dst {
        Some(existing) => existing.merge(update),
        None => *dst = Some(update.clone()),
    }
}

/// Merge an optional update into an optional snapshot
pub(crate) fn merge_commit(dst: &mut Option<CommitMetadata>, update: &CommitMetadata) {
    match dst {
        Some(existing) => existing.merge(update),
        None => *dst = Some(update.clone()),
    }
}
