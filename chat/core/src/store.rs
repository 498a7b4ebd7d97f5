//! Conversation State Store
//!
//! Holds every conversation the client knows about, its ordered transcript,
//! the transient streaming buffer of an in-flight reply, and a single
//! dismissible error slot.
//!
//! # Invariants
//!
//! - Messages are append-only, in arrival order.
//! - A conversation has at most one streaming buffer.
//! - Only [`ConversationStore::finalize_assistant_stream`] appends an
//!   assistant message, and it consumes the buffer, so it can succeed at most
//!   once per stream.
//! - A buffer never shrinks to a stale prefix of itself.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::messages::{
    ChatId, ChatRecord, CommitMetadata, Message, MessageId, PrMetadata, DEFAULT_CHAT_TITLE,
};

/// Characters of the first message used for a provisional title
const PROVISIONAL_TITLE_CHARS: usize = 30;

/// Store operation errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No conversation with this id
    #[error("unknown conversation {0}")]
    UnknownConversation(ChatId),

    /// The conversation already has a reply streaming
    #[error("conversation {0} already has an active stream")]
    StreamAlreadyActive(ChatId),

    /// The conversation has no reply streaming
    #[error("conversation {0} has no active stream")]
    NoActiveStream(ChatId),

    /// Titles must contain something other than whitespace
    #[error("title cannot be empty")]
    EmptyTitle,
}

/// The in-flight assistant reply of a conversation
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingBuffer {
    /// Cumulative content received so far
    pub content: String,
    /// PR metadata received so far
    pub pr_metadata: Option<PrMetadata>,
    /// Commit metadata received so far
    pub commit_metadata: Option<CommitMetadata>,
    /// Whether anything has been received yet
    pub live: bool,
    /// When the reply was requested
    pub started_at: DateTime<Utc>,
}

impl StreamingBuffer {
    fn new() -> Self {
        Self {
            content: String::new(),
            pr_metadata: None,
            commit_metadata: None,
            live: false,
            started_at: Utc::now(),
        }
    }
}

/// A conversation and its transcript
#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    /// Conversation ID
    pub id: ChatId,
    /// Current title
    pub title: String,
    /// Persisted messages, oldest first
    pub messages: Vec<Message>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    streaming: Option<StreamingBuffer>,
    error: Option<String>,
}

impl Conversation {
    /// Create an empty conversation
    #[must_use]
    pub fn new(id: ChatId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            streaming: None,
            error: None,
        }
    }

    /// Create from a backend record (no messages loaded yet)
    #[must_use]
    pub fn from_record(record: ChatRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            messages: Vec::new(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            streaming: None,
            error: None,
        }
    }

    /// The in-flight reply, if any
    #[must_use]
    pub fn streaming(&self) -> Option<&StreamingBuffer> {
        self.streaming.as_ref()
    }

    /// Whether a reply is in flight
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// The pending error banner, if any
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Most recent persisted message
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Title derived from the first message of a conversation
#[must_use]
pub fn provisional_title(text: &str) -> String {
    let text = text.trim();
    let mut title: String = text.chars().take(PROVISIONAL_TITLE_CHARS).collect();
    if text.chars().count() > PROVISIONAL_TITLE_CHARS {
        title.push_str("...");
    }
    title
}

/// All conversations, most recent first
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    active: Option<ChatId>,
}

impl ConversationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All conversations in display order
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Number of conversations
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the store holds no conversations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Look up a conversation
    #[must_use]
    pub fn get(&self, id: &ChatId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    fn get_mut(&mut self, id: &ChatId) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| StoreError::UnknownConversation(id.clone()))
    }

    /// The selected conversation
    #[must_use]
    pub fn active(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.get(id))
    }

    /// The selected conversation's id
    #[must_use]
    pub fn active_id(&self) -> Option<&ChatId> {
        self.active.as_ref()
    }

    /// Select a conversation
    pub fn set_active(&mut self, id: &ChatId) -> Result<(), StoreError> {
        if self.get(id).is_none() {
            return Err(StoreError::UnknownConversation(id.clone()));
        }
        self.active = Some(id.clone());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Conversation list
    // ------------------------------------------------------------------------

    /// Create a local "New Chat" conversation, select it, and return its id
    pub fn create_conversation(&mut self) -> ChatId {
        let conversation = Conversation::new(ChatId::local(), DEFAULT_CHAT_TITLE);
        let id = conversation.id.clone();
        self.conversations.insert(0, conversation);
        self.active = Some(id.clone());
        id
    }

    /// Add a backend conversation at the top, or refresh an existing one
    pub fn insert_conversation(&mut self, record: ChatRecord) -> &Conversation {
        let idx = match self.conversations.iter().position(|c| c.id == record.id) {
            Some(idx) => {
                let existing = &mut self.conversations[idx];
                existing.title = record.title;
                existing.updated_at = record.updated_at;
                idx
            }
            None => {
                self.conversations.insert(0, Conversation::from_record(record));
                0
            }
        };
        if self.active.is_none() {
            self.active = Some(self.conversations[idx].id.clone());
        }
        &self.conversations[idx]
    }

    /// Replace the list with the backend's, in the backend's order
    ///
    /// Known conversations keep their loaded messages. Conversations the
    /// backend no longer lists are dropped unless a reply is in flight.
    pub fn load_conversations(&mut self, records: Vec<ChatRecord>) {
        let mut previous = std::mem::take(&mut self.conversations);
        for record in records {
            match previous.iter().position(|c| c.id == record.id) {
                Some(idx) => {
                    let mut existing = previous.remove(idx);
                    existing.title = record.title;
                    existing.updated_at = record.updated_at;
                    self.conversations.push(existing);
                }
                None => self.conversations.push(Conversation::from_record(record)),
            }
        }
        self.conversations
            .extend(previous.into_iter().filter(Conversation::is_streaming));

        let active_known = self.active.as_ref().is_some_and(|id| self.get(id).is_some());
        if !active_known {
            self.active = self.conversations.first().map(|c| c.id.clone());
        }
        tracing::debug!(count = self.conversations.len(), "Loaded conversations");
    }

    /// Replace a conversation's transcript with the persisted history
    pub fn replace_messages(&mut self, id: &ChatId, messages: Vec<Message>) -> Result<(), StoreError> {
        let conversation = self.get_mut(id)?;
        conversation.messages = messages;
        Ok(())
    }

    /// Remove a conversation
    ///
    /// If it was selected, the first remaining conversation is selected; if
    /// none remain, a fresh one is created.
    pub fn delete_conversation(&mut self, id: &ChatId) -> Result<Conversation, StoreError> {
        let idx = self
            .conversations
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| StoreError::UnknownConversation(id.clone()))?;
        let removed = self.conversations.remove(idx);

        if self.conversations.is_empty() {
            self.create_conversation();
        } else if self.active.as_ref() == Some(id) {
            self.active = Some(self.conversations[0].id.clone());
        }
        Ok(removed)
    }

    /// Rename from the user (title edit)
    pub fn edit_title(&mut self, id: &ChatId, title: &str) -> Result<(), StoreError> {
        self.rename_conversation(id, title)
    }

    /// Apply a rename, whenever it arrives
    pub fn rename_conversation(&mut self, id: &ChatId, title: &str) -> Result<(), StoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::EmptyTitle);
        }
        let conversation = self.get_mut(id)?;
        conversation.title = title.to_string();
        conversation.touch();
        tracing::debug!(chat_id = %id, title, "Conversation renamed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Messages and streaming
    // ------------------------------------------------------------------------

    /// Append a user message
    ///
    /// The first message of an untitled conversation also becomes its
    /// provisional title.
    pub fn append_user_message(&mut self, id: &ChatId, text: &str) -> Result<MessageId, StoreError> {
        let conversation = self.get_mut(id)?;
        if conversation.messages.is_empty() && conversation.title == DEFAULT_CHAT_TITLE {
            conversation.title = provisional_title(text);
        }
        let message = Message::user(id.clone(), text);
        let message_id = message.id.clone();
        conversation.messages.push(message);
        conversation.touch();
        Ok(message_id)
    }

    /// Open the streaming buffer for an assistant reply
    pub fn begin_assistant_stream(&mut self, id: &ChatId) -> Result<(), StoreError> {
        let conversation = self.get_mut(id)?;
        if conversation.streaming.is_some() {
            return Err(StoreError::StreamAlreadyActive(id.clone()));
        }
        conversation.streaming = Some(StreamingBuffer::new());
        conversation.error = None;
        Ok(())
    }

    /// Replace the buffer with a newer cumulative snapshot
    ///
    /// Returns whether anything changed. Re-applying the same snapshot is a
    /// no-op, and a prefix of what is buffered is stale and ignored. Any other
    /// snapshot replaces the buffer.
    pub fn update_assistant_stream(
        &mut self,
        id: &ChatId,
        cumulative_text: &str,
        pr_metadata: Option<PrMetadata>,
        commit_metadata: Option<CommitMetadata>,
    ) -> Result<bool, StoreError> {
        let conversation = self.get_mut(id)?;
        let buffer = conversation
            .streaming
            .as_mut()
            .ok_or_else(|| StoreError::NoActiveStream(id.clone()))?;

        let mut changed = false;
        if buffer.content.starts_with(cumulative_text) {
            if cumulative_text.len() < buffer.content.len() {
                tracing::debug!(
                    chat_id = %id,
                    buffered = buffer.content.len(),
                    received = cumulative_text.len(),
                    "Ignoring stale stream snapshot"
                );
            }
        } else {
            if !cumulative_text.starts_with(buffer.content.as_str()) {
                tracing::warn!(
                    chat_id = %id,
                    buffered = buffer.content.len(),
                    received = cumulative_text.len(),
                    "Stream snapshot diverged from buffer; replacing"
                );
            }
            buffer.content = cumulative_text.to_string();
            changed = true;
        }
        if pr_metadata.is_some() && pr_metadata != buffer.pr_metadata {
            buffer.pr_metadata = pr_metadata;
            changed = true;
        }
        if commit_metadata.is_some() && commit_metadata != buffer.commit_metadata {
            buffer.commit_metadata = commit_metadata;
            changed = true;
        }
        if changed {
            buffer.live = true;
        }
        Ok(changed)
    }

    /// Turn the buffer into a persisted assistant message
    ///
    /// `id` is the server-assigned message id; a local one is generated when
    /// the backend did not send any.
    pub fn finalize_assistant_stream(
        &mut self,
        id: &ChatId,
        final_text: &str,
        pr_metadata: Option<PrMetadata>,
        commit_metadata: Option<CommitMetadata>,
        message_id: Option<MessageId>,
    ) -> Result<&Message, StoreError> {
        let conversation = self.get_mut(id)?;
        let buffer = conversation
            .streaming
            .take()
            .ok_or_else(|| StoreError::NoActiveStream(id.clone()))?;

        let mut message = Message::assistant(id.clone(), message_id.unwrap_or_default(), final_text);
        message.pr_metadata = pr_metadata.or(buffer.pr_metadata);
        message.commit_metadata = commit_metadata.or(buffer.commit_metadata);

        conversation.messages.push(message);
        conversation.touch();
        conversation
            .messages
            .last()
            .ok_or_else(|| StoreError::NoActiveStream(id.clone()))
    }

    /// Drop the buffer and raise the error banner
    pub fn fail_assistant_stream(&mut self, id: &ChatId, reason: &str) -> Result<(), StoreError> {
        let conversation = self.get_mut(id)?;
        conversation.streaming = None;
        conversation.error = Some(reason.to_string());
        Ok(())
    }

    /// Drop the buffer without any banner
    ///
    /// Returns whether a reply was in flight.
    pub fn cancel_assistant_stream(&mut self, id: &ChatId) -> Result<bool, StoreError> {
        let conversation = self.get_mut(id)?;
        Ok(conversation.streaming.take().is_some())
    }

    /// Raise the error banner without touching the transcript
    pub fn set_error(&mut self, id: &ChatId, reason: &str) -> Result<(), StoreError> {
        self.get_mut(id)?.error = Some(reason.to_string());
        Ok(())
    }

    /// Dismiss the error banner
    pub fn dismiss_error(&mut self, id: &ChatId) -> Result<(), StoreError> {
        self.get_mut(id)?.error = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageRole;
    use pretty_assertions::assert_eq;

    fn store_with_chat() -> (ConversationStore, ChatId) {
        let mut store = ConversationStore::new();
        let id = store.create_conversation();
        (store, id)
    }

    #[test]
    fn test_create_selects_new_conversation() {
        let (mut store, first) = store_with_chat();
        let second = store.create_conversation();

        assert_eq!(store.len(), 2);
        assert_eq!(store.active_id(), Some(&second));
        assert_eq!(store.conversations()[0].id, second);
        assert_eq!(store.conversations()[1].id, first);
        assert_eq!(store.active().unwrap().title, DEFAULT_CHAT_TITLE);
    }

    #[test]
    fn test_full_exchange() {
        let (mut store, id) = store_with_chat();

        store.append_user_message(&id, "Review this").unwrap();
        store.begin_assistant_stream(&id).unwrap();
        assert!(store.update_assistant_stream(&id, "Hel", None, None).unwrap());
        assert!(store.update_assistant_stream(&id, "Hello", None, None).unwrap());
        assert_eq!(store.get(&id).unwrap().streaming().unwrap().content, "Hello");

        let message = store
            .finalize_assistant_stream(&id, "Hello", None, None, Some(MessageId::from("m1")))
            .unwrap();
        assert_eq!(message.id, MessageId::from("m1"));

        let conversation = store.get(&id).unwrap();
        assert!(!conversation.is_streaming());
        let roles: Vec<_> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    }

    #[test]
    fn test_update_is_idempotent_and_never_truncates() {
        let (mut store, id) = store_with_chat();
        store.begin_assistant_stream(&id).unwrap();

        assert!(store.update_assistant_stream(&id, "Hello", None, None).unwrap());
        assert!(!store.update_assistant_stream(&id, "Hello", None, None).unwrap());
        assert!(!store.update_assistant_stream(&id, "Hel", None, None).unwrap());
        assert_eq!(store.get(&id).unwrap().streaming().unwrap().content, "Hello");
    }

    #[test]
    fn test_diverging_snapshot_replaces_buffer() {
        let (mut store, id) = store_with_chat();
        store.begin_assistant_stream(&id).unwrap();

        assert!(store.update_assistant_stream(&id, "Hello", None, None).unwrap());
        assert!(store.update_assistant_stream(&id, "Hallo", None, None).unwrap());
        assert_eq!(store.get(&id).unwrap().streaming().unwrap().content, "Hallo");

        assert!(store.update_assistant_stream(&id, "Hi", None, None).unwrap());
        assert_eq!(store.get(&id).unwrap().streaming().unwrap().content, "Hi");
        assert!(!store.update_assistant_stream(&id, "H", None, None).unwrap());
    }

    #[test]
    fn test_single_active_stream() {
        let (mut store, id) = store_with_chat();
        store.begin_assistant_stream(&id).unwrap();
        assert_eq!(
            store.begin_assistant_stream(&id),
            Err(StoreError::StreamAlreadyActive(id.clone()))
        );
    }

    #[test]
    fn test_finalize_at_most_once() {
        let (mut store, id) = store_with_chat();
        store.begin_assistant_stream(&id).unwrap();
        store.finalize_assistant_stream(&id, "a", None, None, None).unwrap();

        let again = store.finalize_assistant_stream(&id, "a", None, None, None);
        assert_eq!(again.unwrap_err(), StoreError::NoActiveStream(id.clone()));
        assert_eq!(store.get(&id).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_finalize_keeps_buffered_metadata() {
        let (mut store, id) = store_with_chat();
        store.begin_assistant_stream(&id).unwrap();
        let pr = PrMetadata {
            pr_title: Some("Add cache".to_string()),
            ..Default::default()
        };
        store
            .update_assistant_stream(&id, "", Some(pr.clone()), None)
            .unwrap();
        assert!(store.get(&id).unwrap().streaming().unwrap().live);

        let message = store.finalize_assistant_stream(&id, "done", None, None, None).unwrap();
        assert_eq!(message.pr_metadata, Some(pr));
        assert!(!message.id.as_str().is_empty());
    }

    #[test]
    fn test_fail_and_cancel() {
        let (mut store, id) = store_with_chat();
        store.append_user_message(&id, "hi").unwrap();

        store.begin_assistant_stream(&id).unwrap();
        store.update_assistant_stream(&id, "Hel", None, None).unwrap();
        store.fail_assistant_stream(&id, "backend down").unwrap();
        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.error(), Some("backend down"));
        assert!(!conversation.is_streaming());
        assert_eq!(conversation.messages.len(), 1);

        store.dismiss_error(&id).unwrap();
        store.begin_assistant_stream(&id).unwrap();
        assert!(store.cancel_assistant_stream(&id).unwrap());
        assert!(!store.cancel_assistant_stream(&id).unwrap());
        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.error(), None);
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn test_provisional_title() {
        let (mut store, id) = store_with_chat();
        store
            .append_user_message(&id, "  Please review https://github.com/o/r/pull/1  ")
            .unwrap();
        assert_eq!(store.get(&id).unwrap().title, "Please review https://github.c...");

        // Only the first message names the conversation
        store.append_user_message(&id, "second").unwrap();
        assert_eq!(store.get(&id).unwrap().title, "Please review https://github.c...");

        assert_eq!(provisional_title("short"), "short");
    }

    #[test]
    fn test_rename_before_and_after_completion() {
        // Rename arrives while streaming
        let (mut store, id) = store_with_chat();
        store.append_user_message(&id, "hi").unwrap();
        store.begin_assistant_stream(&id).unwrap();
        store.rename_conversation(&id, "Greeting").unwrap();
        store.finalize_assistant_stream(&id, "hello", None, None, None).unwrap();
        assert_eq!(store.get(&id).unwrap().title, "Greeting");

        // Rename arrives after completion
        let (mut store, id) = store_with_chat();
        store.append_user_message(&id, "hi").unwrap();
        store.begin_assistant_stream(&id).unwrap();
        store.finalize_assistant_stream(&id, "hello", None, None, None).unwrap();
        store.rename_conversation(&id, "Greeting").unwrap();
        assert_eq!(store.get(&id).unwrap().title, "Greeting");
    }

    #[test]
    fn test_edit_title_rejects_blank() {
        let (mut store, id) = store_with_chat();
        assert_eq!(store.edit_title(&id, "   "), Err(StoreError::EmptyTitle));
        store.edit_title(&id, "  Release notes ").unwrap();
        assert_eq!(store.get(&id).unwrap().title, "Release notes");
    }

    #[test]
    fn test_delete_reselects_or_recreates() {
        let (mut store, first) = store_with_chat();
        let second = store.create_conversation();

        store.delete_conversation(&second).unwrap();
        assert_eq!(store.active_id(), Some(&first));

        store.delete_conversation(&first).unwrap();
        assert_eq!(store.len(), 1);
        assert_ne!(store.active_id(), Some(&first));
        assert_eq!(store.active().unwrap().title, DEFAULT_CHAT_TITLE);

        assert!(matches!(
            store.delete_conversation(&first),
            Err(StoreError::UnknownConversation(_))
        ));
    }

    #[test]
    fn test_load_conversations_preserves_messages() {
        let now = Utc::now();
        let record = |id: &str, title: &str| ChatRecord {
            id: ChatId::from(id),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut store = ConversationStore::new();
        store.insert_conversation(record("a", "Alpha"));
        store.append_user_message(&ChatId::from("a"), "hello").unwrap();
        store.insert_conversation(record("gone", "Old"));

        store.load_conversations(vec![record("b", "Beta"), record("a", "Alpha v2")]);

        let ids: Vec<_> = store.conversations().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        let alpha = store.get(&ChatId::from("a")).unwrap();
        assert_eq!(alpha.title, "Alpha v2");
        assert_eq!(alpha.messages.len(), 1);
        assert_eq!(store.active_id(), Some(&ChatId::from("a")));
    }

    #[test]
    fn test_unknown_conversation() {
        let mut store = ConversationStore::new();
        let id = ChatId::from("missing");
        assert_eq!(
            store.append_user_message(&id, "x"),
            Err(StoreError::UnknownConversation(id.clone()))
        );
        assert!(store.set_active(&id).is_err());
    }
}
