//! Stream Events
//!
//! Typed decoding of a single SSE frame. The backend sends one JSON object
//! per frame with optional fields:
//!
//! | field             | meaning                                   |
//! |-------------------|-------------------------------------------|
//! | `content`         | text to append to the assistant reply     |
//! | `pr_metadata`     | (partial) pull-request snapshot           |
//! | `commit_metadata` | (partial) commit snapshot                 |
//! | `done`            | terminal marker                           |
//! | `id`              | server message id (with `done`)           |
//! | `new_title`       | generated conversation title (with `done`) |
//! | `error`           | terminal failure                          |
//!
//! One frame can therefore produce several events. Parsing never fails: a
//! frame that is not a JSON object becomes [`StreamEvent::Unparseable`], which
//! the session skips.

use serde::Deserialize;

use crate::messages::{CommitMetadata, MessageId, PrMetadata};

/// Terminal success payload
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    /// Authoritative final text; `None` means "use the accumulated content"
    pub final_text: Option<String>,
    /// Server-assigned message id
    pub message_id: Option<MessageId>,
    /// Generated conversation title
    pub new_title: Option<String>,
}

/// A typed event decoded from one frame
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Text appended to the assistant's running content
    ContentDelta {
        /// The appended text
        text: String,
    },
    /// The reply is complete
    Completion(Completion),
    /// PR and/or commit metadata arrived
    MetadataUpdate {
        /// Partial PR snapshot
        pr_metadata: Option<PrMetadata>,
        /// Partial commit snapshot
        commit_metadata: Option<CommitMetadata>,
    },
    /// The backend reported a failure; the stream must stop
    StreamError {
        /// Error text from the backend
        message: String,
    },
    /// The frame could not be decoded and is ignored
    Unparseable {
        /// The frame as received
        raw: String,
        /// Why decoding failed
        reason: String,
    },
}

impl StreamEvent {
    /// Whether no further events are valid after this one
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion(_) | Self::StreamError { .. })
    }
}

/// Wire shape of one frame
#[derive(Debug, Default, Deserialize)]
struct WireFrame {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    pr_metadata: Option<PrMetadata>,
    #[serde(default)]
    commit_metadata: Option<CommitMetadata>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    id: Option<MessageId>,
    #[serde(default)]
    new_title: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode one frame payload into events, in application order
///
/// An `error` field wins over everything else in the frame. Otherwise the
/// order is metadata, content, completion, so a `done` frame that also
/// carries the last chunk of text completes with that text included.
#[must_use]
pub fn parse_frame(raw: &str) -> Vec<StreamEvent> {
    let frame: WireFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, frame = raw, "Skipping malformed stream frame");
            return vec![StreamEvent::Unparseable {
                raw: raw.to_string(),
                reason: e.to_string(),
            }];
        }
    };

    if let Some(message) = frame.error.filter(|m| !m.is_empty()) {
        return vec![StreamEvent::StreamError { message }];
    }

    let mut events = Vec::with_capacity(3);

    if frame.pr_metadata.is_some() || frame.commit_metadata.is_some() {
        events.push(StreamEvent::MetadataUpdate {
            pr_metadata: frame.pr_metadata,
            commit_metadata: frame.commit_metadata,
        });
    }

    if let Some(text) = frame.content.filter(|t| !t.is_empty()) {
        events.push(StreamEvent::ContentDelta { text });
    }

    if frame.done.unwrap_or(false) {
        events.push(StreamEvent::Completion(Completion {
            final_text: None,
            message_id: frame.id,
            new_title: frame.new_title.filter(|t| !t.trim().is_empty()),
        }));
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_content_delta() {
        assert_eq!(
            parse_frame(r#"{"content":"Hel"}"#),
            vec![StreamEvent::ContentDelta {
                text: "Hel".to_string()
            }]
        );
    }

    #[test]
    fn test_completion_with_title() {
        let events = parse_frame(r#"{"done":true,"id":"m1","new_title":"Parser fix"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Completion(Completion {
                final_text: None,
                message_id: Some(MessageId::from("m1")),
                new_title: Some("Parser fix".to_string()),
            })]
        );
        assert!(events[0].is_terminal());
    }

    #[test]
    fn test_combined_frame_order() {
        let events = parse_frame(
            r#"{"content":"!","pr_metadata":{"pr_title":"T"},"done":true,"id":"m2"}"#,
        );
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::MetadataUpdate { .. }));
        assert!(matches!(events[1], StreamEvent::ContentDelta { .. }));
        assert!(matches!(events[2], StreamEvent::Completion(_)));
    }

    #[test]
    fn test_error_field_is_hard_failure() {
        let events = parse_frame(r#"{"error":"rate limited","content":"ignored"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::StreamError {
                message: "rate limited".to_string()
            }]
        );
    }

    #[test]
    fn test_malformed_json_is_soft_failure() {
        let events = parse_frame("{\"content\": \"unterminated");
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Unparseable { raw, .. } => assert!(raw.starts_with("{\"content\"")),
            other => panic!("expected Unparseable, got {other:?}"),
        }
        assert!(!events[0].is_terminal());

        // Valid JSON that is not an object
        assert!(matches!(
            parse_frame("[1,2,3]")[0],
            StreamEvent::Unparseable { .. }
        ));
    }

    #[test]
    fn test_empty_and_false_fields_produce_nothing() {
        assert!(parse_frame(r#"{"content":"","done":false,"error":""}"#).is_empty());
        assert!(parse_frame("{}").is_empty());
    }

    #[test]
    fn test_commit_metadata_update() {
        let events = parse_frame(r#"{"commit_metadata":{"commit_sha":"abc1234"}}"#);
        match &events[0] {
            StreamEvent::MetadataUpdate {
                pr_metadata,
                commit_metadata,
            } => {
                assert!(pr_metadata.is_none());
                assert_eq!(
                    commit_metadata.as_ref().unwrap().commit_sha.as_deref(),
                    Some("abc1234")
                );
            }
            other => panic!("expected MetadataUpdate, got {other:?}"),
        }
    }
}
