//! Transport Layer
//!
//! Everything between the HTTP response body and the event parser:
//! - [`sse`]: incremental `text/event-stream` decoding into `data:` frames
//! - [`TransportError`]: failures talking to the backend
//!
//! The decoder is transport-agnostic: it accepts any stream of byte chunks,
//! so tests can feed it scripted chunk boundaries without a socket.

pub mod sse;

use std::time::Duration;

use thiserror::Error;

pub use sse::{frame_stream, frame_stream_with_idle_timeout, ByteStream, FrameStream, SseDecoder};

/// Errors talking to the chat backend
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection, TLS, or body read failure
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// No body chunk arrived within the configured idle timeout
    #[error("stream stalled for {0:?}")]
    Stalled(Duration),

    /// The response could not be decoded
    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the error came from the backend rejecting the request
    #[must_use]
    pub fn is_status(&self) -> bool {
        matches!(self, Self::Status { .. })
    }
}
