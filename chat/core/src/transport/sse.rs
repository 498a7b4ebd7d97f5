//! Server-Sent Events Decoding
//!
//! Turns the raw bytes of a `text/event-stream` body into the payloads of its
//! `data:` lines.
//!
//! # Frame Format
//!
//! ```text
//! data: {"content":"Hel"}\n
//! data: {"content":"lo"}\n
//! \n
//! data: {"done":true,"id":"m1"}\n
//! ```
//!
//! Each `data:` line is one frame. Blank lines, `event:`/`id:` fields and
//! `:` comments are ignored. Network chunks may split a line anywhere
//! (including inside a multi-byte UTF-8 sequence), so bytes are buffered until
//! a full line is available.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::TransportError;

/// Field prefix of a data line
const DATA_PREFIX: &str = "data:";

/// Largest unterminated line kept in the buffer (10 MB)
///
/// A longer line is dropped instead of growing the buffer without bound.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Chunked response body
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Lazy sequence of decoded frame payloads
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Incremental SSE line decoder
///
/// Feed chunks with [`push`](Self::push); each call returns the frames that
/// became complete. Call [`finish`](Self::finish) once the transport closes
/// to flush a final line that had no trailing newline.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no line terminator
    scanned: usize,
    frames_decoded: u64,
    lines_dropped: u64,
}

impl SseDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut scan = self.scanned;
        while let Some(offset) = self.buffer[scan..].iter().position(|b| *b == b'\n') {
            let end = scan + offset;
            if let Some(frame) = decode_line(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            scan = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                bytes = self.buffer.len(),
                max = MAX_LINE_BYTES,
                "Dropping oversized SSE line"
            );
            self.buffer.clear();
            self.scanned = 0;
            self.lines_dropped += 1;
        }

        self.frames_decoded += frames.len() as u64;
        frames
    }

    /// Flush the buffered tail at end of stream
    ///
    /// Returns a frame only if the tail is a non-empty `data:` line.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        let frame = decode_line(&tail);
        if frame.is_some() {
            self.frames_decoded += 1;
        }
        frame
    }

    /// Bytes waiting for a line terminator
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Frames produced so far
    #[must_use]
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Oversized lines discarded so far
    #[must_use]
    pub fn lines_dropped(&self) -> u64 {
        self.lines_dropped
    }
}

/// Extract the payload of one line, if it is a non-empty data line
fn decode_line(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    if matches!(text, std::borrow::Cow::Owned(_)) {
        tracing::debug!("SSE line contained invalid UTF-8; decoded lossily");
    }

    let payload = text.trim().strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.is_empty() {
        return None;
    }
    Some(payload.to_string())
}

/// Adapt a chunked body into a lazy stream of frame payloads
///
/// The returned stream ends when `bytes` ends (after flushing any final
/// unterminated frame) or right after yielding the first transport error.
pub fn frame_stream<S>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    frame_stream_with_idle_timeout(bytes, None)
}

/// Like [`frame_stream`], failing with [`TransportError::Stalled`] when no
/// chunk arrives for `idle_timeout`
///
/// The timer restarts on every chunk, so a long frame that keeps trickling
/// in never stalls.
pub fn frame_stream_with_idle_timeout<S>(bytes: S, idle_timeout: Option<Duration>) -> FrameStream
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    struct State {
        bytes: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<String>,
        idle_timeout: Option<Duration>,
        finished: bool,
    }

    let state = State {
        bytes: bytes.boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        idle_timeout,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.finished {
                return None;
            }

            let next = match state.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, state.bytes.next()).await {
                    Ok(next) => next,
                    Err(_) => Some(Err(TransportError::Stalled(limit))),
                },
                None => state.bytes.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.push(&chunk);
                    state.pending.extend(frames);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
