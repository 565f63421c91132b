//! Turns a response body into typed [`StreamEvent`]s.
//!
//! [`events`] owns the read loop: it decodes each read as UTF-8, charges it
//! to a [`StreamBuffer`], and hands the text to an [`EventParser`] that knows
//! the framing.  Parsers are synchronous and never see bytes or errors.

use std::collections::VecDeque;

use futures::stream::{self, Stream};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::{Chunk, FailureKind, StreamEvent};
use crate::observability::{STREAM_BYTES, STREAM_CHUNKS, STREAM_DURATION, STREAM_ERRORS};
use crate::sse::SseParser;
use crate::stream_buffer::StreamBuffer;
use crate::transport::Response;

/// What a parser produces from the text it is fed.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// A unit of payload.
    Chunk(Chunk),
    /// Out-of-band information (e.g. an SSE `retry` hint).
    Metadata { key: String, value: Value },
}

/// Framing logic: text in, frames out, state carried between calls.
pub trait EventParser: Send {
    /// Consumes the next piece of decoded body text.
    fn feed(&mut self, text: &str) -> Vec<Frame>;

    /// Called once at the end of the body.
    fn finish(&mut self) -> Vec<Frame> {
        Vec::new()
    }
}

impl<P: EventParser + ?Sized> EventParser for Box<P> {
    fn feed(&mut self, text: &str) -> Vec<Frame> {
        (**self).feed(text)
    }

    fn finish(&mut self) -> Vec<Frame> {
        (**self).finish()
    }
}

/// Every read becomes one chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawParser;

impl EventParser for RawParser {
    fn feed(&mut self, text: &str) -> Vec<Frame> {
        if text.is_empty() {
            return vec![];
        }
        vec![Frame::Chunk(Chunk::text(text))]
    }
}

/// How a body is framed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    /// Unframed text.
    #[default]
    Raw,
    /// `text/event-stream`.
    Sse,
}

impl Framing {
    /// A fresh parser for this framing.
    pub fn parser(&self) -> Box<dyn EventParser> {
        match self {
            Framing::Raw => Box::new(RawParser),
            Framing::Sse => Box::new(SseParser::new()),
        }
    }
}

/// Where the read loop is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserState {
    /// `Start` not yet emitted.
    Idle,
    /// Reading the body.
    Streaming,
    /// `End` emitted.
    Completed,
    /// `Error` emitted.
    Failed,
}

/// Streams the events of `response`: `Start`, then chunks and metadata in
/// wire order, then exactly one `End` or `Error`.
///
/// Decoded text is charged against a buffer of `buffer_size` bytes; overflow
/// ends the stream with a capacity error.  Dropping the stream drops the
/// response and with it any connection slot it holds.
pub fn events<P>(
    response: Response,
    parser: P,
    buffer_size: usize,
) -> impl Stream<Item = StreamEvent> + Send
where
    P: EventParser + 'static,
{
    let reader = EventReader {
        response,
        parser,
        buffer: StreamBuffer::new(buffer_size),
        utf8: Utf8Decoder::default(),
        pending: VecDeque::new(),
        state: ParserState::Idle,
        started: Instant::now(),
    };
    stream::unfold(reader, |mut reader| async move {
        let event = reader.next_event().await?;
        Some((event, reader))
    })
}

struct EventReader<P> {
    response: Response,
    parser: P,
    buffer: StreamBuffer,
    utf8: Utf8Decoder,
    pending: VecDeque<StreamEvent>,
    state: ParserState,
    started: Instant,
}

impl<P: EventParser> EventReader<P> {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.state {
                ParserState::Idle => {
                    self.state = ParserState::Streaming;
                    self.started = Instant::now();
                    self.buffer.clear();
                    debug!(status = self.response.status(), "stream started");
                    return Some(StreamEvent::start(
                        self.response.status(),
                        self.response.headers().clone(),
                    ));
                }
                ParserState::Completed | ParserState::Failed => return None,
                ParserState::Streaming => {}
            }
            match self.response.chunk().await {
                Some(Ok(bytes)) => {
                    let text = self.utf8.decode(&bytes);
                    self.accept(&text);
                }
                Some(Err(err)) => {
                    let kind = if err.is_timeout() {
                        FailureKind::Timeout
                    } else {
                        FailureKind::Read
                    };
                    self.fail(format!("failed to read response body: {err}"), kind);
                }
                None => self.complete(),
            }
        }
    }

    fn accept(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(err) = self.buffer.add_chunk(text) {
            self.fail(err.to_string(), FailureKind::Capacity);
            return;
        }
        STREAM_BYTES.count(text.len() as u64);
        let frames = self.parser.feed(text);
        self.push_frames(frames);
    }

    fn complete(&mut self) {
        let tail = self.utf8.finish();
        self.accept(&tail);
        if self.state != ParserState::Streaming {
            return;
        }
        let frames = self.parser.finish();
        self.push_frames(frames);
        let stats = self.buffer.stats();
        STREAM_DURATION.add(self.started.elapsed().as_secs_f64());
        debug!(
            bytes = stats.total_size,
            reads = stats.chunk_count,
            "stream completed"
        );
        self.pending
            .push_back(StreamEvent::end(self.buffer.content(), stats));
        self.state = ParserState::Completed;
    }

    fn fail(&mut self, message: String, kind: FailureKind) {
        STREAM_ERRORS.click();
        warn!(kind = kind.as_str(), error = %message, "stream failed");
        self.pending.push_back(StreamEvent::error(message, kind));
        self.state = ParserState::Failed;
    }

    fn push_frames(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            let event = match frame {
                Frame::Chunk(chunk) => {
                    STREAM_CHUNKS.click();
                    StreamEvent::chunk(chunk)
                }
                Frame::Metadata { key, value } => StreamEvent::metadata(key, value),
            };
            self.pending.push_back(event);
        }
    }
}

/// Lossy UTF-8 decoding that holds back a sequence split across reads.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);
        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
