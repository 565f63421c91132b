//! Events produced while consuming a response body.

use reqwest::header::HeaderMap;
use serde_json::Value;
use time::OffsetDateTime;

use crate::stream_buffer::BufferStats;

/// One unit of streamed payload.
///
/// Raw framing fills only `text`; SSE framing also carries the record's
/// `event` and `id` fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Decoded text (for SSE, the record's joined `data` lines).
    pub text: String,
    /// SSE `event:` field.
    pub event: Option<String>,
    /// SSE `id:` field.
    pub id: Option<String>,
}

impl Chunk {
    /// A chunk with text only.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            event: None,
            id: None,
        }
    }
}

/// Why a stream failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Reading the body failed.
    Read,
    /// A read timed out.
    Timeout,
    /// The body outgrew the stream buffer.
    Capacity,
}

impl FailureKind {
    /// Short tag used in logs and progress reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Read => "read",
            FailureKind::Timeout => "timeout",
            FailureKind::Capacity => "capacity",
        }
    }
}

/// A typed stream event.
///
/// Within one stream the sequence is always `Start`, then any number of
/// `Chunk`/`Metadata` in wire order, then exactly one `End` or `Error`.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// The response arrived and its body is about to be read.
    Start {
        status: u16,
        headers: HeaderMap,
        timestamp: OffsetDateTime,
    },
    /// A piece of payload.
    Chunk {
        chunk: Chunk,
        timestamp: OffsetDateTime,
    },
    /// Out-of-band information from the framing layer.
    Metadata {
        key: String,
        value: Value,
        timestamp: OffsetDateTime,
    },
    /// The body ended cleanly.
    End {
        content: String,
        stats: BufferStats,
        timestamp: OffsetDateTime,
    },
    /// The body could not be read to the end.
    Error {
        message: String,
        kind: FailureKind,
        timestamp: OffsetDateTime,
    },
}

impl StreamEvent {
    pub(crate) fn start(status: u16, headers: HeaderMap) -> Self {
        StreamEvent::Start {
            status,
            headers,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub(crate) fn chunk(chunk: Chunk) -> Self {
        StreamEvent::Chunk {
            chunk,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub(crate) fn metadata(key: impl Into<String>, value: Value) -> Self {
        StreamEvent::Metadata {
            key: key.into(),
            value,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub(crate) fn end(content: String, stats: BufferStats) -> Self {
        StreamEvent::End {
            content,
            stats,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub(crate) fn error(message: impl Into<String>, kind: FailureKind) -> Self {
        StreamEvent::Error {
            message: message.into(),
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// When the event was created.
    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            StreamEvent::Start { timestamp, .. }
            | StreamEvent::Chunk { timestamp, .. }
            | StreamEvent::Metadata { timestamp, .. }
            | StreamEvent::End { timestamp, .. }
            | StreamEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Returns true for `End` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }
}
