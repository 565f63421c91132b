//! Drives a response body to completion and hands back the text.

use std::sync::Arc;

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_STREAM_BUFFER_SIZE;
use crate::decoder::{ChunkDecoder, Decoded, MessageDeltaDecoder, PassThrough};
use crate::error::{Error, Result};
use crate::event::{FailureKind, StreamEvent};
use crate::parser::{self, Framing};
use crate::stream_buffer::BufferStats;
use crate::transport::Response;

/// Progress notifications delivered to [`Callbacks::on_progress`].
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    /// The body is being read.
    Started { status: u16 },
    /// The framing layer reported out-of-band information.
    Metadata { key: String, value: Value },
    /// The body was read to the end.
    Completed { stats: BufferStats },
    /// The stream failed; the handler is about to return an error.
    Error { error: String },
}

type ChunkFn<'a> = Box<dyn FnMut(&str) + Send + 'a>;
type ProgressFn<'a> = Box<dyn FnMut(&Progress) + Send + 'a>;

/// Optional observers for [`StreamingResponseHandler::handle`].
#[derive(Default)]
pub struct Callbacks<'a> {
    on_chunk: Option<ChunkFn<'a>>,
    on_progress: Option<ProgressFn<'a>>,
}

impl<'a> Callbacks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with each piece of decoded text, in order.
    pub fn on_chunk(mut self, f: impl FnMut(&str) + Send + 'a) -> Self {
        self.on_chunk = Some(Box::new(f));
        self
    }

    /// Called at start, on metadata, and at the end (success or failure).
    pub fn on_progress(mut self, f: impl FnMut(&Progress) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    fn chunk(&mut self, text: &str) {
        if let Some(f) = self.on_chunk.as_mut() {
            f(text);
        }
    }

    fn progress(&mut self, progress: Progress) {
        if let Some(f) = self.on_progress.as_mut() {
            f(&progress);
        }
    }
}

/// Reads a streamed response through a framing parser and a chunk decoder,
/// returning the concatenated text.
///
/// The Messages API specialization ([`StreamingResponseHandler::messages`])
/// differs from the plain SSE one only in its decoder.
#[derive(Clone)]
pub struct StreamingResponseHandler {
    framing: Framing,
    decoder: Arc<dyn ChunkDecoder>,
    buffer_size: usize,
    cancel: Option<CancellationToken>,
}

impl StreamingResponseHandler {
    /// Raw framing; every read is text.
    pub fn new() -> Self {
        Self {
            framing: Framing::Raw,
            decoder: Arc::new(PassThrough),
            buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            cancel: None,
        }
    }

    /// SSE framing; every record's data is text.
    pub fn sse() -> Self {
        Self::new().with_framing(Framing::Sse)
    }

    /// SSE framing with Messages API delta decoding.
    pub fn messages() -> Self {
        Self::sse().with_decoder(MessageDeltaDecoder)
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_decoder(mut self, decoder: impl ChunkDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Byte ceiling for one body.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Stops reading, and releases the response, when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The undecoded event stream for `response`.
    pub fn events(&self, response: Response) -> impl Stream<Item = StreamEvent> + Send + use<> {
        parser::events(response, self.framing.parser(), self.buffer_size)
    }

    /// Reads `response` to the end and returns the decoded text.
    ///
    /// On failure no text is returned: an in-stream error surfaces as
    /// [`Error::Api`], overflow as [`Error::Capacity`], and cancellation as
    /// [`Error::Cancelled`].
    pub async fn handle(&self, response: Response, mut callbacks: Callbacks<'_>) -> Result<String> {
        let cancel = self.cancel.clone().unwrap_or_default();
        let events = self.events(response);
        futures::pin_mut!(events);
        let mut content = String::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(received = content.len(), "stream cancelled");
                    return Err(Error::cancelled("stream cancelled"));
                }
                event = events.next() => event,
            };
            let Some(event) = event else {
                return Err(Error::network("stream ended without a terminal event", None));
            };
            match event {
                StreamEvent::Start { status, .. } => {
                    callbacks.progress(Progress::Started { status });
                }
                StreamEvent::Chunk { chunk, .. } => match self.decoder.decode(&chunk) {
                    Decoded::Text(text) => {
                        content.push_str(&text);
                        callbacks.chunk(&text);
                    }
                    Decoded::Skip => {}
                    Decoded::Fail(message) => {
                        warn!(error = %message, "server reported an error mid-stream");
                        callbacks.progress(Progress::Error {
                            error: message.clone(),
                        });
                        return Err(Error::api(None, format!("stream error: {message}")));
                    }
                },
                StreamEvent::Metadata { key, value, .. } => {
                    callbacks.progress(Progress::Metadata { key, value });
                }
                StreamEvent::End { stats, .. } => {
                    debug!(chars = content.len(), "stream handled");
                    callbacks.progress(Progress::Completed { stats });
                    return Ok(content);
                }
                StreamEvent::Error { message, kind, .. } => {
                    callbacks.progress(Progress::Error {
                        error: message.clone(),
                    });
                    return Err(match kind {
                        FailureKind::Capacity => Error::capacity(message, self.buffer_size),
                        FailureKind::Read | FailureKind::Timeout => {
                            Error::api(None, format!("stream error: {message}"))
                        }
                    });
                }
            }
        }
    }
}

impl Default for StreamingResponseHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamingResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponseHandler")
            .field("framing", &self.framing)
            .field("buffer_size", &self.buffer_size)
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// Reads a raw body to the end, passing each piece to `on_chunk`.
pub async fn stream_response(
    response: Response,
    on_chunk: impl FnMut(&str) + Send,
) -> Result<String> {
    StreamingResponseHandler::new()
        .handle(response, Callbacks::new().on_chunk(on_chunk))
        .await
}

/// Reads a Messages API event stream, passing each text delta to `on_chunk`.
pub async fn stream_messages_response(
    response: Response,
    on_chunk: impl FnMut(&str) + Send,
) -> Result<String> {
    StreamingResponseHandler::messages()
        .handle(response, Callbacks::new().on_chunk(on_chunk))
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ConnectionPoolConfig;
    use crate::pool::ConnectionPool;
    use crate::testing::{ScriptedTransport, Step};
    use crate::transport::{Request, Transport};

    const MESSAGE_STREAM: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"role\":\"assistant\"}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\": \"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", world\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    async fn respond(step: Step) -> Response {
        let transport = ScriptedTransport::new(vec![step]);
        let request = Request::get("http://localhost/").unwrap();
        transport.send(&request).await.unwrap()
    }

    #[tokio::test]
    async fn raw_stream_accumulates_and_reports() {
        let response = respond(Step::chunks(&[b"one ", b"two"])).await;
        let mut seen = Vec::new();
        let mut progress = Vec::new();
        let text = StreamingResponseHandler::new()
            .handle(
                response,
                Callbacks::new()
                    .on_chunk(|t| seen.push(t.to_string()))
                    .on_progress(|p| progress.push(p.clone())),
            )
            .await
            .unwrap();
        assert_eq!(text, "one two");
        assert_eq!(seen, vec!["one ", "two"]);
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0], Progress::Started { status: 200 });
        match &progress[1] {
            Progress::Completed { stats } => assert_eq!(stats.total_size, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_stream_yields_only_text_deltas() {
        // Split mid-record to exercise carry-over.
        let (head, tail) = MESSAGE_STREAM.split_at(301);
        let response = respond(Step::chunks(&[head.as_bytes(), tail.as_bytes()])).await;
        let mut seen = Vec::new();
        let text = stream_messages_response(response, |t| seen.push(t.to_string()))
            .await
            .unwrap();
        assert_eq!(text, "Hello, world");
        assert_eq!(seen, vec!["Hello", ", world"]);
    }

    #[tokio::test]
    async fn plain_sse_returns_data_fields() {
        let response = respond(Step::ok("data: a\n\n: comment\ndata: b\n\n")).await;
        let text = StreamingResponseHandler::sse()
            .handle(response, Callbacks::new())
            .await
            .unwrap();
        assert_eq!(text, "ab");
    }

    #[tokio::test]
    async fn retry_hint_is_reported_as_progress() {
        let response = respond(Step::ok("retry: 250\ndata: x\n\n")).await;
        let mut progress = Vec::new();
        StreamingResponseHandler::sse()
            .handle(response, Callbacks::new().on_progress(|p| progress.push(p.clone())))
            .await
            .unwrap();
        assert_eq!(
            progress[1],
            Progress::Metadata {
                key: "retry".to_string(),
                value: Value::from(250u64),
            }
        );
    }

    #[tokio::test]
    async fn in_stream_error_fails_without_partial_text() {
        let body = concat!(
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"partial\"}}\n\n",
            "event: error\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        let response = respond(Step::ok(body)).await;
        let mut progress = Vec::new();
        let err = StreamingResponseHandler::messages()
            .handle(response, Callbacks::new().on_progress(|p| progress.push(p.clone())))
            .await
            .unwrap_err();
        assert!(err.is_api());
        assert!(err.to_string().contains("Overloaded"));
        assert!(matches!(progress.last(), Some(Progress::Error { .. })));
    }

    #[tokio::test]
    async fn read_failure_is_an_api_error() {
        let response = respond(Step::ok("some").broken("reset by peer")).await;
        let mut progress = Vec::new();
        let err = stream_response(response, |_| {})
            .await
            .unwrap_err();
        assert!(err.is_api());
        assert!(err.to_string().contains("reset by peer"));
        let response = respond(Step::ok("some").broken("reset by peer")).await;
        let _ = StreamingResponseHandler::new()
            .handle(response, Callbacks::new().on_progress(|p| progress.push(p.clone())))
            .await;
        match progress.last() {
            Some(Progress::Error { error }) => assert!(error.contains("reset by peer")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_is_a_capacity_error() {
        let response = respond(Step::chunks(&[b"0123456789", b"!"])).await;
        let err = StreamingResponseHandler::new()
            .with_buffer_size(10)
            .handle(response, Callbacks::new())
            .await
            .unwrap_err();
        assert!(err.is_capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_mid_stream_releases_the_connection() {
        let transport = ScriptedTransport::new(vec![Step::ok("data: first\n\n").hang()]);
        let pool = ConnectionPool::with_transport(ConnectionPoolConfig::new(), transport).unwrap();
        let token = CancellationToken::new();
        let response = pool
            .request(
                Request::get("http://localhost/stream")
                    .unwrap()
                    .streaming()
                    .with_cancellation(token.clone()),
            )
            .await
            .unwrap();
        assert_eq!(pool.stats().active_connections, 1);

        tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            }
        });
        let mut seen = Vec::new();
        let err = StreamingResponseHandler::sse()
            .with_cancellation(token)
            .handle(response, Callbacks::new().on_chunk(|t| seen.push(t.to_string())))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_network());
        assert_eq!(seen, vec!["first"]);
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, stats.total_connections);
    }
}
