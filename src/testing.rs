//! A scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::transport::{Request, Response, Transport, TransportError, TransportErrorKind};

enum Reply {
    Respond {
        status: u16,
        headers: HeaderMap,
        chunks: Vec<std::result::Result<Bytes, TransportError>>,
        then_hang: bool,
    },
    Fail(TransportErrorKind),
    Stall,
}

/// One scripted exchange.
pub(crate) struct Step {
    reply: Reply,
    delay: Duration,
}

impl Step {
    pub(crate) fn status(status: u16) -> Self {
        Self {
            reply: Reply::Respond {
                status,
                headers: HeaderMap::new(),
                chunks: vec![],
                then_hang: false,
            },
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn ok(body: &str) -> Self {
        Self::status(200).body(body)
    }

    /// A 200 whose body arrives in the given pieces.
    pub(crate) fn chunks(pieces: &[&[u8]]) -> Self {
        let mut step = Self::status(200);
        for piece in pieces {
            step = step.push(Ok(Bytes::copy_from_slice(piece)));
        }
        step
    }

    pub(crate) fn fail(kind: TransportErrorKind) -> Self {
        Self {
            reply: Reply::Fail(kind),
            delay: Duration::ZERO,
        }
    }

    /// Never answers.
    pub(crate) fn stall() -> Self {
        Self {
            reply: Reply::Stall,
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn body(self, body: &str) -> Self {
        self.push(Ok(Bytes::copy_from_slice(body.as_bytes())))
    }

    /// Appends a body read failure.
    pub(crate) fn broken(self, message: &str) -> Self {
        self.push(Err(TransportError::new(
            TransportErrorKind::Other,
            message,
            None,
        )))
    }

    /// After the scripted body, the stream never ends.
    pub(crate) fn hang(mut self) -> Self {
        if let Reply::Respond { then_hang, .. } = &mut self.reply {
            *then_hang = true;
        }
        self
    }

    pub(crate) fn header(mut self, name: &'static str, value: &'static str) -> Self {
        if let Reply::Respond { headers, .. } = &mut self.reply {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        self
    }

    /// Delays the response head.
    pub(crate) fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn push(mut self, chunk: std::result::Result<Bytes, TransportError>) -> Self {
        if let Reply::Respond { chunks, .. } = &mut self.reply {
            chunks.push(chunk);
        }
        self
    }
}

/// Plays back a fixed list of steps, one per `send`.
pub(crate) struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<Request>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far.
    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &Request) -> std::result::Result<Response, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        let Some(step) = step else {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "script exhausted",
                None,
            ));
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        match step.reply {
            Reply::Respond {
                status,
                headers,
                chunks,
                then_hang,
            } => {
                let body = stream::iter(chunks);
                if then_hang {
                    Ok(Response::new(status, headers, body.chain(stream::pending())))
                } else {
                    Ok(Response::new(status, headers, body))
                }
            }
            Reply::Fail(kind) => Err(TransportError::new(kind, "scripted failure", None)),
            Reply::Stall => futures::future::pending().await,
        }
    }
}
