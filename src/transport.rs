//! Requests, responses, and the transport seam beneath the pool.
//!
//! The pool never talks to `reqwest` directly: it drives a [`Transport`],
//! which for production is [`HttpTransport`].  Tests substitute scripted
//! transports to exercise the retry loop without a network.

use std::error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionPoolConfig;
use crate::error::{Error, Result};
use crate::pool::ConnectionLease;

/// A body as a stream of byte chunks.
pub type BodyStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, TransportError>> + Send>>;

/// An outbound request.
///
/// The body is serialized up front so that retries resend identical bytes.
#[derive(Clone, Debug)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Serialized body.
    pub body: Option<Bytes>,
    /// Whether the caller will consume the body as an event stream.
    pub stream: bool,
    /// Cancels the request (and any wait on its behalf) when triggered.
    pub cancel: Option<CancellationToken>,
}

impl Request {
    /// Creates a request with no headers or body.
    pub fn new(method: Method, url: &str) -> Result<Self> {
        Ok(Self {
            method,
            url: Url::parse(url)?,
            headers: HeaderMap::new(),
            body: None,
            stream: false,
            cancel: None,
        })
    }

    /// Creates a GET request.
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    /// Creates a POST request.
    pub fn post(url: &str) -> Result<Self> {
        Self::new(Method::POST, url)
    }

    /// Adds a header, replacing any previous value.
    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            Error::config(
                format!("invalid value for header {name}: {e}"),
                Some(name.to_string()),
            )
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Serializes `body` as JSON and sets the content type.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Marks the request as streaming and asks for `text/event-stream`.
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self.headers
            .insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The key connections are grouped by: `host:port`.
    pub fn host_key(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

/// A response whose body has not been read yet.
///
/// While a response obtained from the pool is alive it holds its connection
/// slot; dropping it (read to the end or not) gives the slot back.
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: BodyStream,
    lease: Option<ConnectionLease>,
}

impl Response {
    /// Creates a response from a status, headers and a body stream.
    pub fn new<S>(status: u16, headers: HeaderMap, body: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, TransportError>> + Send + 'static,
    {
        Self {
            status,
            headers,
            body: Box::pin(body),
            lease: None,
        }
    }

    /// Creates a response with a body already in memory.
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let chunks: Vec<std::result::Result<Bytes, TransportError>> =
            if body.is_empty() { vec![] } else { vec![Ok(body)] };
        Self::new(status, headers, stream::iter(chunks))
    }

    /// HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Reads the next body chunk; `None` at the end of the body.
    pub async fn chunk(&mut self) -> Option<std::result::Result<Bytes, TransportError>> {
        self.body.next().await
    }

    /// Reads the whole body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            let chunk = chunk.map_err(|e| {
                Error::network(format!("failed to read response body: {e}"), Some(Box::new(e)))
            })?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Reads the whole body as text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads the whole body and parses it as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::serialization(format!("Failed to parse response: {e}"), Some(Box::new(e)))
        })
    }

    pub(crate) fn attach_lease(&mut self, lease: ConnectionLease) {
        self.lease = Some(lease);
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("leased", &self.lease.is_some())
            .finish_non_exhaustive()
    }
}

/// Broad classes of transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection could not be established.
    Connect,
    /// A connect, read, or overall timeout expired.
    Timeout,
    /// Anything else that broke the exchange.
    Other,
}

/// A failure below HTTP: nothing usable came back.
#[derive(Clone, Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
}

impl TransportError {
    /// Creates a transport error.
    pub fn new(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message, None)
    }

    /// Creates a connect error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message, None)
    }

    /// The failure class.
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Returns true for timeouts.
    pub fn is_timeout(&self) -> bool {
        self.kind == TransportErrorKind::Timeout
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportErrorKind::Connect => write!(f, "connection failed: {}", self.message),
            TransportErrorKind::Timeout => write!(f, "timed out: {}", self.message),
            TransportErrorKind::Other => write!(f, "{}", self.message),
        }
    }
}

impl error::Error for TransportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        };
        TransportError::new(kind, err.to_string(), Some(Box::new(err)))
    }
}

/// Sends one request and returns the response head with an unread body.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a single exchange; no retries.
    async fn send(&self, request: &Request) -> std::result::Result<Response, TransportError>;
}

/// [`Transport`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
}

impl HttpTransport {
    /// Builds the underlying client: idle connections kept per host up to the
    /// per-host ceiling, and connect/read timeouts of a third of the total.
    pub fn new(config: &ConnectionPoolConfig) -> Result<Self> {
        let client = ReqwestClient::builder()
            .pool_max_idle_per_host(config.max_connections_per_host)
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .user_agent(concat!("ask/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                Error::network(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> std::result::Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from));
        Ok(Response::new(status, headers, body))
    }
}
