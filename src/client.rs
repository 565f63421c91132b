use std::env;

use reqwest::Url;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::handler::{Callbacks, StreamingResponseHandler};
use crate::pool::ConnectionPool;
use crate::transport::Request;

pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/";
pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// One completed exchange: what was asked and what came back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub query: String,
    pub response: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Interaction {
    /// Creates an interaction stamped with the current time.
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Serialize)]
struct MessageParam<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<MessageParam<'a>>,
    system: &'a str,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Client for the Messages API, sending through a shared [`ConnectionPool`].
///
/// Conversation state lives with the caller: every call takes the prior
/// [`Interaction`]s and returns them extended by the new one.
#[derive(Clone)]
pub struct MessagesClient {
    pool: ConnectionPool,
    api_key: String,
    base_url: Url,
    model: String,
    max_tokens: u32,
    system_prompt: String,
}

impl MessagesClient {
    /// Create a new client.
    ///
    /// The API key can be provided directly or read from the `ASK_API_KEY`
    /// (then `ANTHROPIC_API_KEY`) environment variable.
    pub fn new(pool: ConnectionPool, api_key: Option<String>) -> Result<Self> {
        let api_key = match api_key {
            Some(key) => key,
            None => env::var("ASK_API_KEY")
                .or_else(|_| env::var("ANTHROPIC_API_KEY"))
                .map_err(|_| {
                    Error::config(
                        "API key not provided and neither ASK_API_KEY nor ANTHROPIC_API_KEY is set",
                        Some("api_key".to_string()),
                    )
                })?,
        };
        if api_key.trim().is_empty() || HeaderValue::from_str(&api_key).is_err() {
            return Err(Error::config(
                "API key is empty or not a valid header value",
                Some("api_key".to_string()),
            ));
        }
        Ok(Self {
            pool,
            api_key,
            base_url: Url::parse(DEFAULT_API_URL)?,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    /// Points the client at another API root.  A missing trailing slash is added.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = Url::parse(&base_url)
            .map_err(|e| Error::url(format!("invalid base URL {base_url:?}: {e}"), Some(e)))?;
        Ok(self)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The pool requests go through.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Asks `query` after `history` and waits for the whole answer.
    pub async fn complete(
        &self,
        query: &str,
        history: &[Interaction],
    ) -> Result<(String, Vec<Interaction>)> {
        self.complete_with_cancellation(query, history, CancellationToken::new())
            .await
    }

    /// [`MessagesClient::complete`], abandoned when `cancel` fires.
    #[instrument(skip(self, query, history, cancel), fields(model = %self.model, turns = history.len()))]
    pub async fn complete_with_cancellation(
        &self,
        query: &str,
        history: &[Interaction],
        cancel: CancellationToken,
    ) -> Result<(String, Vec<Interaction>)> {
        let request = self
            .build_request(query, history, false)?
            .with_cancellation(cancel.clone());
        let response = self.pool.request(request).await?;
        let body: MessagesResponse = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::cancelled("request cancelled while reading the response"));
            }
            body = response.json() => body?,
        };
        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        debug!(chars = text.len(), "completion received");
        Ok((text.clone(), extend(history, query, text)))
    }

    /// Asks `query` after `history`, delivering the answer through
    /// `callbacks` as it streams in.
    pub async fn stream(
        &self,
        query: &str,
        history: &[Interaction],
        callbacks: Callbacks<'_>,
    ) -> Result<(String, Vec<Interaction>)> {
        self.stream_with_cancellation(query, history, callbacks, CancellationToken::new())
            .await
    }

    /// [`MessagesClient::stream`], abandoned when `cancel` fires.
    #[instrument(skip(self, query, history, callbacks, cancel), fields(model = %self.model, turns = history.len()))]
    pub async fn stream_with_cancellation(
        &self,
        query: &str,
        history: &[Interaction],
        callbacks: Callbacks<'_>,
        cancel: CancellationToken,
    ) -> Result<(String, Vec<Interaction>)> {
        let request = self
            .build_request(query, history, true)?
            .streaming()
            .with_cancellation(cancel.clone());
        let response = self.pool.request(request).await?;
        let text = StreamingResponseHandler::messages()
            .with_buffer_size(self.pool.config().stream_buffer_size)
            .with_cancellation(cancel)
            .handle(response, callbacks)
            .await?;
        debug!(chars = text.len(), "stream received");
        Ok((text.clone(), extend(history, query, text)))
    }

    fn build_request(&self, query: &str, history: &[Interaction], stream: bool) -> Result<Request> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 1);
        for interaction in history {
            messages.push(MessageParam {
                role: "user",
                content: &interaction.query,
            });
            messages.push(MessageParam {
                role: "assistant",
                content: &interaction.response,
            });
        }
        messages.push(MessageParam {
            role: "user",
            content: query,
        });
        let payload = MessagesRequest {
            model: &self.model,
            messages,
            system: &self.system_prompt,
            max_tokens: self.max_tokens,
            stream,
        };
        let url = self.base_url.join("messages")?;
        Request::post(url.as_str())?
            .header(HeaderName::from_static("x-api-key"), &self.api_key)?
            .header(
                HeaderName::from_static("anthropic-version"),
                ANTHROPIC_API_VERSION,
            )?
            .json(&payload)
    }
}

impl std::fmt::Debug for MessagesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagesClient")
            .field("base_url", &self.base_url.as_str())
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

fn extend(history: &[Interaction], query: &str, response: String) -> Vec<Interaction> {
    let mut history = history.to_vec();
    history.push(Interaction::new(query, response));
    history
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::config::ConnectionPoolConfig;
    use crate::testing::{ScriptedTransport, Step};

    fn client(transport: &Arc<ScriptedTransport>) -> MessagesClient {
        let pool = ConnectionPool::with_transport(ConnectionPoolConfig::new(), transport.clone())
            .unwrap();
        MessagesClient::new(pool, Some("test-key".to_string())).unwrap()
    }

    fn sent_payload(transport: &ScriptedTransport) -> Value {
        let request = transport.requests().pop().unwrap();
        serde_json::from_slice(request.body.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn defaults_and_overrides() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(&transport);
        assert_eq!(client.base_url().as_str(), DEFAULT_API_URL);
        assert_eq!(client.model(), DEFAULT_MODEL);
        assert_eq!(client.max_tokens(), 1024);
        assert_eq!(client.system_prompt(), "You are a helpful assistant.");

        let client = client
            .with_base_url("http://localhost:8080/v1")
            .unwrap()
            .with_model("claude-test")
            .with_max_tokens(64)
            .with_system_prompt("Be brief.");
        assert_eq!(client.base_url().as_str(), "http://localhost:8080/v1/");
        assert_eq!(client.model(), "claude-test");
        assert_eq!(client.max_tokens(), 64);
        assert_eq!(client.system_prompt(), "Be brief.");
    }

    #[test]
    fn rejects_unusable_api_keys() {
        let transport = ScriptedTransport::new(vec![]);
        let pool =
            ConnectionPool::with_transport(ConnectionPoolConfig::new(), transport).unwrap();
        let err = MessagesClient::new(pool.clone(), Some("bad\nkey".to_string())).unwrap_err();
        assert!(err.is_config());
        assert!(MessagesClient::new(pool, Some("  ".to_string())).is_err());
    }

    #[tokio::test]
    async fn complete_sends_history_and_joins_text_blocks() {
        let body = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Paris"},
                {"type": "tool_use", "id": "t", "name": "x", "input": {}},
                {"type": "text", "text": "."}
            ]
        });
        let transport = ScriptedTransport::new(vec![Step::ok(&body.to_string())]);
        let client = client(&transport);
        let history = vec![Interaction::new("Hi", "Hello!")];
        let (text, history) = client
            .complete("Capital of France?", &history)
            .await
            .unwrap();
        assert_eq!(text, "Paris.");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].query, "Capital of France?");
        assert_eq!(history[1].response, "Paris.");

        let request = &transport.requests()[0];
        assert_eq!(request.url.as_str(), "https://api.anthropic.com/v1/messages");
        assert_eq!(request.headers["x-api-key"], "test-key");
        assert_eq!(request.headers["anthropic-version"], ANTHROPIC_API_VERSION);
        assert_eq!(
            sent_payload(&transport),
            json!({
                "model": DEFAULT_MODEL,
                "messages": [
                    {"role": "user", "content": "Hi"},
                    {"role": "assistant", "content": "Hello!"},
                    {"role": "user", "content": "Capital of France?"}
                ],
                "system": DEFAULT_SYSTEM_PROMPT,
                "max_tokens": 1024,
                "stream": false
            })
        );
    }

    #[tokio::test]
    async fn stream_collects_deltas() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Bon\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"jour\"}}\n\n",
            "data: [DONE]\n\n",
        );
        let transport = ScriptedTransport::new(vec![Step::ok(body)]);
        let client = client(&transport);
        let mut seen = String::new();
        let (text, history) = client
            .stream("Say hello in French", &[], Callbacks::new().on_chunk(|t| seen.push_str(t)))
            .await
            .unwrap();
        assert_eq!(text, "Bonjour");
        assert_eq!(seen, "Bonjour");
        assert_eq!(history, vec![Interaction {
            timestamp: history[0].timestamp,
            ..Interaction::new("Say hello in French", "Bonjour")
        }]);
        assert_eq!(sent_payload(&transport)["stream"], true);
        assert_eq!(transport.requests()[0].headers["accept"], "text/event-stream");
    }

    #[tokio::test]
    async fn api_errors_surface_with_status() {
        let transport = ScriptedTransport::new(vec![Step::status(401).body(
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        )]);
        let client = client(&transport);
        let err = client.complete("hi", &[]).await.unwrap_err();
        assert_eq!(err.status_code(), Some(401));
        assert!(err.to_string().contains("invalid x-api-key"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_reading_completion_body() {
        let transport = ScriptedTransport::new(vec![Step::ok("{\"content\":[").hang()]);
        let client = client(&transport);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let started = tokio::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(600),
            client.complete_with_cancellation("hi", &[], token),
        )
        .await
        .expect("completion should stop once cancelled")
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.pool().stats().active_connections, 0);
    }
}
