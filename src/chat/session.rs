//! Conversation state for the REPL.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::client::{Interaction, MessagesClient};
use crate::error::Result;
use crate::handler::Callbacks;
use crate::pool::PoolStatistics;

/// Snapshot printed by `/stats`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub model: String,
    pub turns: usize,
    pub streaming: bool,
    pub pool: PoolStatistics,
}

/// A conversation: the client plus the interactions so far.
///
/// History only grows on success, so a failed or cancelled turn can simply
/// be asked again.
pub struct ChatSession {
    client: MessagesClient,
    history: Vec<Interaction>,
    stream: bool,
}

impl ChatSession {
    pub fn new(client: MessagesClient, stream: bool) -> Self {
        Self {
            client,
            history: Vec::new(),
            stream,
        }
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn history(&self) -> &[Interaction] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            model: self.client.model().to_string(),
            turns: self.history.len(),
            streaming: self.stream,
            pool: self.client.pool().stats(),
        }
    }

    /// Sends `query`, passing text to `on_text` as it arrives (all at once
    /// when not streaming).
    pub async fn send(
        &mut self,
        query: &str,
        mut on_text: impl FnMut(&str) + Send,
        cancel: CancellationToken,
    ) -> Result<String> {
        let (text, history) = if self.stream {
            self.client
                .stream_with_cancellation(
                    query,
                    &self.history,
                    Callbacks::new().on_chunk(&mut on_text),
                    cancel,
                )
                .await?
        } else {
            let (text, history) = self
                .client
                .complete_with_cancellation(query, &self.history, cancel)
                .await?;
            on_text(&text);
            (text, history)
        };
        self.history = history;
        Ok(text)
    }
}
