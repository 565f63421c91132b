//! Chunk decoders: the vendor-specific step between framing and text.

use serde_json::Value;

use crate::event::Chunk;

/// Data line that marks the end of a message stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// What a chunk decodes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Text for the caller.
    Text(String),
    /// Nothing for the caller (pings, bookkeeping events).
    Skip,
    /// The server reported an error inside the stream.
    Fail(String),
}

/// Turns a framed chunk into caller-visible text.
pub trait ChunkDecoder: Send + Sync {
    fn decode(&self, chunk: &Chunk) -> Decoded;
}

impl<F> ChunkDecoder for F
where
    F: Fn(&Chunk) -> Decoded + Send + Sync,
{
    fn decode(&self, chunk: &Chunk) -> Decoded {
        self(chunk)
    }
}

/// Hands every chunk's text through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl ChunkDecoder for PassThrough {
    fn decode(&self, chunk: &Chunk) -> Decoded {
        Decoded::Text(chunk.text.clone())
    }
}

/// Extracts text deltas from the Messages API event stream.
///
/// `content_block_delta` events yield their `delta.text`; `error` events (by
/// SSE event name or JSON `type`) fail the stream; other JSON events and the
/// `[DONE]` sentinel are skipped.  Data that is not JSON passes through as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageDeltaDecoder;

impl ChunkDecoder for MessageDeltaDecoder {
    fn decode(&self, chunk: &Chunk) -> Decoded {
        if chunk.text.trim() == DONE_SENTINEL {
            return Decoded::Skip;
        }
        let value: Value = match serde_json::from_str(&chunk.text) {
            Ok(value) => value,
            Err(_) if chunk.event.as_deref() == Some("error") => {
                return Decoded::Fail(chunk.text.clone());
            }
            Err(_) => return Decoded::Text(chunk.text.clone()),
        };
        let kind = value.get("type").and_then(Value::as_str);
        if kind == Some("error") || chunk.event.as_deref() == Some("error") {
            return Decoded::Fail(error_message(&value));
        }
        match kind {
            Some("content_block_delta") => match value.pointer("/delta/text").and_then(Value::as_str) {
                Some(text) if !text.is_empty() => Decoded::Text(text.to_string()),
                _ => Decoded::Skip,
            },
            _ => Decoded::Skip,
        }
    }
}

fn error_message(value: &Value) -> String {
    let error = value.get("error").unwrap_or(value);
    match (
        error.get("type").and_then(Value::as_str),
        error.get("message").and_then(Value::as_str),
    ) {
        (Some(kind), Some(message)) => format!("{kind}: {message}"),
        (None, Some(message)) => message.to_string(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(event: &str, data: &str) -> Chunk {
        Chunk {
            text: data.to_string(),
            event: Some(event.to_string()),
            id: None,
        }
    }

    #[test]
    fn text_deltas_are_extracted() {
        let chunk = sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert_eq!(MessageDeltaDecoder.decode(&chunk), Decoded::Text("Hi".to_string()));
    }

    #[test]
    fn bookkeeping_events_are_skipped() {
        for (event, data) in [
            ("message_start", r#"{"type":"message_start","message":{"id":"msg_1"}}"#),
            ("ping", r#"{"type": "ping"}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","delta":{"text":""}}"#),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ] {
            assert_eq!(MessageDeltaDecoder.decode(&sse(event, data)), Decoded::Skip, "{data}");
        }
        assert_eq!(MessageDeltaDecoder.decode(&Chunk::text("[DONE]")), Decoded::Skip);
    }

    #[test]
    fn non_json_passes_through() {
        assert_eq!(
            MessageDeltaDecoder.decode(&Chunk::text("plain words")),
            Decoded::Text("plain words".to_string())
        );
    }

    #[test]
    fn errors_fail_the_stream() {
        let chunk = sse(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(
            MessageDeltaDecoder.decode(&chunk),
            Decoded::Fail("overloaded_error: Overloaded".to_string())
        );
        assert_eq!(
            MessageDeltaDecoder.decode(&sse("error", "boom")),
            Decoded::Fail("boom".to_string())
        );
    }

    #[test]
    fn closures_are_decoders() {
        let upper = |chunk: &Chunk| Decoded::Text(chunk.text.to_uppercase());
        assert_eq!(upper.decode(&Chunk::text("abc")), Decoded::Text("ABC".to_string()));
        assert_eq!(PassThrough.decode(&Chunk::text("abc")), Decoded::Text("abc".to_string()));
    }
}
