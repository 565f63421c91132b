//! Server-Sent Events framing.
//!
//! Lines are `field: value`; a blank line ends a record.  A record is
//! dispatched only if it carried at least one `data` line.  A `retry` field is
//! reported immediately as metadata.  Lines without a colon and unknown fields
//! are ignored, as is a record left unterminated when the body ends.

use serde_json::Value;
use tracing::debug;

use crate::event::Chunk;
use crate::parser::{EventParser, Frame};

#[derive(Debug, Default)]
struct Record {
    data: Option<String>,
    event: Option<String>,
    id: Option<String>,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub struct SseParser {
    line: String,
    record: Record,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one complete line (without its terminator).
    pub fn feed_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let Some((field, value)) = line.split_once(':') else {
            return None;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => match &mut self.record.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.record.data = Some(value.to_string()),
            },
            "event" => self.record.event = Some(value.to_string()),
            "id" => self.record.id = Some(value.to_string()),
            "retry" => match value.trim().parse::<u64>() {
                Ok(millis) => {
                    return Some(Frame::Metadata {
                        key: "retry".to_string(),
                        value: Value::from(millis),
                    });
                }
                Err(_) => debug!(value, "ignoring malformed retry field"),
            },
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let Record { data, event, id } = std::mem::take(&mut self.record);
        data.map(|text| Frame::Chunk(Chunk { text, event, id }))
    }
}

impl EventParser for SseParser {
    fn feed(&mut self, text: &str) -> Vec<Frame> {
        self.line.push_str(text);
        let mut frames = Vec::new();
        while let Some(newline) = self.line.find('\n') {
            let mut line: String = self.line.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            frames.extend(self.feed_line(&line));
        }
        frames
    }

    fn finish(&mut self) -> Vec<Frame> {
        if !self.line.is_empty() || self.record.data.is_some() {
            debug!("discarding unterminated event at end of stream");
        }
        self.line.clear();
        self.record = Record::default();
        Vec::new()
    }
}
