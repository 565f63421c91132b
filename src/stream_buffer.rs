//! Bounded accumulation of streamed text.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::DEFAULT_STREAM_BUFFER_SIZE;
use crate::error::{Error, Result};

/// Throughput figures for one stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BufferStats {
    /// Bytes accepted so far.
    pub total_size: usize,
    /// Chunks accepted so far.
    pub chunk_count: usize,
    /// Time since the buffer was created or cleared.
    #[serde(with = "crate::utils::seconds")]
    pub duration: Duration,
    /// Mean bytes per chunk.
    pub average_chunk_size: f64,
    /// Chunks per second over `duration`.
    pub chunks_per_second: f64,
    /// Bytes per second over `duration`.
    pub bytes_per_second: f64,
}

/// Accumulates the chunks of one response up to a hard byte ceiling.
///
/// Exceeding the ceiling is an error, never a truncation; the rejected chunk
/// leaves the buffer untouched.
#[derive(Debug)]
pub struct StreamBuffer {
    max_size: usize,
    chunks: Vec<String>,
    total_size: usize,
    chunk_count: usize,
    start_time: Instant,
    last_chunk_time: Instant,
}

impl StreamBuffer {
    /// Creates an empty buffer that accepts at most `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        let now = Instant::now();
        Self {
            max_size,
            chunks: Vec::new(),
            total_size: 0,
            chunk_count: 0,
            start_time: now,
            last_chunk_time: now,
        }
    }

    /// Appends a chunk, or fails with [`Error::Capacity`] if it would not fit.
    pub fn add_chunk(&mut self, chunk: &str) -> Result<()> {
        let chunk_size = chunk.len();
        if self.total_size.saturating_add(chunk_size) > self.max_size {
            return Err(Error::capacity(
                format!(
                    "chunk of {chunk_size} bytes does not fit after {} buffered bytes",
                    self.total_size
                ),
                self.max_size,
            ));
        }
        self.chunks.push(chunk.to_string());
        self.total_size += chunk_size;
        self.chunk_count += 1;
        self.last_chunk_time = Instant::now();
        Ok(())
    }

    /// The accumulated text in arrival order.
    pub fn content(&self) -> String {
        self.chunks.concat()
    }

    /// Drops all chunks and restarts the clock.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_size = 0;
        self.chunk_count = 0;
        self.start_time = Instant::now();
        self.last_chunk_time = self.start_time;
    }

    /// Bytes accepted so far.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Chunks accepted so far.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// The byte ceiling.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// When the most recent chunk was accepted.
    pub fn last_chunk_time(&self) -> Instant {
        self.last_chunk_time
    }

    /// Current throughput figures.
    pub fn stats(&self) -> BufferStats {
        let duration = self.start_time.elapsed();
        let secs = duration.as_secs_f64();
        let per_second = |n: usize| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        BufferStats {
            total_size: self.total_size,
            chunk_count: self.chunk_count,
            duration,
            average_chunk_size: if self.chunk_count > 0 {
                self.total_size as f64 / self.chunk_count as f64
            } else {
                0.0
            },
            chunks_per_second: per_second(self.chunk_count),
            bytes_per_second: per_second(self.total_size),
        }
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER_SIZE)
    }
}
