// Public modules
pub mod chat;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod handler;
pub mod observability;
pub mod parser;
pub mod pool;
pub mod rate_limiter;
pub mod retry;
pub mod sse;
pub mod stream_buffer;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports
pub use client::{Interaction, MessagesClient};
pub use config::ConnectionPoolConfig;
pub use decoder::{ChunkDecoder, Decoded, MessageDeltaDecoder, PassThrough};
pub use error::{Error, Result};
pub use event::{Chunk, FailureKind, StreamEvent};
pub use handler::{
    Callbacks, Progress, StreamingResponseHandler, stream_messages_response, stream_response,
};
pub use observability::register_biometrics;
pub use parser::{EventParser, Frame, Framing, ParserState, RawParser};
pub use pool::{ConnectionLease, ConnectionPool, PoolStatistics};
pub use rate_limiter::RateLimiter;
pub use retry::{Action, Outcome, RetryPolicy};
pub use sse::SseParser;
pub use stream_buffer::{BufferStats, StreamBuffer};
pub use transport::{HttpTransport, Request, Response, Transport, TransportError, TransportErrorKind};
