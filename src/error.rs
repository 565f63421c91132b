//! Error types for the ask client.
//!
//! Every failure that crosses the public boundary of the pool, the stream
//! handler, or the messages client is one of the variants below.  The core
//! request path only ever produces `Network`, `RateLimit`, `Api`, `Capacity`
//! and `Cancelled`; the remaining variants cover configuration and local I/O.

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// The main error type for the ask crate.
#[derive(Clone, Debug)]
pub enum Error {
    /// The request could not be delivered: transport failures and server
    /// errors once the retry budget is exhausted, or a closed pool.
    Network {
        /// Human-readable error message.
        message: String,
        /// The last underlying cause, if any.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The server kept answering 429.
    RateLimit {
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
    },

    /// The API rejected the request, or a stream reported an error.
    Api {
        /// HTTP status code, when the failure came from a response status.
        status_code: Option<u16>,
        /// Human-readable error message.
        message: String,
    },

    /// A stream outgrew its buffer.
    Capacity {
        /// Human-readable error message.
        message: String,
        /// The configured ceiling in bytes.
        max_size: usize,
    },

    /// The caller cancelled the request.
    Cancelled {
        /// Human-readable error message.
        message: String,
    },

    /// Invalid configuration.
    Config {
        /// Human-readable error message.
        message: String,
        /// Setting that failed validation.
        param: Option<String>,
    },

    /// Error during JSON or YAML serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// I/O error.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// A URL parsing or manipulation error.
    Url {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },
}

impl Error {
    /// Creates a new network error.
    pub fn network(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Network {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new rate limit error.
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new API error.
    pub fn api(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Error::Api {
            status_code,
            message: message.into(),
        }
    }

    /// Creates a new capacity error.
    pub fn capacity(message: impl Into<String>, max_size: usize) -> Self {
        Error::Capacity {
            message: message.into(),
            max_size,
        }
    }

    /// Creates a new cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::Cancelled {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    pub fn config(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Config {
            message: message.into(),
            param,
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a new URL error.
    pub fn url(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::Url {
            message: message.into(),
            source,
        }
    }

    /// Returns true if this is a network error.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }

    /// Returns true if this error is related to rate limiting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimit { .. })
    }

    /// Returns true if this is an API error.
    pub fn is_api(&self) -> bool {
        matches!(self, Error::Api { .. })
    }

    /// Returns true if a stream exceeded its buffer.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Capacity { .. })
    }

    /// Returns true if the caller cancelled the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Returns true if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. })
    }

    /// Returns true if issuing the same request later may succeed.
    ///
    /// Capacity and cancellation are final for the request that hit them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } | Error::RateLimit { .. } => true,
            Error::Api { status_code, .. } => matches!(status_code, Some(408 | 429 | 500..=599)),
            _ => false,
        }
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status_code, .. } => *status_code,
            Error::RateLimit { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns the suggested wait in seconds, if the server gave one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Network { message, .. } => {
                write!(f, "Network error: {message}")
            }
            Error::RateLimit {
                message,
                retry_after,
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Rate limit exceeded: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Rate limit exceeded: {message}")
                }
            }
            Error::Api {
                status_code,
                message,
            } => {
                if let Some(status_code) = status_code {
                    write!(f, "API error ({status_code}): {message}")
                } else {
                    write!(f, "API error: {message}")
                }
            }
            Error::Capacity { message, max_size } => {
                write!(f, "Capacity exceeded: {message} (limit {max_size} bytes)")
            }
            Error::Cancelled { message } => {
                write!(f, "Cancelled: {message}")
            }
            Error::Config { message, param } => {
                if let Some(param) = param {
                    write!(f, "Configuration error: {message} (setting: {param})")
                } else {
                    write!(f, "Configuration error: {message}")
                }
            }
            Error::Serialization { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Error::Io { message, .. } => {
                write!(f, "I/O error: {message}")
            }
            Error::Url { message, .. } => {
                write!(f, "URL error: {message}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Network { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Serialization { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source),
            Error::Url { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(format!("YAML error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::url(format!("URL parse error: {err}"), Some(err))
    }
}

/// A specialized Result type for ask operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::network("reset", None).is_retryable());
        assert!(Error::rate_limit("slow down", Some(2)).is_retryable());
        assert!(Error::api(Some(503), "unavailable").is_retryable());
        assert!(!Error::api(Some(404), "missing").is_retryable());
        assert!(!Error::api(None, "stream error").is_retryable());
        assert!(!Error::capacity("too big", 16).is_retryable());
        assert!(!Error::cancelled("ctrl-c").is_retryable());
    }

    #[test]
    fn status_and_retry_after() {
        let err = Error::rate_limit("slow down", Some(7));
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(err.retry_after(), Some(7));
        assert_eq!(Error::api(Some(400), "bad").status_code(), Some(400));
        assert_eq!(Error::network("down", None).status_code(), None);
    }

    #[test]
    fn display_includes_details() {
        let err = Error::rate_limit("Too many requests", Some(30));
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded: Too many requests (retry after 30 seconds)"
        );
        let err = Error::api(Some(404), "not_found");
        assert_eq!(err.to_string(), "API error (404): not_found");
        let err = Error::capacity("buffer full", 1024);
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: buffer full (limit 1024 bytes)"
        );
    }

    #[test]
    fn network_error_exposes_source() {
        let cause = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::network("request failed", Some(Box::new(cause)));
        let source = error::Error::source(&err).expect("source should be set");
        assert!(source.to_string().contains("reset by peer"));
    }
}
