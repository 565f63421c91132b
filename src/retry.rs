//! Retry decisions for the pool's attempt loop.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt outcome and the
//! counters the loop keeps; the loop in [`crate::pool`] only carries out what
//! it returns.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::config::ConnectionPoolConfig;

/// Wait applied to a 429 that carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// What happened on one attempt, reduced to what the policy cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx (or any status below 400).
    Success,
    /// 429 Too Many Requests.
    TooManyRequests {
        /// Seconds from the `Retry-After` header, if present and numeric.
        retry_after: Option<u64>,
    },
    /// 5xx.
    ServerError(u16),
    /// 4xx other than 429.
    ClientError(u16),
    /// Connect failure, timeout, or a broken exchange.
    Transport,
}

impl Outcome {
    /// Classifies a response status.
    pub fn from_status(status: u16, retry_after: Option<u64>) -> Self {
        match status {
            429 => Outcome::TooManyRequests { retry_after },
            500.. => Outcome::ServerError(status),
            400.. => Outcome::ClientError(status),
            _ => Outcome::Success,
        }
    }
}

/// What the attempt loop should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Hand the response to the caller.
    Return,
    /// Sleep, then make the next attempt; consumes one retry.
    Retry(Duration),
    /// Sleep, then repeat the same attempt; consumes no retry.
    Wait(Duration),
    /// Stop and surface the failure.
    Fail,
}

/// Exponential backoff with a ceiling, plus the 429 wait rules.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_factor: f64,
    max_backoff: Duration,
    max_rate_limit_waits: u32,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(
        max_retries: u32,
        backoff_factor: f64,
        max_backoff: Duration,
        max_rate_limit_waits: u32,
    ) -> Self {
        Self {
            max_retries,
            backoff_factor,
            max_backoff,
            max_rate_limit_waits,
        }
    }

    /// Creates a policy from the pool configuration.
    pub fn from_config(config: &ConnectionPoolConfig) -> Self {
        Self::new(
            config.max_retries,
            config.backoff_factor,
            config.max_backoff,
            config.max_rate_limit_waits,
        )
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `attempt + 1`: `min(factor^attempt, max)` seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self
            .backoff_factor
            .powi(exp)
            .min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff)
    }

    /// Decides the next step after `outcome` on zero-indexed `attempt`, with
    /// `rate_limit_waits` 429 waits already spent on this request.
    pub fn decide(&self, outcome: Outcome, attempt: u32, rate_limit_waits: u32) -> Action {
        match outcome {
            Outcome::Success => Action::Return,
            Outcome::ClientError(_) => Action::Fail,
            Outcome::TooManyRequests { retry_after } => {
                if rate_limit_waits >= self.max_rate_limit_waits {
                    Action::Fail
                } else {
                    Action::Wait(
                        retry_after
                            .map(Duration::from_secs)
                            .unwrap_or(DEFAULT_RETRY_AFTER),
                    )
                }
            }
            Outcome::ServerError(_) | Outcome::Transport => {
                if attempt < self.max_retries {
                    Action::Retry(self.backoff(attempt))
                } else {
                    Action::Fail
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionPoolConfig::default())
    }
}

/// Reads `Retry-After` as whole seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.trim().parse::<u64>().ok())
}
