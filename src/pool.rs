//! The connection pool: one `request()` entry point that gates on the client
//! rate limiter, acquires a connection slot, sends, and retries per
//! [`RetryPolicy`].
//!
//! The pool is a cheap cloneable handle.  Construct it once at startup, share
//! it between tasks, and call [`ConnectionPool::close`] when done; nothing is
//! global.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConnectionPoolConfig;
use crate::error::{Error, Result};
use crate::observability::{
    POOL_ATTEMPTS, POOL_BACKOFF, POOL_CANCELLED, POOL_FAILURES, POOL_RATE_LIMIT_WAITS,
    POOL_REQUESTS, POOL_RESPONSE_TIME, POOL_RETRIES, POOL_THROTTLED,
};
use crate::rate_limiter::RateLimiter;
use crate::retry::{Action, Outcome, RetryPolicy, parse_retry_after};
use crate::transport::{HttpTransport, Request, Response, Transport, TransportError};

/// Weight the running average keeps on its previous value.
const RESPONSE_TIME_DECAY: f64 = 0.9;

/// Time allowed for reading the body of an error response.
const ERROR_BODY_TIMEOUT: Duration = Duration::from_secs(5);

/// A held connection slot; released when dropped.
pub struct ConnectionLease {
    _host: OwnedSemaphorePermit,
    _total: OwnedSemaphorePermit,
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionLease")
    }
}

/// Counters describing the pool's work so far.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PoolStatistics {
    /// Connection ceiling.
    pub total_connections: usize,
    /// Slots currently held by in-flight requests and unread bodies.
    pub active_connections: usize,
    /// Slots currently free.
    pub idle_connections: usize,
    /// Logical requests accepted (retries and 429 waits not counted again).
    pub total_requests: u64,
    /// Attempts that failed with a transport error or a 5xx.
    pub failed_requests: u64,
    /// Retries performed.
    pub retry_count: u64,
    /// 429 responses waited out.
    pub rate_limit_waits: u64,
    /// Exponential moving average of time to response head.
    #[serde(with = "crate::utils::seconds")]
    pub average_response_time: Duration,
    /// Description of the last request that failed for good.
    pub last_error: Option<String>,
    /// When `last_error` happened.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_error_time: Option<OffsetDateTime>,
}

/// Result of a single attempt, consumed by the loop in `request`.
enum Attempt {
    Success(Response),
    Retry { delay: Duration, cause: Error },
    Wait { delay: Duration },
    Fatal(Error),
}

struct PoolState {
    transport: Option<Arc<dyn Transport>>,
    initialized: bool,
    closed: bool,
}

struct Inner {
    config: ConnectionPoolConfig,
    policy: RetryPolicy,
    state: Mutex<PoolState>,
    limiter: Mutex<RateLimiter>,
    stats: Mutex<PoolStatistics>,
    total_slots: Arc<Semaphore>,
    host_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Rate-limited, retrying HTTP connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    /// Creates a pool that talks HTTP through `reqwest` once initialized.
    pub fn new(config: ConnectionPoolConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates a pool over a caller-supplied transport.
    pub fn with_transport(
        config: ConnectionPoolConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::build(config, Some(transport))
    }

    fn build(config: ConnectionPoolConfig, transport: Option<Arc<dyn Transport>>) -> Result<Self> {
        config.validate()?;
        let stats = PoolStatistics {
            total_connections: config.max_connections,
            ..PoolStatistics::default()
        };
        Ok(Self {
            inner: Arc::new(Inner {
                policy: RetryPolicy::from_config(&config),
                limiter: Mutex::new(RateLimiter::from_config(&config)),
                stats: Mutex::new(stats),
                total_slots: Arc::new(Semaphore::new(config.max_connections)),
                host_slots: Mutex::new(HashMap::new()),
                state: Mutex::new(PoolState {
                    transport,
                    initialized: false,
                    closed: false,
                }),
                config,
            }),
        })
    }

    /// Prepares the underlying transport.  Calling it again is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(closed_error());
        }
        if state.initialized {
            return Ok(());
        }
        if state.transport.is_none() {
            state.transport = Some(Arc::new(HttpTransport::new(&self.inner.config)?));
        }
        state.initialized = true;
        info!(
            max_connections = self.inner.config.max_connections,
            max_connections_per_host = self.inner.config.max_connections_per_host,
            "connection pool initialized"
        );
        Ok(())
    }

    /// Closes the pool.  Waiting requests fail, bodies already handed out can
    /// still be read, and calling it again is a no-op.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return;
        }
        state.closed = true;
        state.transport = None;
        self.inner.total_slots.close();
        for slots in lock(&self.inner.host_slots).values() {
            slots.close();
        }
        info!("connection pool closed");
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Returns true once `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.state).initialized
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.inner.config
    }

    /// A snapshot of the pool's statistics.
    pub fn stats(&self) -> PoolStatistics {
        let mut snapshot = lock(&self.inner.stats).clone();
        let total = self.inner.config.max_connections;
        let active = total.saturating_sub(self.inner.total_slots.available_permits());
        snapshot.total_connections = total;
        snapshot.active_connections = active;
        snapshot.idle_connections = total - active;
        snapshot
    }

    /// Zeroes the counters.
    pub fn reset_stats(&self) {
        *lock(&self.inner.stats) = PoolStatistics {
            total_connections: self.inner.config.max_connections,
            ..PoolStatistics::default()
        };
    }

    /// Sends `request`, waiting out the client rate limit, retrying transport
    /// failures and 5xx with backoff, and waiting out 429 responses.
    ///
    /// Fails with [`Error::Network`] once retries are exhausted (or the pool is
    /// closed), [`Error::RateLimit`] when the server keeps answering 429,
    /// [`Error::Api`] for any other 4xx, and [`Error::Cancelled`] if the
    /// request's token fires first.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn request(&self, request: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.initialize()?;
        let cancel = request.cancel.clone().unwrap_or_default();

        self.wait_for_rate_limit(&cancel).await?;
        POOL_REQUESTS.click();
        lock(&self.inner.stats).total_requests += 1;

        let mut attempt = 0;
        let mut rate_limit_waits = 0;
        loop {
            match self
                .attempt(&request, attempt, rate_limit_waits, &cancel)
                .await
            {
                Attempt::Success(response) => {
                    debug!(status = response.status(), "request succeeded");
                    return Ok(response);
                }
                Attempt::Retry { delay, cause } => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.inner.policy.max_retries() + 1,
                        error = %cause,
                        "request failed; retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    POOL_BACKOFF.add(delay.as_secs_f64());
                    sleep_or_cancel(&cancel, delay).await?;
                    lock(&self.inner.stats).retry_count += 1;
                    POOL_RETRIES.click();
                    attempt += 1;
                }
                Attempt::Wait { delay } => {
                    rate_limit_waits += 1;
                    lock(&self.inner.stats).rate_limit_waits += 1;
                    POOL_RATE_LIMIT_WAITS.click();
                    warn!(
                        wait_secs = delay.as_secs_f64(),
                        "server rate limit hit; waiting before reissuing"
                    );
                    sleep_or_cancel(&cancel, delay).await?;
                }
                Attempt::Fatal(err) => {
                    if err.is_cancelled() {
                        POOL_CANCELLED.click();
                    } else {
                        self.record_error(&err);
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &Request,
        attempt: u32,
        rate_limit_waits: u32,
        cancel: &CancellationToken,
    ) -> Attempt {
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(err) => return Attempt::Fatal(err),
        };
        let lease = match self.acquire(request, cancel).await {
            Ok(lease) => lease,
            Err(err) => return Attempt::Fatal(err),
        };
        POOL_ATTEMPTS.click();

        let timeout = self.inner.config.timeout;
        let started = Instant::now();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Fatal(cancelled_error()),
            sent = tokio::time::timeout(timeout, transport.send(request)) => sent,
        };
        let sent = sent.unwrap_or_else(|_| {
            Err(TransportError::timeout(format!(
                "no response within {:.1}s",
                timeout.as_secs_f64()
            )))
        });

        let mut response = match sent {
            Ok(response) => response,
            Err(err) => {
                self.count_failed_attempt();
                let cause = Error::network(err.to_string(), Some(Box::new(err)));
                return self.retry_or_exhaust(Outcome::Transport, attempt, cause);
            }
        };
        self.record_response_time(started.elapsed());

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let outcome = Outcome::from_status(status, retry_after);
        match self.inner.policy.decide(outcome, attempt, rate_limit_waits) {
            Action::Return => {
                response.attach_lease(lease);
                Attempt::Success(response)
            }
            Action::Wait(delay) => Attempt::Wait { delay },
            Action::Retry(_) | Action::Fail => match outcome {
                Outcome::ServerError(_) => {
                    self.count_failed_attempt();
                    let body = match error_body(response, cancel).await {
                        Ok(body) => body,
                        Err(err) => return Attempt::Fatal(err),
                    };
                    let cause = Error::api(Some(status), format!("server error: {body}"));
                    self.retry_or_exhaust(outcome, attempt, cause)
                }
                Outcome::TooManyRequests { retry_after } => Attempt::Fatal(Error::rate_limit(
                    format!("still rate limited after {rate_limit_waits} waits"),
                    retry_after,
                )),
                _ => match error_body(response, cancel).await {
                    Ok(body) => Attempt::Fatal(Error::api(Some(status), body)),
                    Err(err) => Attempt::Fatal(err),
                },
            },
        }
    }

    fn retry_or_exhaust(&self, outcome: Outcome, attempt: u32, cause: Error) -> Attempt {
        match self.inner.policy.decide(outcome, attempt, 0) {
            Action::Retry(delay) => Attempt::Retry { delay, cause },
            _ => Attempt::Fatal(Error::network(
                format!("request failed after {} attempts: {cause}", attempt + 1),
                Some(Box::new(cause)),
            )),
        }
    }

    async fn wait_for_rate_limit(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut limiter = lock(&self.inner.limiter);
                if limiter.can_send() {
                    limiter.record_sent();
                    return Ok(());
                }
                limiter.wait_duration()
            };
            POOL_THROTTLED.click();
            warn!(
                wait_secs = wait.as_secs_f64(),
                "client rate limit reached; waiting"
            );
            sleep_or_cancel(cancel, wait).await?;
        }
    }

    async fn acquire(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<ConnectionLease> {
        let host_slots = self.host_slots(&request.host_key());
        if host_slots.available_permits() == 0 || self.inner.total_slots.available_permits() == 0 {
            debug!("all connection slots busy; waiting for one to free");
        }
        let host = acquire_slot(host_slots, cancel).await?;
        let total = acquire_slot(Arc::clone(&self.inner.total_slots), cancel).await?;
        Ok(ConnectionLease {
            _host: host,
            _total: total,
        })
    }

    fn host_slots(&self, host: &str) -> Arc<Semaphore> {
        let per_host = self.inner.config.max_connections_per_host;
        let mut slots = lock(&self.inner.host_slots);
        // Held permits and pending acquires keep their semaphore referenced.
        slots.retain(|key, slot| key == host || Arc::strong_count(slot) > 1);
        Arc::clone(
            slots
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(per_host))),
        )
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        lock(&self.inner.state)
            .transport
            .clone()
            .ok_or_else(closed_error)
    }

    fn record_response_time(&self, elapsed: Duration) {
        POOL_RESPONSE_TIME.add(elapsed.as_secs_f64());
        let mut stats = lock(&self.inner.stats);
        stats.average_response_time = if stats.average_response_time.is_zero() {
            elapsed
        } else {
            stats.average_response_time.mul_f64(RESPONSE_TIME_DECAY)
                + elapsed.mul_f64(1.0 - RESPONSE_TIME_DECAY)
        };
    }

    fn count_failed_attempt(&self) {
        lock(&self.inner.stats).failed_requests += 1;
    }

    fn record_error(&self, err: &Error) {
        POOL_FAILURES.click();
        error!(error = %err, "request failed");
        let mut stats = lock(&self.inner.stats);
        stats.last_error = Some(err.to_string());
        stats.last_error_time = Some(OffsetDateTime::now_utc());
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed_error() -> Error {
    Error::network("connection pool is closed", None)
}

fn cancelled_error() -> Error {
    Error::cancelled("request cancelled")
}

async fn acquire_slot(
    slots: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled_error()),
        permit = slots.acquire_owned() => permit.map_err(|_| closed_error()),
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            POOL_CANCELLED.click();
            Err(Error::cancelled("request cancelled while waiting"))
        }
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Reads an error response's body for the error message, falling back to
/// the status line when it is empty, unreadable or too slow.
async fn error_body(response: Response, cancel: &CancellationToken) -> Result<String> {
    let status = response.status();
    let read = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancelled_error()),
        read = tokio::time::timeout(ERROR_BODY_TIMEOUT, response.text()) => read,
    };
    match read {
        Ok(Ok(body)) if !body.trim().is_empty() => Ok(body),
        _ => Ok(format!("HTTP {status}")),
    }
}
