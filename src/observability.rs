use biometrics::{Collector, Counter, Moments};

pub(crate) static POOL_REQUESTS: Counter = Counter::new("ask.pool.requests");
pub(crate) static POOL_ATTEMPTS: Counter = Counter::new("ask.pool.attempts");
pub(crate) static POOL_RETRIES: Counter = Counter::new("ask.pool.retries");
pub(crate) static POOL_FAILURES: Counter = Counter::new("ask.pool.failures");
pub(crate) static POOL_THROTTLED: Counter = Counter::new("ask.pool.throttled");
pub(crate) static POOL_RATE_LIMIT_WAITS: Counter = Counter::new("ask.pool.rate_limit_waits");
pub(crate) static POOL_CANCELLED: Counter = Counter::new("ask.pool.cancelled");
pub(crate) static POOL_RESPONSE_TIME: Moments = Moments::new("ask.pool.response_seconds");
pub(crate) static POOL_BACKOFF: Moments = Moments::new("ask.pool.backoff_seconds");

pub(crate) static STREAM_CHUNKS: Counter = Counter::new("ask.stream.chunks");
pub(crate) static STREAM_BYTES: Counter = Counter::new("ask.stream.bytes");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("ask.stream.errors");
pub(crate) static STREAM_DURATION: Moments = Moments::new("ask.stream.duration_seconds");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&POOL_REQUESTS);
    collector.register_counter(&POOL_ATTEMPTS);
    collector.register_counter(&POOL_RETRIES);
    collector.register_counter(&POOL_FAILURES);
    collector.register_counter(&POOL_THROTTLED);
    collector.register_counter(&POOL_RATE_LIMIT_WAITS);
    collector.register_counter(&POOL_CANCELLED);
    collector.register_moments(&POOL_RESPONSE_TIME);
    collector.register_moments(&POOL_BACKOFF);

    collector.register_counter(&STREAM_CHUNKS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_moments(&STREAM_DURATION);
}
