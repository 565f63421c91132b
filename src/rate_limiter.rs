//! Client-side request rate limiting over sliding windows.
//!
//! The limiter keeps one log of send timestamps and evaluates it against three
//! trailing windows (minute, hour, day).  Short bursts are governed by the
//! minute ceiling while the hour and day ceilings enforce longer quotas.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ConnectionPoolConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Wait suggested when the hour or day ceiling is the one that binds.
const DEFAULT_WAIT: Duration = Duration::from_secs(60);
/// Slack added to the minute-window wait so the retry lands past the boundary.
const MINUTE_WAIT_SLACK: Duration = Duration::from_secs(1);

/// Sliding-window rate limiter.
///
/// Timestamps come from [`tokio::time::Instant`], so a paused tokio clock
/// drives the windows in tests.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    per_minute: usize,
    per_hour: usize,
    per_day: usize,
    // Sorted ascending, nothing older than DAY after a purge.
    sent: VecDeque<Instant>,
}

impl RateLimiter {
    /// Creates a limiter with the given ceilings.
    pub fn new(per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        Self {
            per_minute: per_minute as usize,
            per_hour: per_hour as usize,
            per_day: per_day as usize,
            sent: VecDeque::new(),
        }
    }

    /// Creates a limiter from the pool configuration's ceilings.
    pub fn from_config(config: &ConnectionPoolConfig) -> Self {
        Self::new(
            config.max_requests_per_minute,
            config.max_requests_per_hour,
            config.max_requests_per_day,
        )
    }

    /// Returns true if a request may be sent now.
    pub fn can_send(&mut self) -> bool {
        self.can_send_at(Instant::now())
    }

    /// Records a request sent now.
    pub fn record_sent(&mut self) {
        self.record_sent_at(Instant::now());
    }

    /// Returns how long to wait before a request may be sent.
    pub fn wait_duration(&mut self) -> Duration {
        self.wait_duration_at(Instant::now())
    }

    /// Number of requests currently remembered (all within the last day).
    pub fn len(&self) -> usize {
        self.sent.len()
    }

    /// Returns true if no requests are remembered.
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    pub(crate) fn can_send_at(&mut self, now: Instant) -> bool {
        self.purge(now);
        self.count_within(now, MINUTE) < self.per_minute
            && self.count_within(now, HOUR) < self.per_hour
            && self.count_within(now, DAY) < self.per_day
    }

    pub(crate) fn record_sent_at(&mut self, now: Instant) {
        let idx = self.sent.partition_point(|t| *t <= now);
        self.sent.insert(idx, now);
    }

    pub(crate) fn wait_duration_at(&mut self, now: Instant) -> Duration {
        if self.can_send_at(now) {
            return Duration::ZERO;
        }
        if self.count_within(now, MINUTE) >= self.per_minute {
            if let Some(oldest) = self.oldest_within(now, MINUTE) {
                // The +1s applies to the minute window only; hour and day
                // fall back to DEFAULT_WAIT.
                let age = now.saturating_duration_since(oldest);
                return MINUTE.saturating_sub(age) + MINUTE_WAIT_SLACK;
            }
        }
        DEFAULT_WAIT
    }

    fn purge(&mut self, now: Instant) {
        while let Some(front) = self.sent.front() {
            if now.saturating_duration_since(*front) >= DAY {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, window: Duration) -> usize {
        let start = self.first_within(now, window);
        self.sent.len() - start
    }

    fn oldest_within(&self, now: Instant, window: Duration) -> Option<Instant> {
        self.sent.get(self.first_within(now, window)).copied()
    }

    fn first_within(&self, now: Instant, window: Duration) -> usize {
        self.sent
            .partition_point(|t| now.saturating_duration_since(*t) >= window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn fresh_limiter_allows_sending() {
        let mut limiter = RateLimiter::new(2, 10, 100);
        let now = Instant::now();
        assert!(limiter.can_send_at(now));
        assert_eq!(limiter.wait_duration_at(now), Duration::ZERO);
    }

    #[test]
    fn minute_ceiling_blocks_until_oldest_ages_out() {
        let mut limiter = RateLimiter::new(3, 100, 1000);
        let start = Instant::now();
        limiter.record_sent_at(start);
        limiter.record_sent_at(start + secs(10));
        assert!(limiter.can_send_at(start + secs(10)));
        limiter.record_sent_at(start + secs(20));
        assert!(!limiter.can_send_at(start + secs(20)));
        assert!(!limiter.can_send_at(start + secs(59)));
        assert!(limiter.can_send_at(start + secs(60)));
    }

    #[test]
    fn minute_wait_includes_one_second_slack() {
        let mut limiter = RateLimiter::new(2, 100, 1000);
        let start = Instant::now();
        limiter.record_sent_at(start);
        limiter.record_sent_at(start + secs(5));
        let wait = limiter.wait_duration_at(start + secs(15));
        assert_eq!(wait, secs(46));
    }

    #[test]
    fn hour_ceiling_uses_default_wait() {
        let mut limiter = RateLimiter::new(10, 2, 1000);
        let start = Instant::now();
        limiter.record_sent_at(start);
        limiter.record_sent_at(start + secs(120));
        let now = start + secs(600);
        assert!(!limiter.can_send_at(now));
        assert_eq!(limiter.wait_duration_at(now), secs(60));
        assert!(!limiter.can_send_at(start + secs(3599)));
        assert!(limiter.can_send_at(start + secs(3600)));
    }

    #[test]
    fn day_ceiling_and_purge() {
        let mut limiter = RateLimiter::new(10, 10, 2);
        let start = Instant::now();
        limiter.record_sent_at(start);
        limiter.record_sent_at(start + secs(7200));
        assert!(!limiter.can_send_at(start + secs(80_000)));
        assert_eq!(limiter.wait_duration_at(start + secs(80_000)), secs(60));
        assert!(limiter.can_send_at(start + secs(86_400)));
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn timestamps_stay_sorted() {
        let mut limiter = RateLimiter::new(10, 10, 10);
        let start = Instant::now();
        limiter.record_sent_at(start + secs(30));
        limiter.record_sent_at(start);
        limiter.record_sent_at(start + secs(10));
        let sent: Vec<_> = limiter.sent.iter().copied().collect();
        assert_eq!(sent, vec![start, start + secs(10), start + secs(30)]);
    }

    #[test]
    fn monotone_over_a_sequence_of_sends() {
        let mut limiter = RateLimiter::new(5, 1000, 1000);
        let start = Instant::now();
        for i in 0..5 {
            assert!(limiter.can_send_at(start + secs(i)));
            limiter.record_sent_at(start + secs(i));
        }
        for t in 5..60 {
            assert!(!limiter.can_send_at(start + secs(t)), "t={t}");
        }
        assert!(limiter.can_send_at(start + secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_tokio_clock() {
        let mut limiter = RateLimiter::new(1, 10, 10);
        limiter.record_sent();
        assert!(!limiter.can_send());
        let wait = limiter.wait_duration();
        assert_eq!(wait, secs(61));
        tokio::time::advance(wait).await;
        assert!(limiter.can_send());
    }
}
