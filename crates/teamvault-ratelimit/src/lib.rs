#![forbid(unsafe_code)]

//! Per-client-IP token bucket rate limiting.
//!
//! Follows `toka-rate-limiter`'s token-bucket algorithm, simplified to the
//! single IP-keyed bucket the request pipeline needs and backed by a
//! sharded concurrent map (`dashmap`) instead of one coarse mutex so
//! bucket updates under load don't serialize on a single lock.
//!
//! The IP used as the bucket key must come from the transport peer
//! address; forwarded headers (`X-Forwarded-For` and similar) are never
//! trusted for this decision, since they are attacker-controlled.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::Duration as StdDuration;

/// How long a bucket may sit idle before the sweep evicts it.
pub const BUCKET_IDLE_TTL: chrono::Duration = chrono::Duration::minutes(10);
/// How often the eviction sweep runs.
pub const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(5 * 60);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The request may proceed.
    Allowed,
    /// The request was rejected; retry after the given number of seconds.
    Rejected {
        /// Always `1` (`Retry-After: 1`).
        retry_after_secs: u64,
    },
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Bucket {
    fn new(burst: u64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, refill_rate_per_sec: f64, burst: u64, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * refill_rate_per_sec).min(burst as f64);
        self.last_refill = now;
        self.last_seen = now;
    }

    fn try_consume(&mut self, refill_rate_per_sec: f64, burst: u64, now: DateTime<Utc>) -> bool {
        self.refill(refill_rate_per_sec, burst, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A sharded, per-client-IP token bucket limiter.
///
/// Cloning is cheap: the underlying map is reference-counted internally by
/// `dashmap`'s shard locks, so a single instance can be shared across every
/// request-handling task.
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    refill_rate_per_sec: f64,
    burst: u64,
}

impl RateLimiter {
    /// Builds a limiter refilling at `refill_rate_per_sec` tokens/sec with a
    /// burst capacity of `burst` tokens.
    pub fn new(refill_rate_per_sec: f64, burst: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            refill_rate_per_sec,
            burst,
        }
    }

    /// Checks and consumes one token for `ip`, creating its bucket at full
    /// burst capacity on first sight.
    pub fn check(&self, ip: IpAddr) -> RateLimitDecision {
        let now = Utc::now();
        let mut entry = self
            .buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.burst, now));

        if entry.try_consume(self.refill_rate_per_sec, self.burst, now) {
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Rejected { retry_after_secs: 1 }
        }
    }

    /// Evicts every bucket not seen in the last [`BUCKET_IDLE_TTL`].
    /// Returns the number of buckets evicted. Intended to be run from a
    /// background task every [`SWEEP_INTERVAL`].
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<IpAddr> = self
            .buckets
            .iter()
            .filter(|entry| now - entry.last_seen > BUCKET_IDLE_TTL)
            .map(|entry| *entry.key())
            .collect();
        for ip in &stale {
            self.buckets.remove(ip);
        }
        stale.len()
    }

    /// Number of buckets currently tracked, for diagnostics/tests.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Runs the eviction sweep on [`SWEEP_INTERVAL`] until `shutdown` fires.
    pub async fn run_sweep_loop(self: std::sync::Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("rate limiter sweep loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        tracing::debug!(evicted, "evicted idle rate-limit buckets");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn burst_plus_one_is_rejected() {
        let limiter = RateLimiter::new(1.0, 3);
        for _ in 0..3 {
            assert_eq!(limiter.check(ip()), RateLimitDecision::Allowed);
        }
        match limiter.check(ip()) {
            RateLimitDecision::Rejected { retry_after_secs } => assert_eq!(retry_after_secs, 1),
            RateLimitDecision::Allowed => panic!("expected the 4th request in one tick to be rejected"),
        }
    }

    #[test]
    fn distinct_ips_get_independent_buckets() {
        let limiter = RateLimiter::new(1.0, 1);
        assert_eq!(limiter.check(ip()), RateLimitDecision::Allowed);
        assert_eq!(
            limiter.check(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
            RateLimitDecision::Allowed
        );
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn sweep_evicts_only_stale_buckets() {
        let limiter = RateLimiter::new(1.0, 5);
        limiter.check(ip());
        assert_eq!(limiter.bucket_count(), 1);

        limiter.buckets.get_mut(&ip()).unwrap().last_seen = Utc::now() - chrono::Duration::minutes(11);
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.bucket_count(), 0);
    }
}
