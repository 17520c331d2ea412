//! Per-subnet token-bucket rate limiting.
//!
//! Applied to UDP ingress only; connection-oriented transports are
//! already bounded by their accept loops. Clients over the limit are
//! dropped silently so the proxy cannot be used as an amplifier.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use moka::sync::Cache;
use parking_lot::Mutex;

use crate::netutil::mask_addr;

/// Idle buckets are evicted after this long; a re-created bucket starts
/// full, which at worst forgives one burst.
const BUCKET_IDLE: std::time::Duration = std::time::Duration::from_secs(60);

/// Upper bound on tracked subnets.
const MAX_BUCKETS: u64 = 10_000;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by masked client address.
pub struct RateLimiter {
    /// Sustained queries per second, also the burst size.
    rate: u32,
    v4_prefix: u8,
    v6_prefix: u8,
    /// Exact client addresses that bypass the limiter, sorted for
    /// binary search.
    whitelist: Vec<IpAddr>,
    buckets: Cache<IpAddr, Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    pub fn new(rate: u32, v4_prefix: u8, v6_prefix: u8, mut whitelist: Vec<IpAddr>) -> Self {
        whitelist.sort_unstable();
        whitelist.dedup();
        Self {
            rate,
            v4_prefix,
            v6_prefix,
            whitelist,
            buckets: Cache::builder()
                .max_capacity(MAX_BUCKETS)
                .time_to_idle(BUCKET_IDLE)
                .build(),
        }
    }

    /// Account one query from `client`. Returns false when the client's
    /// subnet is over its budget and the query must be dropped.
    pub fn allow(&self, client: IpAddr) -> bool {
        if self.rate == 0 {
            return true;
        }
        if self.whitelist.binary_search(&client).is_ok() {
            return true;
        }

        let key = self.bucket_key(client);
        let bucket = self.buckets.get_with(key, || {
            Arc::new(Mutex::new(Bucket {
                tokens: f64::from(self.rate),
                last_refill: Instant::now(),
            }))
        });

        let mut bucket = bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * f64::from(self.rate)).min(f64::from(self.rate));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn bucket_key(&self, client: IpAddr) -> IpAddr {
        match client {
            IpAddr::V4(_) => mask_addr(client, self.v4_prefix),
            IpAddr::V6(_) => mask_addr(client, self.v6_prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn should_allow_up_to_burst_then_drop() {
        let limiter = RateLimiter::new(5, 24, 56, Vec::new());
        let client = ip("203.0.113.7");

        for _ in 0..5 {
            assert!(limiter.allow(client));
        }
        assert!(!limiter.allow(client));
    }

    #[test]
    fn should_share_buckets_within_a_subnet() {
        let limiter = RateLimiter::new(2, 24, 56, Vec::new());

        assert!(limiter.allow(ip("203.0.113.1")));
        assert!(limiter.allow(ip("203.0.113.200")));
        // Third query from the same /24, different host: over budget.
        assert!(!limiter.allow(ip("203.0.113.77")));
        // A different /24 has its own bucket.
        assert!(limiter.allow(ip("203.0.114.1")));
    }

    #[test]
    fn should_mask_ipv6_clients_to_their_prefix() {
        let limiter = RateLimiter::new(1, 24, 56, Vec::new());

        assert!(limiter.allow(ip("2001:db8:12:3400::1")));
        assert!(!limiter.allow(ip("2001:db8:12:34ff::2")));
        assert!(limiter.allow(ip("2001:db8:12:3500::1")));
    }

    #[test]
    fn should_bypass_whitelisted_clients() {
        let limiter = RateLimiter::new(1, 24, 56, vec![ip("203.0.113.7")]);

        assert!(limiter.allow(ip("203.0.113.1")));
        assert!(!limiter.allow(ip("203.0.113.2")));
        for _ in 0..10 {
            assert!(limiter.allow(ip("203.0.113.7")));
        }
    }

    #[test]
    fn should_disable_limiting_at_rate_zero() {
        let limiter = RateLimiter::new(0, 24, 56, Vec::new());
        for _ in 0..100 {
            assert!(limiter.allow(ip("203.0.113.7")));
        }
    }
}
