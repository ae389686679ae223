//! Hierarchical token-bucket rate limiting.
//!
//! Each limiter has a configured rate in bytes/sec and a burst capacity of
//! five seconds' worth of tokens. Limiters chain: a per-transfer limiter
//! with rate 0 (locally unlimited) still gets clamped by its parent, which
//! is how one global cap governs every transfer of an agent.
//!
//! Callers must never write more bytes than the last `add` returned, and
//! must back off briefly when it returns zero.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Burst window in seconds: capacity = rate * BURST_SECS.
const BURST_SECS: u64 = 5;

/// Drip timestamps are rounded to this resolution. Throughput shaping does
/// not need sub-tenth-of-a-second precision.
const DRIP_RESOLUTION: f64 = 0.1;

fn monotonic_now() -> f64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    let secs = anchor.elapsed().as_secs_f64();
    (secs / DRIP_RESOLUTION).round() * DRIP_RESOLUTION
}

struct Bucket {
    rate: u64,
    capacity: u64,
    content: u64,
    last_drip: f64,
}

impl Bucket {
    fn drip(&mut self, now: f64) {
        if now > self.last_drip {
            let delta = now - self.last_drip;
            let drained = (delta * self.rate as f64) as u64;
            self.content = self.content.saturating_sub(drained);
            self.last_drip = now;
        }
    }
}

/// A shareable token-bucket rate limiter.
///
/// Cloning yields another handle to the same bucket; all `add` calls on a
/// bucket serialize on its internal lock, which is the cross-transfer
/// coordination the bucket needs.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    parent: Option<Arc<RateLimiter>>,
}

impl RateLimiter {
    /// Creates a root limiter. `rate` is bytes/sec; 0 disables throttling.
    pub fn new(rate: u64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate,
                capacity: rate * BURST_SECS,
                content: 0,
                last_drip: 0.0,
            })),
            parent: None,
        }
    }

    /// Creates a limiter capped by `parent` in addition to its own rate.
    /// With `rate` 0 the local bucket passes everything through and the
    /// parent alone decides.
    pub fn with_parent(rate: u64, parent: RateLimiter) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate,
                capacity: rate * BURST_SECS,
                content: 0,
                last_drip: 0.0,
            })),
            parent: Some(Arc::new(parent)),
        }
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().unwrap().rate
    }

    /// Reconfigures the rate (and the derived burst capacity) in place, so
    /// every holder of this handle sees the new cap on its next `add`.
    /// Content already in the bucket above the new capacity is clamped;
    /// callers get nothing until it drains.
    pub fn set_rate(&self, rate: u64) {
        let mut b = self.bucket.lock().unwrap();
        b.rate = rate;
        b.capacity = rate * BURST_SECS;
        if b.capacity > 0 {
            b.content = b.content.min(b.capacity);
        }
    }

    /// Offers `amount` bytes to the bucket and returns how many the caller
    /// may actually move right now. Zero means back off and retry.
    pub fn add(&self, amount: u64) -> u64 {
        self.add_at(amount, monotonic_now())
    }

    /// Drains elapsed time out of the bucket without adding anything.
    pub fn drip(&self) {
        self.drip_at(monotonic_now());
    }

    fn drip_at(&self, now: f64) {
        if let Some(parent) = &self.parent {
            parent.drip_at(now);
        }
        self.bucket.lock().unwrap().drip(now);
    }

    fn add_at(&self, amount: u64, now: f64) -> u64 {
        // Compute the local allowance first, then let the parent clamp it
        // further; only the finally-allowed amount lands in this bucket.
        let allowable = {
            let mut b = self.bucket.lock().unwrap();
            b.drip(now);
            if b.capacity > 0 && b.content + amount > b.capacity {
                b.capacity.saturating_sub(b.content)
            } else {
                amount
            }
        };

        let allowable = match &self.parent {
            Some(parent) => parent.add_at(allowable, now),
            None => allowable,
        };

        self.bucket.lock().unwrap().content += allowable;
        allowable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_limiter_passes_everything() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.add(1_000_000), 1_000_000);
        assert_eq!(limiter.add(1_000_000), 1_000_000);
    }

    #[test]
    fn capacity_is_five_second_burst() {
        let limiter = RateLimiter::new(100);
        // Empty bucket accepts a full burst at once, no more.
        assert_eq!(limiter.add_at(10_000, 0.0), 500);
        assert_eq!(limiter.add_at(10_000, 0.0), 0);
    }

    #[test]
    fn drip_drains_elapsed_time() {
        let limiter = RateLimiter::new(100);
        assert_eq!(limiter.add_at(500, 0.0), 500);
        // After 2 seconds, 200 bytes worth of tokens have drained.
        limiter.drip_at(2.0);
        assert_eq!(limiter.bucket.lock().unwrap().content, 300);
        assert_eq!(limiter.add_at(500, 2.0), 200);
    }

    #[test]
    fn drip_floors_at_zero() {
        let limiter = RateLimiter::new(100);
        limiter.add_at(50, 0.0);
        limiter.drip_at(100.0);
        assert_eq!(limiter.bucket.lock().unwrap().content, 0);
    }

    #[test]
    fn add_never_exceeds_remaining_capacity() {
        let limiter = RateLimiter::new(100);
        assert_eq!(limiter.add_at(400, 0.0), 400);
        // 100 of 500 capacity left.
        assert_eq!(limiter.add_at(400, 0.0), 100);
    }

    #[test]
    fn parent_clamps_loose_child() {
        let parent = RateLimiter::new(10);
        let child = RateLimiter::with_parent(1000, parent.clone());

        // Over a simulated second, repeated adds through the child can never
        // exceed what the parent's bucket has room for.
        let mut granted = 0;
        for _ in 0..100 {
            granted += child.add_at(1000, 0.0);
        }
        assert_eq!(granted, 50); // parent capacity 10 * 5

        // One second later the parent has drained 10 bytes of tokens.
        assert_eq!(child.add_at(1000, 1.0), 10);
    }

    #[test]
    fn unlimited_child_defers_entirely_to_parent() {
        let parent = RateLimiter::new(100);
        let child = RateLimiter::with_parent(0, parent.clone());
        assert_eq!(child.add_at(10_000, 0.0), 500);
        assert_eq!(child.add_at(10_000, 0.0), 0);
    }

    #[test]
    fn set_rate_takes_effect_on_next_add() {
        let limiter = RateLimiter::new(100);
        assert_eq!(limiter.add_at(10_000, 0.0), 500);
        limiter.set_rate(200);
        // New capacity 1000, 500 already in the bucket.
        assert_eq!(limiter.add_at(10_000, 0.0), 500);
    }

    #[test]
    fn shrinking_rate_clamps_existing_content() {
        let limiter = RateLimiter::new(100);
        assert_eq!(limiter.add_at(500, 0.0), 500);

        // The bucket now holds more than the new capacity (50) allows.
        limiter.set_rate(10);
        assert_eq!(limiter.add_at(10, 0.0), 0);

        // Once enough time drains the clamped content, grants resume at
        // the new rate.
        assert_eq!(limiter.add_at(100, 5.0), 50);
    }

    #[test]
    fn clone_shares_the_bucket() {
        let a = RateLimiter::new(100);
        let b = a.clone();
        assert_eq!(a.add_at(500, 0.0), 500);
        assert_eq!(b.add_at(500, 0.0), 0);
    }
}
