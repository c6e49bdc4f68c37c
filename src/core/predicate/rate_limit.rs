//! Token-bucket admission control.
//!
//! The bucket holds up to `depth` tokens and regains one token every
//! `1 / target_rate` seconds. Each admitted element consumes one token; a
//! batch is admitted only if the bucket holds enough tokens for all of it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::{EnqueuePredicate, QueueState};
use crate::core::error::LifecycleError;

/// Target rate that turns limiting off.
pub const UNLIMITED_RATE: f64 = -1.0;

/// Elapsed intervals shorter than this do not regenerate tokens.
pub const DEFAULT_MIN_REGENERATION: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct RateLimitingPredicate {
    bucket: Mutex<Bucket>,
    min_regeneration: Duration,
}

#[derive(Debug)]
struct Bucket {
    /// Tokens per second; `None` disables limiting.
    target_rate: Option<f64>,
    /// Milliseconds needed to regenerate one token (never below 1,
    /// infinite for a zero rate).
    regen_time_ms: f64,
    depth: usize,
    tokens: f64,
    last_time: Instant,
}

fn regen_time_ms(target_rate: Option<f64>) -> f64 {
    match target_rate {
        Some(rate) => (1.0e3 / rate).max(1.0),
        None => 1.0,
    }
}

fn normalize_rate(target_rate: f64) -> Result<Option<f64>, LifecycleError> {
    if target_rate == UNLIMITED_RATE {
        return Ok(None);
    }
    if target_rate.is_finite() && target_rate >= 0.0 {
        return Ok(Some(target_rate));
    }
    Err(LifecycleError::InvalidConfig(format!(
        "target rate {target_rate} must be non-negative or {UNLIMITED_RATE}"
    )))
}

impl RateLimitingPredicate {
    /// Creates a bucket admitting `target_rate` elements per second with a
    /// burst capacity of `depth`. A rate of `0` never regenerates, so only
    /// the initial `depth` elements get in; [`UNLIMITED_RATE`] disables
    /// limiting.
    pub fn new(target_rate: f64, depth: usize) -> Result<Self, LifecycleError> {
        let target_rate = normalize_rate(target_rate)?;
        Ok(Self::build(target_rate, depth))
    }

    fn build(target_rate: Option<f64>, depth: usize) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                target_rate,
                regen_time_ms: regen_time_ms(target_rate),
                depth,
                tokens: depth as f64,
                last_time: Instant::now(),
            }),
            min_regeneration: DEFAULT_MIN_REGENERATION,
        }
    }

    /// A predicate that accepts everything but still reports its depth.
    pub fn unlimited(depth: usize) -> Self {
        Self::build(None, depth)
    }

    pub fn with_min_regeneration(mut self, period: Duration) -> Self {
        self.min_regeneration = period;
        self
    }

    pub fn target_rate(&self) -> Option<f64> {
        self.bucket.lock().target_rate
    }

    pub fn depth(&self) -> usize {
        self.bucket.lock().depth
    }

    /// Whole tokens currently available (without regenerating).
    pub fn bucket_size(&self) -> usize {
        self.bucket.lock().tokens.floor() as usize
    }

    pub fn set_target_rate(&self, target_rate: f64) -> Result<(), LifecycleError> {
        let target_rate = normalize_rate(target_rate)?;
        let mut bucket = self.bucket.lock();
        bucket.target_rate = target_rate;
        bucket.regen_time_ms = regen_time_ms(target_rate);
        Ok(())
    }

    pub fn set_depth(&self, depth: usize) {
        let mut bucket = self.bucket.lock();
        bucket.depth = depth;
        bucket.tokens = bucket.tokens.min(depth as f64);
    }

    pub(crate) fn accept_at(&self, count: usize, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        if bucket.target_rate.is_none() {
            return true;
        }

        let elapsed = now.saturating_duration_since(bucket.last_time);
        if !elapsed.is_zero() && elapsed >= self.min_regeneration {
            let regenerated = elapsed.as_secs_f64() * 1.0e3 / bucket.regen_time_ms;
            bucket.tokens = (bucket.tokens + regenerated).min(bucket.depth as f64);
            bucket.last_time = now;
        }

        let needed = count as f64;
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            trace!(
                tokens = bucket.tokens,
                requested = count,
                "rate limit rejected enqueue"
            );
            false
        }
    }
}

impl EnqueuePredicate for RateLimitingPredicate {
    fn accept(&self, count: usize, _state: &QueueState) -> bool {
        self.accept_at(count, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_admits_exactly_depth_back_to_back() {
        let p = RateLimitingPredicate::new(10.0, 4).unwrap();
        let now = p.bucket.lock().last_time;
        for _ in 0..4 {
            assert!(p.accept_at(1, now));
        }
        assert!(!p.accept_at(1, now));
    }

    #[test]
    fn tokens_regenerate_up_to_depth() {
        // 100 tokens/s => one token every 10ms
        let p = RateLimitingPredicate::new(100.0, 3).unwrap();
        let start = p.bucket.lock().last_time;
        for _ in 0..3 {
            assert!(p.accept_at(1, start));
        }
        assert!(!p.accept_at(1, start));

        // 25ms regenerates 2.5 tokens
        let later = start + Duration::from_millis(25);
        assert!(p.accept_at(2, later));
        assert!(!p.accept_at(1, later));

        // a long pause never overfills the bucket
        let much_later = later + Duration::from_secs(60);
        assert!(p.accept_at(3, much_later));
        assert!(!p.accept_at(1, much_later));
    }

    #[test]
    fn batch_needs_enough_tokens_for_every_element() {
        let p = RateLimitingPredicate::new(1.0, 5).unwrap();
        let now = p.bucket.lock().last_time;
        assert!(!p.accept_at(6, now));
        assert!(p.accept_at(5, now));
        assert_eq!(p.bucket_size(), 0);
    }

    #[test]
    fn below_min_regeneration_no_tokens_are_added() {
        let p = RateLimitingPredicate::new(1000.0, 2)
            .unwrap()
            .with_min_regeneration(Duration::from_millis(50));
        let start = p.bucket.lock().last_time;
        assert!(p.accept_at(2, start));
        assert!(!p.accept_at(1, start + Duration::from_millis(10)));
        assert!(p.accept_at(1, start + Duration::from_millis(60)));
    }

    #[test]
    fn negative_rate_is_unlimited() {
        let p = RateLimitingPredicate::unlimited(1);
        assert_eq!(p.target_rate(), None);
        let now = Instant::now();
        for _ in 0..1_000 {
            assert!(p.accept_at(10, now));
        }
    }

    #[test]
    fn shrinking_depth_clamps_tokens() {
        let p = RateLimitingPredicate::new(10.0, 10).unwrap();
        p.set_depth(2);
        assert_eq!(p.depth(), 2);
        assert_eq!(p.bucket_size(), 2);
        p.set_target_rate(UNLIMITED_RATE).unwrap();
        assert!(p.target_rate().is_none());
    }

    #[test]
    fn zero_rate_admits_the_initial_bucket_only() {
        let p = RateLimitingPredicate::new(0.0, 2).unwrap();
        assert_eq!(p.target_rate(), Some(0.0));
        let start = p.bucket.lock().last_time;
        let accepted = (0..1_000u64)
            .filter(|i| p.accept_at(1, start + Duration::from_millis(*i * 10)))
            .count();
        assert_eq!(accepted, 2);
    }

    #[test]
    fn only_the_unlimited_sentinel_disables_limiting() {
        assert!(RateLimitingPredicate::new(-1.0, 1).unwrap().target_rate().is_none());
        for rate in [-0.5, -2.0, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(
                    RateLimitingPredicate::new(rate, 1),
                    Err(LifecycleError::InvalidConfig(_))
                ),
                "{rate}"
            );
        }
        let p = RateLimitingPredicate::new(5.0, 1).unwrap();
        assert!(p.set_target_rate(f64::NAN).is_err());
        assert_eq!(p.target_rate(), Some(5.0));
    }
}
