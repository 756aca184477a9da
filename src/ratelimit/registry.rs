//! Keyed registry of token buckets.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::bucket::{RateSpec, Reservation, TokenBucket};
use super::clock::{Clock, MonotonicClock};

/// Owns one [`TokenBucket`] per key, created on first use.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Buckets are never removed unless [`evict_idle`](Self::evict_idle) is
/// called, so the map grows with the number of distinct keys seen.
#[derive(Debug)]
pub struct KeyedLimiterRegistry {
    /// Buckets indexed by client key
    buckets: DashMap<String, Arc<TokenBucket>>,
    /// Spec shared by every bucket
    spec: RateSpec,
    clock: Arc<dyn Clock>,
}

impl KeyedLimiterRegistry {
    /// Create a registry that reads the system monotonic clock.
    pub fn new(spec: RateSpec) -> Self {
        Self::with_clock(spec, Arc::new(MonotonicClock::default()))
    }

    /// Create a registry with an explicit time source.
    pub fn with_clock(spec: RateSpec, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            spec,
            clock,
        }
    }

    /// Get the bucket for `key`, creating it if this is the first sighting.
    ///
    /// Concurrent callers racing on an unseen key all receive the same
    /// bucket: creation happens under the map shard's write lock.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.value().clone();
        }

        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(
                    key = %key,
                    rate = self.spec.rate,
                    burst = self.spec.burst,
                    "Creating new token bucket"
                );
                Arc::new(TokenBucket::new(self.spec, self.clock.clone()))
            })
            .value()
            .clone()
    }

    /// Admit or reject one request for `key`.
    pub fn decide(&self, key: &str) -> bool {
        let admitted = loop {
            // A retired bucket has already left the map, so the next
            // lookup yields its replacement.
            if let Some(admitted) = self.get_or_create(key).try_allow() {
                break admitted;
            }
        };
        trace!(key = %key, admitted, "Admission decision");
        admitted
    }

    /// Reserve a token for `key` and report how long until it is usable.
    pub fn reserve_wait(&self, key: &str) -> Reservation {
        loop {
            if let Some(reservation) = self.get_or_create(key).try_reserve() {
                return reservation;
            }
        }
    }

    /// How long `key` would have to wait for a token, without taking one.
    pub fn retry_after(&self, key: &str) -> Option<Duration> {
        self.get_or_create(key).wait_time()
    }

    /// Get the rate and burst applied to every bucket.
    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Remove buckets that no decision has touched for at least `ttl` and
    /// that have refilled completely.
    ///
    /// A drained bucket or one with an outstanding reservation stays until
    /// it is full again, so eviction never hands a key tokens early.
    /// Removed buckets are retired under their own lock; a caller still
    /// holding one gets nothing from it and retries against the map.
    /// Returns how many were removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut evicted = 0;
        self.buckets.retain(|_, bucket| {
            let retired = bucket.retire_if_idle(ttl);
            evicted += usize::from(retired);
            !retired
        });
        if evicted > 0 {
            info!(evicted, remaining = self.buckets.len(), "Evicted idle buckets");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` on the tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the registry is
    /// dropped.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, ttl: Duration, every: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        info!(
            ttl_secs = ttl.as_secs_f64(),
            interval_secs = every.as_secs_f64(),
            "Starting idle bucket sweeper"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.evict_idle(ttl);
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn registry(rate: f64, burst: u32) -> (KeyedLimiterRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let registry = KeyedLimiterRegistry::with_clock(RateSpec { rate, burst }, clock.clone());
        (registry, clock)
    }

    #[test]
    fn test_registry_creation() {
        let (registry, _) = registry(10.0, 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_or_create_reuses_bucket() {
        let (registry, _) = registry(10.0, 3);

        let first = registry.get_or_create("client");
        let second = registry.get_or_create("client");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_decide_burst_then_reject() {
        let (registry, _) = registry(10.0, 3);

        assert!(registry.decide("K"));
        assert!(registry.decide("K"));
        assert!(registry.decide("K"));
        assert!(!registry.decide("K"));
    }

    #[test]
    fn test_keys_are_independent() {
        let (registry, _) = registry(10.0, 1);

        assert!(registry.decide("K1"));
        assert!(registry.decide("K2"));
        assert!(!registry.decide("K1"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reserve_wait_reports_interval() {
        let (registry, _) = registry(10.0, 1);

        let first = registry.reserve_wait("K");
        assert!(first.ok);
        assert_eq!(first.wait, Duration::ZERO);

        let second = registry.reserve_wait("K");
        assert!(second.ok);
        assert!((second.wait.as_secs_f64() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_reserve_wait_with_zero_burst() {
        let (registry, _) = registry(10.0, 0);
        assert!(!registry.reserve_wait("K").ok);
    }

    #[test]
    fn test_retry_after_is_advisory() {
        let (registry, _) = registry(2.0, 1);
        assert_eq!(registry.retry_after("K"), Some(Duration::ZERO));
        assert!(registry.decide("K"));

        let wait = registry.retry_after("K").unwrap();
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-6);
        // Asking again does not push the wait further out.
        assert_eq!(registry.retry_after("K"), Some(wait));
    }

    #[test]
    fn test_evict_idle_removes_only_stale_keys() {
        let (registry, clock) = registry(10.0, 1);

        registry.decide("old");
        clock.advance(Duration::from_secs(30));
        registry.decide("fresh");
        clock.advance(Duration::from_secs(30));

        assert_eq!(registry.evict_idle(Duration::from_secs(45)), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.buckets.contains_key("fresh"));
    }

    #[test]
    fn test_evict_idle_keeps_drained_key() {
        let (registry, clock) = registry(0.001, 1);

        assert!(registry.decide("K"));
        assert!(!registry.decide("K"));

        // Idle for twice the ttl but still 990 s short of a token.
        clock.advance(Duration::from_secs(10));
        assert_eq!(registry.evict_idle(Duration::from_secs(5)), 0);
        assert_eq!(registry.len(), 1);
        assert!(!registry.decide("K"));
    }

    #[test]
    fn test_evict_idle_keeps_key_with_outstanding_reservation() {
        let (registry, clock) = registry(1.0, 1);

        assert!(registry.decide("K"));
        assert!(registry.reserve_wait("K").ok);
        assert!(registry.reserve_wait("K").ok);

        // Reservations run until t=2s.
        clock.advance(Duration::from_millis(1500));
        assert_eq!(registry.evict_idle(Duration::from_secs(1)), 0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(registry.evict_idle(Duration::from_secs(1)), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_handle_cannot_double_burst() {
        let (registry, clock) = registry(10.0, 1);
        let stale = registry.get_or_create("K");

        clock.advance(Duration::from_secs(60));
        assert_eq!(registry.evict_idle(Duration::from_secs(30)), 1);

        // The evicted bucket refuses; the key's one token lives in the
        // replacement bucket only.
        assert!(!stale.allow());
        assert!(registry.decide("K"));
        assert!(!registry.decide("K"));
        assert!(!Arc::ptr_eq(&stale, &registry.get_or_create("K")));
    }

    #[test]
    fn test_tiny_rate_does_not_panic() {
        let registry = KeyedLimiterRegistry::with_clock(
            RateSpec::new(1e-20, 1).unwrap(),
            Arc::new(ManualClock::new()),
        );

        assert!(registry.decide("K"));
        assert!(!registry.decide("K"));
        assert_eq!(registry.retry_after("K"), Some(Duration::MAX));
        assert_eq!(registry.reserve_wait("K").wait, Duration::MAX);
        assert_eq!(registry.retry_after("K"), Some(Duration::MAX));
    }

    #[test]
    fn test_clear_buckets() {
        let (registry, _) = registry(10.0, 1);
        registry.decide("a");
        registry.decide("b");
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweeper_evicts_full_idle_bucket() {
        let (registry, clock) = registry(10.0, 2);
        let registry = Arc::new(registry);
        registry.decide("idle");
        registry.decide("refilled");
        registry.decide("refilled");
        clock.advance(Duration::from_secs(120));
        registry.decide("busy");

        let handle = registry.spawn_idle_sweeper(Duration::from_secs(60), Duration::from_secs(30));

        // The first tick is skipped; nothing is swept before `every` elapses.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registry.len(), 3);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(registry.len(), 1);
        assert!(registry.buckets.contains_key("busy"));

        handle.abort();
    }

    #[tokio::test]
    async fn test_idle_sweeper_stops_when_registry_dropped() {
        let registry = Arc::new(KeyedLimiterRegistry::new(RateSpec { rate: 10.0, burst: 1 }));
        let handle = registry.spawn_idle_sweeper(Duration::from_secs(60), Duration::from_millis(5));

        drop(registry);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .expect("sweeper panicked");
    }
}
