//! Token bucket implementation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use crate::error::{Result, TurnstileError};

/// Slack for float accumulation, so `1/rate` seconds of refill always
/// yields a whole token.
const TOKEN_EPSILON: f64 = 1e-6;

/// Refill rate and capacity shared by every bucket of a registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSpec {
    /// Tokens added per second
    pub rate: f64,
    /// Maximum tokens held
    pub burst: u32,
}

impl RateSpec {
    /// Build a validated spec.
    ///
    /// A `burst` of zero or less is replaced with 1. The rate must be a
    /// finite, positive number.
    pub fn new(rate: f64, burst: i64) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "rate must be a positive number of tokens per second, got {}",
                rate
            )));
        }
        let burst = if burst <= 0 {
            1
        } else {
            u32::try_from(burst).unwrap_or(u32::MAX)
        };
        Ok(Self { rate, burst })
    }

    /// Time for `tokens` to accrue at this rate.
    ///
    /// Saturates at [`Duration::MAX`] when the answer does not fit, which
    /// happens for vanishingly small rates.
    pub fn time_to_accrue(&self, tokens: f64) -> Duration {
        if tokens <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(tokens / self.rate).unwrap_or(Duration::MAX)
    }
}

/// Outcome of [`TokenBucket::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// How long until the reserved token is usable. Zero means now.
    pub wait: Duration,
    /// False when the bucket can never grant a single token.
    pub ok: bool,
}

impl Reservation {
    fn immediate() -> Self {
        Self { wait: Duration::ZERO, ok: true }
    }

    fn impossible() -> Self {
        Self { wait: Duration::ZERO, ok: false }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    /// Refill accounting point. Ahead of the clock while reservations are
    /// outstanding.
    last_refill: Duration,
    last_seen: Duration,
    /// Set once the registry has dropped this bucket. A retired bucket
    /// grants nothing so a stale handle cannot double a key's burst.
    retired: bool,
}

/// Token bucket for a single key.
///
/// Tokens are refilled lazily from elapsed clock time on every decision;
/// there is no timer behind a bucket. All state lives behind one mutex so
/// concurrent decisions on the same key are linearizable.
#[derive(Debug)]
pub struct TokenBucket {
    spec: RateSpec,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(spec: RateSpec, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            spec,
            clock,
            state: Mutex::new(BucketState {
                tokens: spec.burst as f64,
                last_refill: now,
                last_seen: now,
                retired: false,
            }),
        }
    }

    /// Get the rate and burst this bucket was built with.
    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    /// Consume one token if one is available right now.
    ///
    /// Always refuses once the bucket has been retired.
    pub fn allow(&self) -> bool {
        self.try_allow().unwrap_or(false)
    }

    /// Like [`allow`](Self::allow), but `None` if the bucket is retired.
    pub(crate) fn try_allow(&self) -> Option<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.retired {
            return None;
        }
        self.refill(&mut state, now);

        if state.last_refill > now {
            // Outstanding reservations own every token until then.
            return Some(false);
        }
        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Reserve one token, returning how long the caller must wait to use it.
    ///
    /// Never blocks. When no token is available the bucket is committed to
    /// the future grant straight away, so later callers queue behind it.
    pub fn reserve(&self) -> Reservation {
        self.try_reserve().unwrap_or_else(Reservation::impossible)
    }

    /// Like [`reserve`](Self::reserve), but `None` if the bucket is retired.
    pub(crate) fn try_reserve(&self) -> Option<Reservation> {
        if self.spec.burst == 0 {
            return Some(Reservation::impossible());
        }

        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.retired {
            return None;
        }
        self.refill(&mut state, now);

        if state.last_refill <= now && state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            return Some(Reservation::immediate());
        }
        if !self.refills() {
            return Some(Reservation::impossible());
        }

        let missing = (1.0 - state.tokens).max(0.0);
        let until = state
            .last_refill
            .max(now)
            .saturating_add(self.spec.time_to_accrue(missing));
        state.tokens = 0.0;
        state.last_refill = until;

        Some(Reservation {
            wait: until.saturating_sub(now),
            ok: true,
        })
    }

    /// Estimate the wait until one token is available, without consuming
    /// anything. `None` if one never will be.
    pub fn wait_time(&self) -> Option<Duration> {
        if self.spec.burst == 0 {
            return None;
        }

        let now = self.clock.now();
        let state = self.state.lock();
        let tokens = self.projected_tokens(&state, now);

        if state.last_refill <= now && tokens + TOKEN_EPSILON >= 1.0 {
            return Some(Duration::ZERO);
        }
        if !self.refills() {
            return None;
        }

        let missing = (1.0 - tokens).max(0.0);
        let until = state
            .last_refill
            .max(now)
            .saturating_add(self.spec.time_to_accrue(missing));
        Some(until.saturating_sub(now))
    }

    /// Tokens available right now, including fractional refill.
    pub fn available(&self) -> f64 {
        let now = self.clock.now();
        let state = self.state.lock();
        self.projected_tokens(&state, now)
    }

    /// How long since a decision last touched this bucket.
    pub fn idle_for(&self) -> Duration {
        let now = self.clock.now();
        let state = self.state.lock();
        now.saturating_sub(state.last_seen)
    }

    /// Retire the bucket if it has been idle for `ttl` and holds nothing
    /// a fresh bucket would not.
    ///
    /// That means a full bucket with no outstanding reservation. Once
    /// retired, it stays retired. Returns whether the bucket is retired.
    pub(crate) fn retire_if_idle(&self, ttl: Duration) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.retired {
            return true;
        }

        let idle = now.saturating_sub(state.last_seen) >= ttl;
        let settled = state.last_refill <= now;
        let full = self.projected_tokens(&state, now) + TOKEN_EPSILON >= self.spec.burst as f64;
        if idle && settled && full {
            state.retired = true;
        }
        state.retired
    }

    fn refills(&self) -> bool {
        self.spec.rate.is_finite() && self.spec.rate > 0.0
    }

    fn projected_tokens(&self, state: &BucketState, now: Duration) -> f64 {
        if now <= state.last_refill || !self.refills() {
            return state.tokens;
        }
        let elapsed = (now - state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.spec.rate).min(self.spec.burst as f64)
    }

    fn refill(&self, state: &mut BucketState, now: Duration) {
        state.tokens = self.projected_tokens(state, now);
        if now > state.last_refill {
            state.last_refill = now;
        }
        if now > state.last_seen {
            state.last_seen = now;
        }
    }
}
