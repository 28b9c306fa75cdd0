//! A token bucket rate limiter used to pace ingest traffic.
//!
//! The bucket tracks a `balance` of available tokens as a single `u64`
//! interpreted *modularly*: values in `0..=burst` are credit, values in
//! `burst+1..=u64::MAX` are debt (`u64::MAX - balance + 1` tokens owed).
//! Withdrawing tokens is therefore a single unconditional `wrapping_sub` —
//! an overdraft doesn't need a branch, it just walks the balance past
//! `burst` into the debt half of the range. [`TokenBucket::request`] returns
//! the number of nanoseconds the caller should sleep to walk the bucket back
//! out of debt at the configured rate.
//!
//! This representation, and the `dt_max` overflow ceiling used by
//! [`refill`](TokenBucket::request), are preserved exactly as designed —
//! see the module-level comments inline below for the reasoning at each
//! step. Do not "clean up" the wrapping arithmetic into a signed
//! credit/debt pair; the modular trick is what makes a withdrawal and a
//! refill each a single branch-free arithmetic op under the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const NSEC_PER_SEC: u128 = 1_000_000_000;

/// Source of monotonic nanosecond timestamps for a [`TokenBucket`].
///
/// Abstracted behind a trait so tests can drive the bucket's refill logic
/// with a controlled clock, including simulating time moving backward.
pub trait Clock: Send + Sync {
    /// Return a monotonically non-decreasing timestamp, in nanoseconds,
    /// relative to some fixed (implementation-defined) epoch.
    fn now_ns(&self) -> u64;
}

/// The default [`Clock`], backed by [`std::time::Instant`].
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

struct BucketState {
    burst: u64,
    rate: u64,
    balance: u64,
    refill_time_ns: u64,
    dt_max: u64,
    requests: u64,
}

/// A rate limiter that paces requests at `rate` units/second with a `burst`
/// cap, using the modular balance/debt representation described at the
/// module level.
pub struct TokenBucket<C: Clock = SystemClock> {
    clock: C,
    state: Mutex<BucketState>,
    /// Mirrors `state.rate`, read without locking so `request(0)`-style
    /// pacing-disabled callers never touch the lock at all.
    rate_hint: AtomicU64,
}

impl TokenBucket<SystemClock> {
    /// Create a new bucket with the given burst cap and refill rate
    /// (units/second), using the system clock.
    #[must_use]
    pub fn new(burst: u64, rate: u64) -> Self {
        Self::with_clock(burst, rate, SystemClock::default())
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a new bucket using an explicit [`Clock`] implementation.
    pub fn with_clock(burst: u64, rate: u64, clock: C) -> Self {
        let now = clock.now_ns();
        let mut state = BucketState {
            burst: 0,
            rate: 0,
            balance: 0,
            refill_time_ns: 0,
            dt_max: u64::MAX,
            requests: 0,
        };
        Self::set_burst_locked(&mut state, burst);
        Self::set_rate_locked(&mut state, rate);
        state.balance = burst;
        state.refill_time_ns = now;

        TokenBucket {
            clock,
            rate_hint: AtomicU64::new(rate),
            state: Mutex::new(state),
        }
    }

    /// Request `n` tokens, returning the number of nanoseconds the caller
    /// should delay to respect the configured rate.
    ///
    /// Returns `0` immediately, without taking the lock, if `n == 0` or
    /// pacing is disabled (`rate == 0`).
    pub fn request(&self, n: u64) -> u64 {
        if n == 0 || self.rate_hint.load(Ordering::Relaxed) == 0 {
            return 0;
        }

        let now = self.clock.now_ns();
        let (rate, debt) = {
            let mut state = self.state.lock();
            state.requests += 1;

            Self::refill_locked(&mut state, now);

            // Clamp the withdrawal so it cannot wrap the balance all the way
            // around into the full debt range. NOTE: this subtraction can
            // itself underflow when the bucket is already deep in debt; the
            // wrap-around result is then a huge `request_max` that no longer
            // clamps anything. This is a known quirk of the original design,
            // preserved deliberately rather than "fixed" (see SPEC_FULL.md §9).
            let request_max = state.balance.wrapping_sub(state.burst).wrapping_sub(1);
            let n = n.min(request_max);

            state.balance = state.balance.wrapping_sub(n);

            (state.rate, Self::debt_amount(&state))
        };

        match debt {
            Some(amount) if rate > 0 => ((amount as u128) * NSEC_PER_SEC / rate as u128) as u64,
            _ => 0,
        }
    }

    /// Change the burst cap and refill rate, preserving credit/debt class
    /// across the resize (see [`set_burst_locked`](Self::set_burst_locked)).
    pub fn adjust(&self, burst: u64, rate: u64) {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        Self::set_burst_locked(&mut state, burst);
        Self::refill_locked(&mut state, now);
        Self::set_rate_locked(&mut state, rate);
        self.rate_hint.store(rate, Ordering::Relaxed);
    }

    /// Current burst cap.
    #[must_use]
    pub fn burst_get(&self) -> u64 {
        self.state.lock().burst
    }

    /// Current refill rate (units/second).
    #[must_use]
    pub fn rate_get(&self) -> u64 {
        self.state.lock().rate
    }

    /// Total number of `request()` calls observed so far (diagnostic only).
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.state.lock().requests
    }

    /// Sleep for the given number of nanoseconds. A no-op for `0`.
    pub fn delay(nanos: u64) {
        if nanos != 0 {
            std::thread::sleep(Duration::from_nanos(nanos));
        }
    }

    /// Set `burst`, adjusting `balance` if the change would otherwise flip
    /// the bucket's credit/debt classification into a wildly different
    /// magnitude (e.g. shrinking `burst` out from under a credit balance
    /// would otherwise read as a huge debt).
    fn set_burst_locked(state: &mut BucketState, new_burst: u64) {
        let had_debt = state.balance > state.burst;
        state.burst = new_burst;
        let still_in_debt = state.balance > state.burst;

        if had_debt && !still_in_debt {
            state.balance = new_burst.wrapping_add(1);
            debug_assert!(new_burst == u64::MAX || state.balance > state.burst);
        } else if !had_debt && still_in_debt {
            state.balance = new_burst;
            debug_assert!(state.balance <= state.burst);
        }
    }

    fn set_rate_locked(state: &mut BucketState, rate: u64) {
        state.rate = rate;
        state.dt_max = if rate != 0 { u64::MAX / rate } else { u64::MAX };
    }

    fn refill_locked(state: &mut BucketState, now: u64) {
        state.balance = Self::balance_after(state, now);
        state.refill_time_ns = now;
    }

    /// Pure computation of the post-refill balance; has no side effects.
    fn balance_after(state: &BucketState, now: u64) -> u64 {
        if state.refill_time_ns > now {
            // Time moved backward. Tolerated: leave balance untouched.
            return state.balance;
        }

        let dt = now - state.refill_time_ns;
        if dt > state.dt_max {
            // Elapsed time is large enough that rate * dt could overflow;
            // the bucket is fully refilled in any case.
            return state.burst;
        }

        let refill = ((state.rate as u128) * (dt as u128) / NSEC_PER_SEC) as u64;

        // `burst.wrapping_sub(balance)` is the credit headroom when
        // balance <= burst, and wraps to a huge value when the bucket is
        // in debt — which is exactly what lets this refill proceed as a
        // plain addition that walks the balance back out of debt.
        let headroom = state.burst.wrapping_sub(state.balance);
        if refill > headroom {
            return state.burst;
        }

        state.balance.wrapping_add(refill)
    }

    fn debt_amount(state: &BucketState) -> Option<u64> {
        if state.balance > state.burst {
            Some(u64::MAX.wrapping_sub(state.balance).wrapping_add(1))
        } else {
            None
        }
    }
}
