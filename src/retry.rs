//! Reconnect backoff and jitter.
//!
//! [`RetryState`] holds the stored delay. It only changes in two places: it
//! is reset to the minimum when a transport opens and grown after every close
//! while retrying is allowed. The delay actually used to schedule a retry is
//! a *presented* copy run through [`vary`], so jitter never feeds back into
//! the stored value.

use std::time::Duration;

use rand::Rng;

/// Default smallest reconnect delay.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);
/// Default largest reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Default multiplicative growth applied after each close.
pub const DEFAULT_GROWTH: f64 = 2.0;
/// Default symmetric jitter fraction.
pub const DEFAULT_VARIANCE: f64 = 0.1;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Factor applied to the stored delay after each close. At least 1.
    pub growth: f64,
    /// Jitter fraction in `0.0..=1.0`; 0.1 means ±10%.
    pub variance: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            growth: DEFAULT_GROWTH,
            variance: DEFAULT_VARIANCE,
        }
    }
}

impl RetryPolicy {
    /// Set the delay bounds. `max` is raised to `min` if it is smaller.
    #[must_use]
    pub fn with_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max.max(min);
        self
    }

    /// Set the growth factor. Values below 1 (and NaN) are clamped to 1.
    #[must_use]
    pub fn with_growth(mut self, growth: f64) -> Self {
        self.growth = if growth >= 1.0 { growth } else { 1.0 };
        self
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_variance(mut self, variance: f64) -> Self {
        self.variance = clamp_variance(variance);
        self
    }

    /// The stored delay that follows `current`.
    pub fn grow(&self, current: Duration) -> Duration {
        let grown = Duration::try_from_secs_f64(current.as_secs_f64() * self.growth)
            .unwrap_or(self.max_delay);
        self.clamp(grown)
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay).max(self.min_delay)
    }
}

/// Mutable backoff state owned by the connection manager.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    current: Duration,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.min_delay,
            policy,
        }
    }

    /// The stored (un-jittered) delay.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn reset(&mut self) {
        self.current = self.policy.min_delay;
    }

    /// Grow the stored delay for the next close.
    pub fn grow(&mut self) {
        self.current = self.policy.grow(self.current);
    }

    /// A freshly jittered copy of the stored delay.
    pub fn presented(&self) -> Duration {
        vary(self.current, self.policy.variance)
    }
}

/// Perturb `value` by a uniformly random fraction in `±variance`.
pub fn vary(value: Duration, variance: f64) -> Duration {
    vary_with(&mut rand::thread_rng(), value, variance)
}

/// [`vary`] with a caller-supplied random source.
pub fn vary_with<R: Rng + ?Sized>(rng: &mut R, value: Duration, variance: f64) -> Duration {
    let variance = clamp_variance(variance);
    if variance == 0.0 {
        return value;
    }
    let factor = 1.0 + variance * rng.gen_range(-1.0..=1.0);
    Duration::try_from_secs_f64(value.as_secs_f64() * factor).unwrap_or(value)
}

fn clamp_variance(variance: f64) -> f64 {
    if variance.is_nan() {
        0.0
    } else {
        variance.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_min_delay() {
        let state = RetryState::new(RetryPolicy::default());
        assert_eq!(state.current(), DEFAULT_MIN_DELAY);
    }

    #[test]
    fn grows_monotonically_and_caps_at_max() {
        let mut state = RetryState::new(RetryPolicy::default());
        let mut previous = state.current();
        let mut seen = Vec::new();
        for _ in 0..20 {
            state.grow();
            assert!(state.current() >= previous);
            assert!(state.current() <= DEFAULT_MAX_DELAY);
            previous = state.current();
            seen.push(previous.as_secs());
        }
        assert_eq!(&seen[..7], &[2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn reset_returns_to_min() {
        let mut state = RetryState::new(RetryPolicy::default());
        state.grow();
        state.grow();
        state.reset();
        assert_eq!(state.current(), DEFAULT_MIN_DELAY);
    }

    #[test]
    fn presented_delay_stays_within_variance_and_leaves_state_alone() {
        let mut state = RetryState::new(RetryPolicy::default());
        state.grow();
        state.grow();
        let stored = state.current();
        for _ in 0..1000 {
            let shown = state.presented().as_secs_f64();
            assert!(shown >= stored.as_secs_f64() * 0.9 - 1e-9);
            assert!(shown <= stored.as_secs_f64() * 1.1 + 1e-9);
        }
        assert_eq!(state.current(), stored);
    }

    #[test]
    fn zero_variance_is_identity() {
        let value = Duration::from_millis(1500);
        assert_eq!(vary(value, 0.0), value);
    }

    #[test]
    fn variance_is_clamped() {
        let value = Duration::from_secs(10);
        for _ in 0..100 {
            let shown = vary(value, 5.0);
            assert!(shown <= Duration::from_secs(20));
        }
        assert_eq!(vary(value, f64::NAN), value);
    }

    #[test]
    fn builder_clamps_inputs() {
        let policy = RetryPolicy::default()
            .with_bounds(Duration::from_secs(5), Duration::from_secs(2))
            .with_growth(0.5)
            .with_variance(-1.0);
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert_eq!(policy.growth, 1.0);
        assert_eq!(policy.variance, 0.0);
        assert_eq!(policy.grow(Duration::from_secs(5)), Duration::from_secs(5));
    }
}
