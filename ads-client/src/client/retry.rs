//! Retry policy configuration based on gRFC A6.

use std::time::Duration;

use crate::error::{Error, Result};

/// Retry policy for failed reads and stream re-opens.
///
/// Exponential backoff with optional jitter, following the gRFC A6
/// proposal for client retries.
///
/// # Example
///
/// ```
/// use ads_client::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_initial_backoff(Duration::from_secs(1)).unwrap()
///     .with_max_backoff(Duration::from_secs(30)).unwrap()
///     .with_backoff_multiplier(2.0).unwrap()
///     .with_jitter(0.2).unwrap();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Initial backoff duration for the first retry attempt.
    ///
    /// Default: 1 second.
    pub initial_backoff: Duration,

    /// Maximum backoff duration, before jitter is applied.
    ///
    /// Default: 30 seconds.
    pub max_backoff: Duration,

    /// Multiplier for exponential backoff.
    ///
    /// After each failed attempt, the current backoff duration is multiplied
    /// by this value (up to `max_backoff`). A multiplier of 1.0 gives a
    /// fixed delay.
    ///
    /// Default: 2.0.
    pub backoff_multiplier: f64,

    /// Relative jitter applied to each backoff, in `[0.0, 1.0]`.
    ///
    /// A jitter of 0.2 spreads each delay uniformly over ±20% of its
    /// computed value. Values outside the range are clamped to it.
    ///
    /// Default: 0.0.
    pub jitter: f64,

    /// Maximum number of retry attempts.
    ///
    /// If `None`, retries indefinitely. If `Some(n)`, stops after `n` attempts.
    ///
    /// Default: None (infinite retries).
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    /// Create a new retry policy with custom parameters and no jitter.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `backoff_multiplier` is less than 1.0
    /// - `max_backoff` is less than `initial_backoff`
    /// - `initial_backoff` is zero
    ///
    /// # Example
    ///
    /// ```
    /// use ads_client::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(
    ///     Duration::from_millis(500),  // initial_backoff
    ///     Duration::from_secs(60),     // max_backoff
    ///     1.5,                         // backoff_multiplier
    /// )?;
    /// # Ok::<(), ads_client::Error>(())
    /// ```
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        if initial_backoff.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }

        if backoff_multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {backoff_multiplier}"
            )));
        }

        if max_backoff < initial_backoff {
            return Err(Error::Validation(format!(
                "max_backoff ({max_backoff:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }

        Ok(Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter: 0.0,
            max_attempts: None,
        })
    }

    /// A fixed delay between attempts, with no growth and no jitter.
    ///
    /// # Errors
    ///
    /// Returns an error if `delay` is zero.
    pub fn fixed(delay: Duration) -> Result<Self> {
        Self::new(delay, delay, 1.0)
    }

    /// Set the initial backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is zero or greater than `max_backoff`.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }
        if duration > self.max_backoff {
            let max_backoff = self.max_backoff;
            return Err(Error::Validation(format!(
                "initial_backoff ({duration:?}) must be <= max_backoff ({max_backoff:?})"
            )));
        }
        self.initial_backoff = duration;
        Ok(self)
    }

    /// Set the maximum backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is less than `initial_backoff`.
    pub fn with_max_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration < self.initial_backoff {
            let initial_backoff = self.initial_backoff;
            return Err(Error::Validation(format!(
                "max_backoff ({duration:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }
        self.max_backoff = duration;
        Ok(self)
    }

    /// Set the backoff multiplier.
    ///
    /// # Errors
    ///
    /// Returns an error if `multiplier` is less than 1.0.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Result<Self> {
        if multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        self.backoff_multiplier = multiplier;
        Ok(self)
    }

    /// Set the relative jitter.
    ///
    /// # Errors
    ///
    /// Returns an error if `jitter` is outside `[0.0, 1.0]`.
    pub fn with_jitter(mut self, jitter: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&jitter) {
            return Err(Error::Validation(format!(
                "jitter must be within [0.0, 1.0], got {jitter}"
            )));
        }
        self.jitter = jitter;
        Ok(self)
    }

    /// Set the maximum number of retry attempts.
    ///
    /// If set to `None`, retries indefinitely.
    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculate the backoff duration for a given attempt number, before jitter.
    ///
    /// Returns `None` if `max_attempts` is set and the attempt exceeds it.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The retry attempt number (0-indexed).
    ///
    /// # Example
    ///
    /// ```
    /// use ads_client::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff_duration(0), Some(Duration::from_secs(1)));
    /// assert_eq!(policy.backoff_duration(1), Some(Duration::from_secs(2)));
    /// assert_eq!(policy.backoff_duration(2), Some(Duration::from_secs(4)));
    /// ```
    pub fn backoff_duration(&self, attempt: usize) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let multiplier = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        if !multiplier.is_finite() {
            return Some(self.max_backoff);
        }
        let backoff = Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * multiplier)
            .unwrap_or(self.max_backoff);

        Some(backoff.min(self.max_backoff))
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        // The field is public, so out-of-range values are clamped here.
        let jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        if jitter == 0.0 {
            return duration;
        }
        // Uniform in [1 - jitter, 1 + jitter).
        let factor = 1.0 + jitter * (2.0 * fastrand::f64() - 1.0);
        // Durations near `Duration::MAX` overflow when scaled up.
        Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(duration)
    }
}

impl Default for RetryPolicy {
    /// Create a retry policy with default values based on gRFC A6.
    ///
    /// Defaults:
    /// - `initial_backoff`: 1 second
    /// - `max_backoff`: 30 seconds
    /// - `backoff_multiplier`: 2.0
    /// - `jitter`: 0.0 (callers opt in with [`RetryPolicy::with_jitter`])
    /// - `max_attempts`: None (infinite retries)
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

/// Stateful backoff calculator based on a [`RetryPolicy`].
///
/// This struct tracks the current attempt number and provides methods to
/// get the next backoff duration and reset after successful operations.
///
/// # Example
///
/// ```
/// use ads_client::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(RetryPolicy::default());
///
/// // First failure: get initial backoff
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
///
/// // Second failure: backoff doubles
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
///
/// // Success: reset for next failure sequence
/// backoff.reset();
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    /// Create a new backoff calculator from a retry policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Get the next (jittered) backoff duration and advance the attempt counter.
    ///
    /// Returns `None` if `max_attempts` is set and has been exceeded.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let duration = self.policy.backoff_duration(self.attempt)?;
        self.attempt += 1;
        Some(self.policy.apply_jitter(duration))
    }

    /// Reset the backoff after a successful operation.
    ///
    /// This resets the attempt counter to 0, so the next failure will
    /// use the initial backoff duration.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of backoffs handed out since the last reset.
    pub fn attempts(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates() {
        assert!(RetryPolicy::new(Duration::ZERO, Duration::from_secs(1), 2.0).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 0.5).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(1), 2.0).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 1.0).is_ok());
    }

    #[test]
    fn test_setters_validate() {
        let policy = RetryPolicy::default();
        assert!(policy.clone().with_initial_backoff(Duration::ZERO).is_err());
        assert!(
            policy
                .clone()
                .with_initial_backoff(Duration::from_secs(31))
                .is_err()
        );
        assert!(
            policy
                .clone()
                .with_max_backoff(Duration::from_millis(500))
                .is_err()
        );
        assert!(policy.clone().with_backoff_multiplier(0.9).is_err());
        assert!(policy.clone().with_jitter(-0.1).is_err());
        assert!(policy.clone().with_jitter(1.5).is_err());
        assert!(policy.with_jitter(1.0).is_ok());
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_duration(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.backoff_duration(5), Some(Duration::from_secs(30)));
        assert_eq!(policy.backoff_duration(500), Some(Duration::from_secs(30)));
        assert_eq!(
            policy.backoff_duration(usize::MAX),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10))
            .unwrap()
            .with_max_attempts(Some(2));
        let mut backoff = Backoff::new(policy);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10))
            .unwrap()
            .with_jitter(0.2)
            .unwrap();
        let mut backoff = Backoff::new(policy);
        for _ in 0..100 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= Duration::from_secs(8), "{delay:?}");
            assert!(delay <= Duration::from_secs(12), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_near_max_duration_does_not_overflow() {
        let policy = RetryPolicy::default()
            .with_max_backoff(Duration::MAX)
            .unwrap()
            .with_jitter(0.5)
            .unwrap();
        let mut backoff = Backoff::new(policy);
        for _ in 0..200 {
            assert!(backoff.next_backoff().is_some());
        }
        assert!(backoff.next_backoff().unwrap() >= Duration::from_secs(1));
    }

    #[test]
    fn test_out_of_range_jitter_is_clamped() {
        let mut policy = RetryPolicy::fixed(Duration::from_secs(10)).unwrap();
        policy.jitter = 5.0;
        let mut backoff = Backoff::new(policy.clone());
        for _ in 0..100 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay <= Duration::from_secs(20), "{delay:?}");
        }

        policy.jitter = f64::NAN;
        assert_eq!(
            Backoff::new(policy).next_backoff(),
            Some(Duration::from_secs(10))
        );
    }
}
