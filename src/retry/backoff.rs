//! Exponential backoff with full jitter.

use std::time::Duration;

/// Default base delay for the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default growth factor between consecutive retries.
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default hard ceiling on any computed delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

/// Policy deciding how long a failed task waits before becoming claimable
/// again.
///
/// The computed delay grows exponentially with the attempt count and is
/// capped at `max_delay`. The actual delay is drawn uniformly from
/// `[0, computed]` ("full jitter") so that a burst of simultaneous failures
/// does not come back as a synchronized burst of retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry, prior to jitter.
    pub base_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Hard ceiling on the computed delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy with the default constants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay ceiling.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Computed (non-jittered) delay for a task that has failed
    /// `attempt_count` times: `min(max_delay, base * multiplier^attempts)`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        // Exponent is clamped; past ~64 doublings the cap decides anyway.
        let growth = self.multiplier.powi(attempt_count.min(64) as i32);
        let raw_secs = self.base_delay.as_secs_f64() * growth;
        let capped = raw_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay: drawn uniformly from `[0, delay_for(attempt_count)]`.
    pub fn jittered_delay_for(&self, attempt_count: u32) -> Duration {
        use rand::RngExt;

        let ceiling = self.delay_for(attempt_count);
        let mut rng = rand::rng();
        Duration::from_secs_f64(rng.random_range(0.0..=ceiling.as_secs_f64()))
    }
}
