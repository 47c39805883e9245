//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Relative jitter, applied symmetrically (0.2 = ±20 %).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt; each call advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.initial.as_secs_f64() * self.policy.factor.powi(self.attempt as i32);
        let capped = base.min(self.policy.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let scale = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * scale)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
