//! Election Backoff
//!
//! Exponential backoff with symmetric jitter for failed acquisition attempts.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::key::fnv1a64;
use crate::config::ElectionConfig;

/// Exponential backoff, capped, plus `±jitter` drawn from a seeded RNG.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: Duration,
    rng: StdRng,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: Duration, seed: u64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Builds the policy for one instance; the jitter seed comes from its identity.
    pub fn for_instance(config: &ElectionConfig, instance_id: &str) -> Self {
        Self::new(
            config.backoff_base,
            config.backoff_max,
            config.backoff_jitter,
            seed_for(instance_id),
        )
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    ///
    /// Attempt 1 waits `base`, attempt 2 waits `2 * base`, and so on up to `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Delay before the next attempt, jittered. Never negative.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = self.jitter.as_secs_f64();
        let offset = if spread > 0.0 {
            self.rng.random_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    pub fn max_delay(&self) -> Duration {
        self.max + self.jitter
    }
}

/// Per-instance jitter seed. Distinct instances desynchronise; a restart of the
/// same instance replays the same sequence.
pub fn seed_for(instance_id: &str) -> u64 {
    fnv1a64(instance_id.as_bytes())
}
