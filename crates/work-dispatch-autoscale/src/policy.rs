//! Scaling policy.

use std::time::Duration;

/// Autoscaler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscaleSettings {
    /// Lower bound for the pool size.
    pub min_pool_size: usize,
    /// Upper bound for the pool size.
    pub max_pool_size: usize,
    /// How often queue and pool are sampled.
    pub sampling_period: Duration,
    /// Consecutive empty-queue samples required before shrinking.
    pub shrink_after_idle_samples: u32,
    /// No growth while the error rate exceeds this; growing a failing pool
    /// amplifies the failure cost.
    pub error_rate_growth_ceiling: f64,
    /// Throughput counts as grown only when it rose by more than this
    /// fraction since the previous sample.
    pub flat_throughput_tolerance: f64,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 100,
            sampling_period: Duration::from_secs(1),
            shrink_after_idle_samples: 2,
            error_rate_growth_ceiling: 0.5,
            flat_throughput_tolerance: 0.05,
        }
    }
}

/// One sampler observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyInput {
    pub queue_len: usize,
    /// Estimated dispatches per second; `None` while unknown.
    pub throughput: Option<f64>,
    pub pool_size: usize,
    pub error_rate: f64,
}

/// Pure scaling policy; all state is the sample history it keeps itself.
#[derive(Debug, Clone)]
pub struct AutoscalePolicy {
    settings: AutoscaleSettings,
    last_throughput: Option<f64>,
    idle_streak: u32,
}

impl AutoscalePolicy {
    pub fn new(settings: AutoscaleSettings) -> Self {
        Self {
            settings,
            last_throughput: None,
            idle_streak: 0,
        }
    }

    /// Evaluates one sample, returning the new target pool size when a
    /// resize is warranted.
    pub fn evaluate(&mut self, input: PolicyInput) -> Option<usize> {
        if input.queue_len == 0 {
            self.idle_streak = self.idle_streak.saturating_add(1);
        } else {
            self.idle_streak = 0;
        }

        // Unknown throughput counts as flat: a standing backlog with no
        // dispatch signal still wants more hands.
        let flat_or_declining = match (self.last_throughput, input.throughput) {
            (Some(prev), Some(cur)) => {
                cur <= prev * (1.0 + self.settings.flat_throughput_tolerance)
            }
            _ => true,
        };
        self.last_throughput = input.throughput;

        if input.queue_len > 0
            && flat_or_declining
            && input.pool_size < self.settings.max_pool_size
            && input.error_rate <= self.settings.error_rate_growth_ceiling
        {
            return Some(input.pool_size + 1);
        }

        if self.idle_streak >= self.settings.shrink_after_idle_samples
            && input.pool_size > self.settings.min_pool_size
        {
            // Fresh streak before the next step down.
            self.idle_streak = 0;
            return Some(input.pool_size - 1);
        }

        None
    }

    pub fn settings(&self) -> &AutoscaleSettings {
        &self.settings
    }
}
