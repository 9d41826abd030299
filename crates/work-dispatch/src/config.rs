//! Dispatcher settings.
//!
//! A single immutable record with explicit optional sub-records, each gated
//! by an `enabled` flag. Construct it directly, through the builder, or (with
//! the `serde` feature) deserialize it from an external config shape.

use std::time::Duration;

use work_dispatch_autoscale::AutoscaleSettings;
use work_dispatch_pool::{BreakerSettings, PoolConfig};
use work_dispatch_queue::{BackpressureSettings, QueueConfig};

/// Invalid settings detected at dispatcher construction. Fatal: no engine
/// is spawned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A rate that must lie within `[0, 1]` does not.
    #[error("{field} must be within [0, 1], got {value}")]
    RateOutOfRange {
        field: &'static str,
        value: f64,
    },
    /// Pool bounds are inverted or empty.
    #[error("worker pool bounds must satisfy min <= max with max >= 1, got [{min}, {max}]")]
    PoolBounds { min: usize, max: usize },
    /// A duration that must be non-zero is zero.
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
    /// A count that must be non-zero is zero.
    #[error("{0} must be non-zero")]
    ZeroCount(&'static str),
    /// Shrink hysteresis below the supported floor.
    #[error("shrink_after_idle_samples must be at least 2, got {0}")]
    ShrinkHysteresis(u32),
}

/// Window for the dispatch-history throughput estimate.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DispatchHistorySettings {
    pub max_history_length: Duration,
}

impl Default for DispatchHistorySettings {
    fn default() -> Self {
        Self {
            max_history_length: Duration::from_secs(10),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WorkerPoolSettings {
    pub starting_pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Per-attempt cap on backend time, on top of the item deadline.
    pub max_processing_time: Option<Duration>,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            starting_pool_size: 8,
            min_pool_size: 1,
            max_pool_size: 100,
            max_processing_time: None,
        }
    }
}

/// Circuit breaker block; active only while `enabled`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub close_duration: Duration,
    pub error_rate_threshold: f64,
    pub history_length: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            close_duration: Duration::from_secs(3),
            error_rate_threshold: 0.6,
            history_length: 100,
        }
    }
}

/// Backpressure block; active only while `enabled`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BackPressureSettings {
    pub enabled: bool,
    pub max_buffer_size: usize,
    pub threshold_for_expected_wait_time: Duration,
    pub max_history_length: Duration,
}

impl Default for BackPressureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_buffer_size: 60_000,
            threshold_for_expected_wait_time: Duration::from_secs(5 * 60),
            max_history_length: Duration::from_secs(10),
        }
    }
}

/// Autoscaling block; active only while `enabled`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AutoScalingSettings {
    pub enabled: bool,
    pub sampling_period: Duration,
    pub shrink_after_idle_samples: u32,
    pub error_rate_growth_ceiling: f64,
    pub flat_throughput_tolerance: f64,
}

impl Default for AutoScalingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_period: Duration::from_secs(1),
            shrink_after_idle_samples: 2,
            error_rate_growth_ceiling: 0.5,
            flat_throughput_tolerance: 0.05,
        }
    }
}

/// Complete dispatcher configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DispatchSettings {
    /// Name used as the label on events and metrics.
    pub name: String,
    /// Deadline per work item, measured from admission.
    pub work_timeout: Duration,
    /// Retry budget per work item.
    pub work_retry: u32,
    /// Drain bound for shutdowns the engine initiates itself (pull-mode
    /// completion, dropped handles).
    pub shutdown_timeout: Duration,
    pub dispatch_history: DispatchHistorySettings,
    pub worker_pool: WorkerPoolSettings,
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    pub back_pressure: Option<BackPressureSettings>,
    pub auto_scaling: Option<AutoScalingSettings>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            name: String::from("<unnamed>"),
            work_timeout: Duration::from_secs(60),
            work_retry: 0,
            shutdown_timeout: Duration::from_secs(30),
            dispatch_history: DispatchHistorySettings::default(),
            worker_pool: WorkerPoolSettings::default(),
            circuit_breaker: None,
            back_pressure: None,
            auto_scaling: None,
        }
    }
}

impl DispatchSettings {
    /// Creates a builder seeded with the defaults.
    pub fn builder() -> DispatchSettingsBuilder {
        DispatchSettingsBuilder {
            settings: Self::default(),
        }
    }

    /// Checks every bound the engine relies on. Called by the dispatcher
    /// builders; a violation is fatal to construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("work_timeout"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("shutdown_timeout"));
        }
        if self.dispatch_history.max_history_length.is_zero() {
            return Err(ConfigError::ZeroDuration("dispatch_history.max_history_length"));
        }
        let pool = &self.worker_pool;
        if pool.max_pool_size == 0 || pool.min_pool_size > pool.max_pool_size {
            return Err(ConfigError::PoolBounds {
                min: pool.min_pool_size,
                max: pool.max_pool_size,
            });
        }
        if let Some(cb) = self.circuit_breaker.as_ref().filter(|cb| cb.enabled) {
            if !(0.0..=1.0).contains(&cb.error_rate_threshold) {
                return Err(ConfigError::RateOutOfRange {
                    field: "circuit_breaker.error_rate_threshold",
                    value: cb.error_rate_threshold,
                });
            }
            if cb.history_length == 0 {
                return Err(ConfigError::ZeroCount("circuit_breaker.history_length"));
            }
            if cb.close_duration.is_zero() {
                return Err(ConfigError::ZeroDuration("circuit_breaker.close_duration"));
            }
        }
        if let Some(bp) = self.back_pressure.as_ref().filter(|bp| bp.enabled) {
            if bp.max_buffer_size == 0 {
                return Err(ConfigError::ZeroCount("back_pressure.max_buffer_size"));
            }
            if bp.threshold_for_expected_wait_time.is_zero() {
                return Err(ConfigError::ZeroDuration(
                    "back_pressure.threshold_for_expected_wait_time",
                ));
            }
            if bp.max_history_length.is_zero() {
                return Err(ConfigError::ZeroDuration("back_pressure.max_history_length"));
            }
        }
        if let Some(auto) = self.auto_scaling.as_ref().filter(|auto| auto.enabled) {
            if auto.sampling_period.is_zero() {
                return Err(ConfigError::ZeroDuration("auto_scaling.sampling_period"));
            }
            if auto.shrink_after_idle_samples < 2 {
                return Err(ConfigError::ShrinkHysteresis(auto.shrink_after_idle_samples));
            }
            if !(0.0..=1.0).contains(&auto.error_rate_growth_ceiling) {
                return Err(ConfigError::RateOutOfRange {
                    field: "auto_scaling.error_rate_growth_ceiling",
                    value: auto.error_rate_growth_ceiling,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn queue_config(&self) -> QueueConfig {
        let backpressure = self
            .back_pressure
            .as_ref()
            .filter(|bp| bp.enabled)
            .map(|bp| BackpressureSettings {
                max_buffer_size: bp.max_buffer_size,
                threshold_for_expected_wait_time: bp.threshold_for_expected_wait_time,
            });
        // The backpressure block carries its own window length; it wins over
        // the engine-wide one when active.
        let history_window = self
            .back_pressure
            .as_ref()
            .filter(|bp| bp.enabled)
            .map(|bp| bp.max_history_length)
            .unwrap_or(self.dispatch_history.max_history_length);
        QueueConfig {
            name: self.name.clone(),
            history_window,
            backpressure,
        }
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        let breaker = self
            .circuit_breaker
            .as_ref()
            .filter(|cb| cb.enabled)
            .map(|cb| BreakerSettings {
                close_duration: cb.close_duration,
                error_rate_threshold: cb.error_rate_threshold,
                history_length: cb.history_length,
            });
        PoolConfig {
            name: self.name.clone(),
            starting_pool_size: self.worker_pool.starting_pool_size,
            min_pool_size: self.worker_pool.min_pool_size,
            max_pool_size: self.worker_pool.max_pool_size,
            max_processing_time: self.worker_pool.max_processing_time,
            breaker,
            ..PoolConfig::default()
        }
    }

    pub(crate) fn autoscale_settings(&self) -> Option<AutoscaleSettings> {
        self.auto_scaling
            .as_ref()
            .filter(|auto| auto.enabled)
            .map(|auto| AutoscaleSettings {
                min_pool_size: self.worker_pool.min_pool_size,
                max_pool_size: self.worker_pool.max_pool_size,
                sampling_period: auto.sampling_period,
                shrink_after_idle_samples: auto.shrink_after_idle_samples,
                error_rate_growth_ceiling: auto.error_rate_growth_ceiling,
                flat_throughput_tolerance: auto.flat_throughput_tolerance,
            })
    }
}

/// Builder for [`DispatchSettings`].
#[derive(Debug, Clone)]
pub struct DispatchSettingsBuilder {
    settings: DispatchSettings,
}

impl DispatchSettingsBuilder {
    /// Give this dispatcher a human-readable name for observability.
    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.settings.name = name.into();
        self
    }

    /// Sets the per-item deadline.
    ///
    /// Default: 1 minute
    pub fn work_timeout(mut self, timeout: Duration) -> Self {
        self.settings.work_timeout = timeout;
        self
    }

    /// Sets the per-item retry budget.
    ///
    /// Default: 0
    pub fn work_retry(mut self, retries: u32) -> Self {
        self.settings.work_retry = retries;
        self
    }

    /// Sets the drain bound for engine-initiated shutdowns.
    ///
    /// Default: 30 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    /// Sets the dispatch-history window used for throughput estimation.
    ///
    /// Default: 10 seconds
    pub fn dispatch_history_window(mut self, window: Duration) -> Self {
        self.settings.dispatch_history.max_history_length = window;
        self
    }

    /// Sets the worker pool bounds in one go.
    pub fn worker_pool(mut self, starting: usize, min: usize, max: usize) -> Self {
        self.settings.worker_pool.starting_pool_size = starting;
        self.settings.worker_pool.min_pool_size = min;
        self.settings.worker_pool.max_pool_size = max;
        self
    }

    /// Caps the backend time of a single attempt.
    pub fn max_processing_time(mut self, cap: Duration) -> Self {
        self.settings.worker_pool.max_processing_time = Some(cap);
        self
    }

    /// Installs a circuit breaker block.
    pub fn circuit_breaker(mut self, settings: CircuitBreakerSettings) -> Self {
        self.settings.circuit_breaker = Some(settings);
        self
    }

    /// Installs a backpressure block.
    pub fn back_pressure(mut self, settings: BackPressureSettings) -> Self {
        self.settings.back_pressure = Some(settings);
        self
    }

    /// Installs an autoscaling block.
    pub fn auto_scaling(mut self, settings: AutoScalingSettings) -> Self {
        self.settings.auto_scaling = Some(settings);
        self
    }

    /// Returns the finished settings record. Bounds are checked when a
    /// dispatcher is built from it.
    pub fn build(self) -> DispatchSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(DispatchSettings::default().validate(), Ok(()));
    }

    #[test]
    fn builder_sets_every_knob() {
        let settings = DispatchSettings::builder()
            .name("orders")
            .work_timeout(Duration::from_secs(5))
            .work_retry(2)
            .worker_pool(4, 1, 16)
            .max_processing_time(Duration::from_secs(1))
            .circuit_breaker(CircuitBreakerSettings::default())
            .back_pressure(BackPressureSettings::default())
            .auto_scaling(AutoScalingSettings::default())
            .build();
        assert_eq!(settings.name, "orders");
        assert_eq!(settings.work_retry, 2);
        assert_eq!(settings.worker_pool.max_pool_size, 16);
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_error_rate_threshold() {
        let mut settings = DispatchSettings::default();
        settings.circuit_breaker = Some(CircuitBreakerSettings {
            error_rate_threshold: 1.5,
            ..CircuitBreakerSettings::default()
        });
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::RateOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let mut settings = DispatchSettings::default();
        settings.worker_pool.min_pool_size = 10;
        settings.worker_pool.max_pool_size = 2;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::PoolBounds { .. })
        ));
    }

    #[test]
    fn disabled_blocks_are_not_validated_or_applied() {
        let mut settings = DispatchSettings::default();
        settings.circuit_breaker = Some(CircuitBreakerSettings {
            enabled: false,
            error_rate_threshold: 7.0,
            ..CircuitBreakerSettings::default()
        });
        settings.back_pressure = Some(BackPressureSettings {
            enabled: false,
            ..BackPressureSettings::default()
        });
        assert_eq!(settings.validate(), Ok(()));
        assert!(settings.pool_config().breaker.is_none());
        assert!(settings.queue_config().backpressure.is_none());
    }

    #[test]
    fn backpressure_window_overrides_the_engine_wide_one() {
        let mut settings = DispatchSettings::default();
        settings.back_pressure = Some(BackPressureSettings {
            max_history_length: Duration::from_secs(3),
            ..BackPressureSettings::default()
        });
        assert_eq!(
            settings.queue_config().history_window,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn rejects_degenerate_hysteresis() {
        let mut settings = DispatchSettings::default();
        settings.auto_scaling = Some(AutoScalingSettings {
            shrink_after_idle_samples: 1,
            ..AutoScalingSettings::default()
        });
        assert_eq!(settings.validate(), Err(ConfigError::ShrinkHysteresis(1)));
    }
}
