//! Queue configuration.

use std::time::Duration;

/// Backpressure bounds applied at admission.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureSettings {
    /// Hard cap on queued items.
    pub max_buffer_size: usize,
    /// Reject when `len / throughput` projects a wait longer than this.
    pub threshold_for_expected_wait_time: Duration,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: 60_000,
            threshold_for_expected_wait_time: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration for a queue task.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Dispatcher name, used as the label on events and metrics.
    pub name: String,
    /// Window duration for the dispatch-history throughput estimate.
    pub history_window: Duration,
    /// Admission bounds; `None` disables backpressure entirely.
    pub backpressure: Option<BackpressureSettings>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::from("<unnamed>"),
            history_window: Duration::from_secs(10),
            backpressure: None,
        }
    }
}
