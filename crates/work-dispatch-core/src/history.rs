//! Dispatch-history throughput estimation.
//!
//! The queue records a timestamp for every item it hands to a worker. The
//! resulting ring, bounded by a window duration, yields the throughput used
//! for expected-wait-time backpressure and for autoscaling decisions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling window of recent dispatch timestamps.
#[derive(Debug, Clone)]
pub struct DispatchHistory {
    samples: VecDeque<Instant>,
    window: Duration,
}

impl DispatchHistory {
    /// Creates an empty history covering the given window duration.
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Records a dispatch at `now`, evicting samples older than the window.
    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.samples.push_back(now);
    }

    /// Dispatches per second over the window, or `None` while the window
    /// holds fewer than two samples and throughput is unknown.
    pub fn throughput(&mut self, now: Instant) -> Option<f64> {
        self.prune(now);
        if self.samples.len() < 2 {
            return None;
        }
        Some(self.samples.len() as f64 / self.window.as_secs_f64())
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.samples.front() {
            if now.duration_since(*first) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
