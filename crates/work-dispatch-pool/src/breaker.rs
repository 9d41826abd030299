//! Central circuit breaker.
//!
//! The breaker is owned by the processor task and consulted on every
//! dispatch permit. Keeping it task-local makes the half-open single-probe
//! rule a plain field check.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use work_dispatch_core::EventListeners;

use crate::events::PoolEvent;
use crate::worker::WorkerId;

/// How long a worker waits before re-asking for a permit while another
/// worker's half-open probe is still in flight.
const PROBE_BACKOFF: Duration = Duration::from_millis(25);

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// How long the circuit stays open before admitting a probe.
    pub close_duration: Duration,
    /// Failure fraction of the window at which the circuit opens, in `[0, 1]`.
    pub error_rate_threshold: f64,
    /// Number of outcomes in the sliding window.
    pub history_length: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            close_duration: Duration::from_secs(3),
            error_rate_threshold: 0.6,
            history_length: 100,
        }
    }
}

/// Breaker state, as sampled by the autoscaler and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// Answer to a worker's dispatch-permit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    /// Dispatch may proceed.
    Granted,
    /// Dispatch is suspended; re-ask after the given wait.
    BackOff(Duration),
}

pub(crate) struct Breaker {
    settings: BreakerSettings,
    state: BreakerState,
    /// Last `history_length` outcomes while closed; `true` is a failure.
    window: VecDeque<bool>,
    /// Worker holding the half-open probe permit.
    probe: Option<WorkerId>,
    events: EventListeners<PoolEvent>,
    name: String,
}

impl Breaker {
    pub(crate) fn new(
        settings: BreakerSettings,
        name: String,
        events: EventListeners<PoolEvent>,
    ) -> Self {
        Self {
            settings,
            state: BreakerState::Closed,
            window: VecDeque::new(),
            probe: None,
            events,
            name,
        }
    }

    pub(crate) fn state(&self) -> BreakerState {
        self.state
    }

    /// Failure fraction of the current window, zero while empty.
    pub(crate) fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / self.window.len() as f64
    }

    pub(crate) fn permit(&mut self, worker: WorkerId, now: Instant) -> Gate {
        match self.state {
            BreakerState::Closed => Gate::Granted,
            BreakerState::Open { until } => {
                if now >= until {
                    self.state = BreakerState::HalfOpen;
                    self.probe = Some(worker);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        dispatcher = %self.name,
                        worker = worker.0,
                        "circuit half-open, probe permitted"
                    );
                    Gate::Granted
                } else {
                    Gate::BackOff(until - now)
                }
            }
            BreakerState::HalfOpen => match self.probe {
                None => {
                    self.probe = Some(worker);
                    Gate::Granted
                }
                Some(_) => Gate::BackOff(PROBE_BACKOFF),
            },
        }
    }

    pub(crate) fn on_outcome(&mut self, worker: WorkerId, failure: bool, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                self.window.push_back(failure);
                if self.window.len() > self.settings.history_length {
                    self.window.pop_front();
                }
                if self.window.len() == self.settings.history_length
                    && self.error_rate() >= self.settings.error_rate_threshold
                {
                    self.trip(now);
                }
            }
            BreakerState::HalfOpen if self.probe == Some(worker) => {
                if failure {
                    self.trip(now);
                } else {
                    self.close();
                }
            }
            // Outcomes of calls that began before the trip carry no signal
            // about recovery.
            _ => {}
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open {
            until: now + self.settings.close_duration,
        };
        self.window.clear();
        self.probe = None;
        self.events.emit(&PoolEvent::CircuitBreakerOpened {
            dispatcher: self.name.clone(),
            timestamp: Instant::now(),
        });
        #[cfg(feature = "tracing")]
        tracing::info!(dispatcher = %self.name, "circuit breaker opened");
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "workdispatch_breaker_transitions_total",
            "dispatcher" => self.name.clone(),
            "to" => "open"
        )
        .increment(1);
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.window.clear();
        self.probe = None;
        self.events.emit(&PoolEvent::CircuitBreakerClosed {
            dispatcher: self.name.clone(),
            timestamp: Instant::now(),
        });
        #[cfg(feature = "tracing")]
        tracing::info!(dispatcher = %self.name, "circuit breaker closed");
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "workdispatch_breaker_transitions_total",
            "dispatcher" => self.name.clone(),
            "to" => "closed"
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(history: usize, threshold: f64, close: Duration) -> Breaker {
        Breaker::new(
            BreakerSettings {
                close_duration: close,
                error_rate_threshold: threshold,
                history_length: history,
            },
            "test".to_string(),
            EventListeners::new(),
        )
    }

    const W1: WorkerId = WorkerId(1);
    const W2: WorkerId = WorkerId(2);

    #[test]
    fn stays_closed_below_threshold() {
        let mut b = breaker(5, 0.6, Duration::from_secs(1));
        let now = Instant::now();
        for failure in [true, false, true, false, false] {
            b.on_outcome(W1, failure, now);
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.permit(W1, now), Gate::Granted);
    }

    #[test]
    fn trips_once_window_is_full_and_rate_crossed() {
        let mut b = breaker(5, 0.6, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..4 {
            b.on_outcome(W1, true, now);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.on_outcome(W1, true, now);
        assert!(matches!(b.state(), BreakerState::Open { .. }));
        assert!(matches!(b.permit(W1, now), Gate::BackOff(_)));
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let mut b = breaker(2, 0.5, Duration::from_millis(100));
        let now = Instant::now();
        b.on_outcome(W1, true, now);
        b.on_outcome(W1, true, now);
        assert!(matches!(b.state(), BreakerState::Open { .. }));

        let later = now + Duration::from_millis(150);
        assert_eq!(b.permit(W1, later), Gate::Granted);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(matches!(b.permit(W2, later), Gate::BackOff(_)));
    }

    #[test]
    fn probe_success_closes_and_resets() {
        let mut b = breaker(2, 0.5, Duration::from_millis(100));
        let now = Instant::now();
        b.on_outcome(W1, true, now);
        b.on_outcome(W1, true, now);
        let later = now + Duration::from_millis(150);
        assert_eq!(b.permit(W1, later), Gate::Granted);

        b.on_outcome(W1, false, later);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.error_rate(), 0.0);
    }

    #[test]
    fn probe_failure_reopens_with_fresh_duration() {
        let mut b = breaker(2, 0.5, Duration::from_millis(100));
        let now = Instant::now();
        b.on_outcome(W1, true, now);
        b.on_outcome(W1, true, now);
        let later = now + Duration::from_millis(150);
        assert_eq!(b.permit(W1, later), Gate::Granted);

        b.on_outcome(W1, true, later);
        match b.state() {
            BreakerState::Open { until } => {
                assert_eq!(until, later + Duration::from_millis(100));
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn stale_outcomes_do_not_resolve_the_probe() {
        let mut b = breaker(2, 0.5, Duration::from_millis(100));
        let now = Instant::now();
        b.on_outcome(W1, true, now);
        b.on_outcome(W1, true, now);
        let later = now + Duration::from_millis(150);
        assert_eq!(b.permit(W1, later), Gate::Granted);

        // W2 finishing a pre-trip call must not close the circuit.
        b.on_outcome(W2, false, later);
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }
}
