use std::time::{Duration, Instant};

use work_dispatch_core::DispatchEvent;

/// Events emitted by workers, the processor, and the circuit breaker.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker began executing a work item.
    WorkStarted {
        dispatcher: String,
        timestamp: Instant,
    },
    /// A work item reached a successful final outcome.
    WorkCompleted {
        dispatcher: String,
        timestamp: Instant,
        /// Wall time from first dispatch to the successful reply.
        duration: Duration,
    },
    /// A backend attempt failed. Emitted per failed attempt, so an item
    /// that fails twice and then succeeds contributes two of these.
    WorkFailed {
        dispatcher: String,
        timestamp: Instant,
        reason: String,
    },
    /// A backend attempt produced no reply within its time budget.
    WorkTimedOut {
        dispatcher: String,
        timestamp: Instant,
    },
    /// The worker set was resized.
    PoolResized {
        dispatcher: String,
        timestamp: Instant,
        from: usize,
        to: usize,
    },
    /// The circuit breaker tripped open; dispatch is suspended.
    CircuitBreakerOpened {
        dispatcher: String,
        timestamp: Instant,
    },
    /// The circuit breaker closed after a successful probe.
    CircuitBreakerClosed {
        dispatcher: String,
        timestamp: Instant,
    },
}

impl DispatchEvent for PoolEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PoolEvent::WorkStarted { .. } => "WorkStarted",
            PoolEvent::WorkCompleted { .. } => "WorkCompleted",
            PoolEvent::WorkFailed { .. } => "WorkFailed",
            PoolEvent::WorkTimedOut { .. } => "WorkTimedOut",
            PoolEvent::PoolResized { .. } => "PoolResized",
            PoolEvent::CircuitBreakerOpened { .. } => "CircuitBreakerOpened",
            PoolEvent::CircuitBreakerClosed { .. } => "CircuitBreakerClosed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            PoolEvent::WorkStarted { timestamp, .. }
            | PoolEvent::WorkCompleted { timestamp, .. }
            | PoolEvent::WorkFailed { timestamp, .. }
            | PoolEvent::WorkTimedOut { timestamp, .. }
            | PoolEvent::PoolResized { timestamp, .. }
            | PoolEvent::CircuitBreakerOpened { timestamp, .. }
            | PoolEvent::CircuitBreakerClosed { timestamp, .. } => *timestamp,
        }
    }

    fn dispatcher(&self) -> &str {
        match self {
            PoolEvent::WorkStarted { dispatcher, .. }
            | PoolEvent::WorkCompleted { dispatcher, .. }
            | PoolEvent::WorkFailed { dispatcher, .. }
            | PoolEvent::WorkTimedOut { dispatcher, .. }
            | PoolEvent::PoolResized { dispatcher, .. }
            | PoolEvent::CircuitBreakerOpened { dispatcher, .. }
            | PoolEvent::CircuitBreakerClosed { dispatcher, .. } => dispatcher,
        }
    }
}
