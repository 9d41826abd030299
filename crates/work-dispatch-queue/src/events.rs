use std::time::{Duration, Instant};

use work_dispatch_core::{DispatchEvent, RejectReason};

/// Events emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A work item was admitted.
    Enqueued {
        dispatcher: String,
        timestamp: Instant,
        /// Buffer depth after admission.
        depth: usize,
    },
    /// A work item was refused at admission.
    EnqueueRejected {
        dispatcher: String,
        timestamp: Instant,
        reason: RejectReason,
    },
    /// A queued item's deadline elapsed before any worker picked it up.
    ItemExpired {
        dispatcher: String,
        timestamp: Instant,
        /// How long the item sat in the buffer.
        waited: Duration,
    },
}

impl DispatchEvent for QueueEvent {
    fn event_type(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "Enqueued",
            QueueEvent::EnqueueRejected { .. } => "EnqueueRejected",
            QueueEvent::ItemExpired { .. } => "ItemExpired",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            QueueEvent::Enqueued { timestamp, .. }
            | QueueEvent::EnqueueRejected { timestamp, .. }
            | QueueEvent::ItemExpired { timestamp, .. } => *timestamp,
        }
    }

    fn dispatcher(&self) -> &str {
        match self {
            QueueEvent::Enqueued { dispatcher, .. }
            | QueueEvent::EnqueueRejected { dispatcher, .. }
            | QueueEvent::ItemExpired { dispatcher, .. } => dispatcher,
        }
    }
}
