//! Error and rejection types shared across the engine.

use std::fmt;

/// Why the queue refused to admit a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RejectReason {
    /// The queue is full, or the projected wait exceeds the configured bound.
    OverCapacity,
    /// The item's deadline had already passed at submission.
    Expired,
    /// The engine is shutting down and no longer accepts work.
    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::OverCapacity => write!(f, "Server is at capacity"),
            RejectReason::Expired => write!(f, "Work item already expired"),
            RejectReason::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}

/// Synchronous rejection returned to a producer on submit.
///
/// The display form is the producer-facing reason string, e.g.
/// `"Server is at capacity"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct WorkRejected(pub RejectReason);

impl WorkRejected {
    /// The admission failure that caused this rejection.
    pub fn reason(&self) -> RejectReason {
        self.0
    }
}

/// Failure envelope delivered to a work item's `reply_to`.
///
/// Admission failures never appear here; they are reported synchronously as
/// [`WorkRejected`]. Everything in this enum happened after the item was
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// No reply was produced before the item's deadline.
    #[error("work timed out before a reply was produced")]
    Timeout,
    /// The backend replied, and the reply classified as a failure.
    #[error("work failed: {0}")]
    Failed(String),
    /// The backend replied with something the classifier did not recognize.
    /// Never retried.
    #[error("unrecognized backend reply: {0}")]
    UnrecognizedReply(String),
    /// The engine terminated before the item reached a final outcome.
    #[error("work abandoned during shutdown")]
    Abandoned,
}
