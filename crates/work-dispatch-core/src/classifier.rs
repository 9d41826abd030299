//! Reply classification.
//!
//! The engine never interprets backend replies itself; a caller-supplied
//! classifier turns the raw `Result` of a backend call into a [`Verdict`]
//! that drives retry and completion.

use std::fmt;
use std::sync::Arc;

/// What a raw backend reply means for the work item that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<Res> {
    /// The reply is a success and is forwarded to the item's `reply_to`.
    Success(Res),
    /// The reply is an application-level failure.
    Failure {
        /// Human-readable failure reason, forwarded in the failure envelope.
        reason: String,
        /// Whether the item may be re-dispatched within its retry budget.
        retryable: bool,
    },
    /// The reply did not match any known shape. Fatal for the item.
    Unrecognized(String),
}

/// Shared classifier from raw backend result to [`Verdict`].
pub type SharedReplyClassifier<Res, Err> =
    Arc<dyn Fn(Result<Res, Err>) -> Verdict<Res> + Send + Sync>;

/// The default classifier: `Ok` is a success, `Err` is a retryable failure
/// carrying the error's display form as the reason.
pub fn default_classifier<Res, Err>() -> SharedReplyClassifier<Res, Err>
where
    Err: fmt::Display,
{
    Arc::new(|result| match result {
        Ok(res) => Verdict::Success(res),
        Err(err) => Verdict::Failure {
            reason: err.to_string(),
            retryable: true,
        },
    })
}
