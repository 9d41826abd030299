//! Core types for the work-dispatch engine.
//!
//! This crate provides the vocabulary shared by the queue, worker pool,
//! autoscaler, and dispatcher crates:
//! - Work items and reply plumbing ([`WorkItem`], [`ReplyTo`], [`WorkTicket`])
//! - Admission and execution outcomes ([`EnqueueOutcome`], [`WorkError`])
//! - Reply classification ([`Verdict`], [`SharedReplyClassifier`])
//! - Throughput estimation ([`history::DispatchHistory`])
//! - Event system for observability ([`events::EventListeners`])

pub mod classifier;
pub mod error;
pub mod events;
pub mod history;
pub mod item;

pub use classifier::{default_classifier, SharedReplyClassifier, Verdict};
pub use error::{RejectReason, WorkError, WorkRejected};
pub use events::{DispatchEvent, EventListener, EventListeners, FnListener};
pub use item::{EnqueueOutcome, ReplyTo, WorkItem, WorkReply, WorkTicket};
