//! Bounded work queue for the dispatch engine.
//!
//! The queue is a single task owning a FIFO buffer of pending work. Producers
//! reach it through [`QueueHandle::enqueue`], which applies backpressure and
//! answers synchronously; idle workers reach it through
//! [`QueueHandle::request_next`] and park until an item (or shutdown) arrives.
//!
//! Two implementations share the worker-facing protocol:
//! - [`BufferedQueue`]: push mode, producers submit items.
//! - [`PullQueue`]: pull mode, items are drawn on demand from a caller
//!   supplied [`futures::Stream`]; enqueue is a programming error.

pub mod config;
pub mod events;
mod pull;
mod queue;

pub use config::{BackpressureSettings, QueueConfig};
pub use events::QueueEvent;
pub use pull::PullQueue;
pub use queue::{BufferedQueue, QueueHandle, QueueSample};
