//! Worker pool for the dispatch engine.
//!
//! The processor task owns a dynamic set of worker tasks. Each worker is a
//! single-slot executor: it pulls one item from the queue, invokes the
//! backend (any [`tower::Service`]), classifies the reply, retries within
//! the item's budget, and delivers the final outcome.
//!
//! Dispatch is gated by a central circuit breaker living inside the
//! processor task, so the "at most one probe while half-open" invariant
//! follows from per-task serial execution rather than locking.

pub mod breaker;
pub mod config;
pub mod events;
mod processor;
mod worker;

pub use breaker::BreakerSettings;
pub use config::PoolConfig;
pub use events::PoolEvent;
pub use processor::{PoolHandle, PoolSample, Processor};
