//! Capacity-controlled work dispatch.
//!
//! A dispatch engine that sits between message producers and a pool of
//! worker-driven backends: it absorbs bursts into a bounded queue, smooths
//! them into a capacity-controlled stream, and protects the backend from
//! overload while keeping producers informed about rejection and completion.
//!
//! The engine is an assembly of single-owner tasks communicating over typed
//! channels:
//! - a bounded FIFO **queue** with expected-wait-time backpressure
//! - a **worker pool** whose dispatch is gated by a central circuit breaker
//! - an **autoscaler** sizing the pool from observed throughput
//! - a **dispatcher** front-end, in push or pull mode
//!
//! The backend is any [`tower::Service`]; adapters are built at the call
//! site with [`tower::service_fn`].
//!
//! ## Push mode
//!
//! ```rust
//! use std::time::Duration;
//! use work_dispatch::{BackPressureSettings, DispatchSettings, PushDispatcher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = tower::service_fn(|req: String| async move {
//!     Ok::<_, String>(req.to_uppercase())
//! });
//!
//! let settings = DispatchSettings::builder()
//!     .name("uppercase")
//!     .work_timeout(Duration::from_secs(5))
//!     .work_retry(2)
//!     .worker_pool(4, 1, 16)
//!     .back_pressure(BackPressureSettings::default())
//!     .build();
//!
//! let dispatcher = PushDispatcher::builder(backend)
//!     .settings(settings)
//!     .build()?;
//!
//! let ticket = dispatcher.submit("hello".to_string()).await?;
//! assert_eq!(ticket.await, Ok("HELLO".to_string()));
//!
//! dispatcher.shutdown_gracefully(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pull mode
//!
//! ```rust
//! use work_dispatch::PullDispatcher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = tower::service_fn(|n: u32| async move { Ok::<_, String>(n * 2) });
//! let (results_tx, mut results_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let dispatcher = PullDispatcher::builder(backend, futures::stream::iter(0..100))
//!     .send_results_to(results_tx)
//!     .build()?;
//!
//! // The engine drains the stream and shuts itself down.
//! dispatcher.completed().await;
//! while let Ok(reply) = results_rx.try_recv() {
//!     let _doubled = reply?;
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod pull;

pub use config::{
    AutoScalingSettings, BackPressureSettings, CircuitBreakerSettings, ConfigError,
    DispatchHistorySettings, DispatchSettings, DispatchSettingsBuilder, WorkerPoolSettings,
};
pub use dispatcher::{PushDispatcher, PushDispatcherBuilder};
pub use pull::{PullDispatcher, PullDispatcherBuilder};

pub use work_dispatch_core::{
    default_classifier, DispatchEvent, EventListener, EventListeners, FnListener, RejectReason,
    SharedReplyClassifier, Verdict, WorkError, WorkRejected, WorkReply, WorkTicket,
};
pub use work_dispatch_pool::{PoolEvent, PoolSample};
pub use work_dispatch_queue::{QueueEvent, QueueSample};
