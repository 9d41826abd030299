//! Periodic sampler driving the scaling policy.

use tokio::task::JoinHandle;

use work_dispatch_pool::PoolHandle;
use work_dispatch_queue::QueueHandle;

use crate::policy::{AutoscalePolicy, PolicyInput};

/// Sampler task. Holds only observational handles to the queue and pool;
/// terminates on the first sign of engine shutdown.
pub struct Autoscaler<Req, Res> {
    queue: QueueHandle<Req, Res>,
    pool: PoolHandle,
    policy: AutoscalePolicy,
}

impl<Req, Res> Autoscaler<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Spawns the sampler. The handle is only useful for aborting early;
    /// the task unwinds by itself once the engine shuts down.
    pub fn spawn(
        queue: QueueHandle<Req, Res>,
        pool: PoolHandle,
        policy: AutoscalePolicy,
    ) -> JoinHandle<()> {
        let sampler = Self {
            queue,
            pool,
            policy,
        };
        tokio::spawn(sampler.run())
    }

    async fn run(mut self) {
        let period = self.policy.settings().sampling_period;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the engine gets one
        // full period of observations before any decision.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let queue_sample = match self.queue.sample().await {
                Some(sample) => sample,
                None => return,
            };
            let pool_sample = match self.pool.sample().await {
                Some(sample) => sample,
                None => return,
            };
            if queue_sample.shutting_down || pool_sample.shutting_down {
                #[cfg(feature = "tracing")]
                tracing::debug!("engine shutting down, autoscaler exiting");
                return;
            }

            let input = PolicyInput {
                queue_len: queue_sample.len,
                throughput: queue_sample.throughput,
                pool_size: pool_sample.pool_size,
                error_rate: pool_sample.error_rate,
            };
            if let Some(target) = self.policy.evaluate(input) {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    queue_len = input.queue_len,
                    pool_size = input.pool_size,
                    target,
                    "autoscaler resizing pool"
                );
                self.pool.resize(target);
            }
        }
    }
}
