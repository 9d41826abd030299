//! Queue processor: owns the worker set and gates dispatch.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tower::Service;

use work_dispatch_core::{EventListeners, SharedReplyClassifier};
use work_dispatch_queue::QueueHandle;

use crate::breaker::{Breaker, BreakerState, Gate};
use crate::config::PoolConfig;
use crate::events::PoolEvent;
use crate::worker::{ExitReason, RetireMode, Worker, WorkerId};

pub(crate) enum PoolMsg {
    Permit {
        worker: WorkerId,
        reply: oneshot::Sender<Gate>,
    },
    Report {
        worker: WorkerId,
        failure: bool,
    },
    WorkerExited {
        worker: WorkerId,
        reason: ExitReason,
    },
    Resize {
        target: usize,
    },
    Sample {
        reply: oneshot::Sender<PoolSample>,
    },
    Shutdown {
        graceful: bool,
        timeout: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Point-in-time view of processor state, served to the autoscaler and to
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSample {
    /// Workers currently alive, including ones winding down.
    pub pool_size: usize,
    /// Size the pool is converging to.
    pub target_size: usize,
    /// Failure fraction over the recent outcome window.
    pub error_rate: f64,
    /// Whether the circuit breaker is currently open.
    pub breaker_open: bool,
    /// Whether the processor has begun shutting down.
    pub shutting_down: bool,
}

/// Cloneable handle to a processor task.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PoolMsg>,
}

impl PoolHandle {
    /// Requests a new target pool size. Fire-and-forget; the size settles
    /// within bounded time and is clamped to the configured bounds.
    pub fn resize(&self, target: usize) {
        let _ = self.tx.send(PoolMsg::Resize { target });
    }

    /// Reads a state sample; `None` means the processor task is gone.
    pub async fn sample(&self) -> Option<PoolSample> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(PoolMsg::Sample { reply: tx }).ok()?;
        rx.await.ok()
    }

    /// Shuts the pool down. Graceful mode retires workers in drain mode and
    /// waits up to `timeout` before hard-stopping stragglers; non-graceful
    /// aborts immediately. The returned receiver fires exactly once when the
    /// processor has terminated.
    pub fn shutdown(&self, graceful: bool, timeout: Duration) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(PoolMsg::Shutdown {
            graceful,
            timeout,
            done: tx,
        });
        rx
    }
}

struct WorkerSlot {
    retire: watch::Sender<Option<RetireMode>>,
    handle: JoinHandle<()>,
    retiring: bool,
}

struct ShutdownPhase {
    deadline: Instant,
    done_txs: Vec<oneshot::Sender<()>>,
}

/// Sliding window of recent attempt outcomes; `true` is a failure.
struct OutcomeWindow {
    window: VecDeque<bool>,
    cap: usize,
}

impl OutcomeWindow {
    fn new(cap: usize) -> Self {
        Self {
            window: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, failure: bool) {
        self.window.push_back(failure);
        if self.window.len() > self.cap {
            self.window.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Processor task. Owns the workers; workers never outlive it.
pub struct Processor<Req, S>
where
    S: Service<Req>,
{
    rx: mpsc::UnboundedReceiver<PoolMsg>,
    tx: mpsc::UnboundedSender<PoolMsg>,
    queue: QueueHandle<Req, S::Response>,
    backend: S,
    classifier: SharedReplyClassifier<S::Response, S::Error>,
    events: EventListeners<PoolEvent>,
    config: PoolConfig,
    workers: HashMap<WorkerId, WorkerSlot>,
    spawn_order: Vec<WorkerId>,
    next_id: u64,
    breaker: Option<Breaker>,
    outcomes: OutcomeWindow,
    target_size: usize,
    shutdown: Option<ShutdownPhase>,
}

impl<Req, S> Processor<Req, S>
where
    Req: Clone + Send + 'static,
    S: Service<Req> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send,
{
    /// Spawns the processor task with its starting worker set. The join
    /// handle lets the dispatcher observe processor termination.
    pub fn spawn(
        config: PoolConfig,
        queue: QueueHandle<Req, S::Response>,
        backend: S,
        classifier: SharedReplyClassifier<S::Response, S::Error>,
        events: EventListeners<PoolEvent>,
    ) -> (PoolHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome_cap = config
            .breaker
            .as_ref()
            .map(|b| b.history_length)
            .unwrap_or(config.outcome_window);
        let breaker = config
            .breaker
            .clone()
            .map(|settings| Breaker::new(settings, config.name.clone(), events.clone()));
        let processor = Self {
            rx,
            tx: tx.clone(),
            queue,
            backend,
            classifier,
            events,
            config,
            workers: HashMap::new(),
            spawn_order: Vec::new(),
            next_id: 0,
            breaker,
            outcomes: OutcomeWindow::new(outcome_cap),
            target_size: 0,
            shutdown: None,
        };
        let join = tokio::spawn(processor.run());
        (PoolHandle { tx }, join)
    }

    async fn run(mut self) {
        let initial = self
            .config
            .starting_pool_size
            .clamp(self.config.min_pool_size, self.config.max_pool_size);
        self.resize_to(initial);

        loop {
            match &self.shutdown {
                Some(phase) => {
                    if self.workers.is_empty() {
                        break;
                    }
                    let deadline = phase.deadline;
                    tokio::select! {
                        msg = self.rx.recv() => match msg {
                            Some(msg) => self.handle(msg),
                            None => break,
                        },
                        _ = tokio::time::sleep_until(deadline.into()) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                dispatcher = %self.config.name,
                                remaining = self.workers.len(),
                                "shutdown timeout, hard-stopping workers"
                            );
                            self.abort_all();
                            break;
                        }
                    }
                }
                None => match self.rx.recv().await {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        self.finish();
    }

    fn handle(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::Permit { worker, reply } => {
                // During drain the gate stays open so queued work can leave;
                // the breaker only guards steady-state dispatch.
                let gate = match &mut self.breaker {
                    Some(breaker) if self.shutdown.is_none() => {
                        breaker.permit(worker, Instant::now())
                    }
                    _ => Gate::Granted,
                };
                let _ = reply.send(gate);
            }
            PoolMsg::Report { worker, failure } => {
                self.outcomes.push(failure);
                if let Some(breaker) = &mut self.breaker {
                    breaker.on_outcome(worker, failure, Instant::now());
                }
            }
            PoolMsg::WorkerExited { worker, reason } => self.on_worker_exited(worker, reason),
            PoolMsg::Resize { target } => {
                if self.shutdown.is_none() {
                    let target = target.clamp(self.config.min_pool_size, self.config.max_pool_size);
                    self.resize_to(target);
                }
            }
            PoolMsg::Sample { reply } => {
                let sample = self.sample();
                let _ = reply.send(sample);
            }
            PoolMsg::Shutdown {
                graceful,
                timeout,
                done,
            } => self.begin_shutdown(graceful, timeout, done),
        }
    }

    fn on_worker_exited(&mut self, worker: WorkerId, reason: ExitReason) {
        if self.workers.remove(&worker).is_none() {
            // Late notice from an already hard-stopped worker.
            return;
        }
        self.spawn_order.retain(|id| *id != worker);

        match reason {
            ExitReason::Crashed if self.shutdown.is_none() => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    dispatcher = %self.config.name,
                    worker = worker.0,
                    "worker crashed, replacing"
                );
                if self.workers.len() < self.target_size {
                    self.spawn_worker();
                }
            }
            ExitReason::QueueLost if self.shutdown.is_none() => {
                // The queue is load-bearing; without it the processor has
                // nothing to process.
                #[cfg(feature = "tracing")]
                tracing::warn!(dispatcher = %self.config.name, "queue lost, terminating pool");
                self.abort_all();
                self.shutdown = Some(ShutdownPhase {
                    deadline: Instant::now(),
                    done_txs: Vec::new(),
                });
            }
            _ => {}
        }
    }

    fn resize_to(&mut self, target: usize) {
        let from = self.workers.len();
        let active = self.active_count();
        self.target_size = target;

        if target > active {
            for _ in 0..(target - active) {
                self.spawn_worker();
            }
        } else if target < active {
            let mut surplus = active - target;
            let order: Vec<WorkerId> = self.spawn_order.clone();
            for id in order {
                if surplus == 0 {
                    break;
                }
                if let Some(slot) = self.workers.get_mut(&id) {
                    if !slot.retiring {
                        slot.retiring = true;
                        let _ = slot.retire.send(Some(RetireMode::Finish));
                        surplus -= 1;
                    }
                }
            }
        }

        if from != target {
            self.events.emit(&PoolEvent::PoolResized {
                dispatcher: self.config.name.clone(),
                timestamp: Instant::now(),
                from,
                to: target,
            });
            #[cfg(feature = "tracing")]
            tracing::info!(dispatcher = %self.config.name, from, to = target, "pool resized");
            #[cfg(feature = "metrics")]
            metrics::gauge!("workdispatch_pool_size", "dispatcher" => self.config.name.clone())
                .set(target as f64);
        }
    }

    fn active_count(&self) -> usize {
        self.workers.values().filter(|slot| !slot.retiring).count()
    }

    fn spawn_worker(&mut self) {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        let (retire_tx, retire_rx) = watch::channel(None);
        let worker = Worker {
            id,
            queue: self.queue.clone(),
            pool: self.tx.clone(),
            backend: self.backend.clone(),
            classifier: self.classifier.clone(),
            retire: retire_rx,
            events: self.events.clone(),
            name: self.config.name.clone(),
            max_processing_time: self.config.max_processing_time,
            breaker_enabled: self.breaker.is_some(),
        };
        let handle = tokio::spawn(worker.run());
        self.workers.insert(
            id,
            WorkerSlot {
                retire: retire_tx,
                handle,
                retiring: false,
            },
        );
        self.spawn_order.push(id);
    }

    fn begin_shutdown(&mut self, graceful: bool, timeout: Duration, done: oneshot::Sender<()>) {
        if let Some(phase) = &mut self.shutdown {
            phase.done_txs.push(done);
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::info!(dispatcher = %self.config.name, graceful, "pool shutting down");
        if graceful {
            for slot in self.workers.values_mut() {
                slot.retiring = true;
                let _ = slot.retire.send(Some(RetireMode::Drain));
            }
        } else {
            self.abort_all();
        }
        self.shutdown = Some(ShutdownPhase {
            deadline: Instant::now() + timeout,
            done_txs: vec![done],
        });
    }

    fn abort_all(&mut self) {
        for (_, slot) in self.workers.drain() {
            slot.handle.abort();
        }
        self.spawn_order.clear();
    }

    fn sample(&self) -> PoolSample {
        PoolSample {
            pool_size: self.workers.len(),
            target_size: self.target_size,
            error_rate: self.outcomes.error_rate(),
            breaker_open: self
                .breaker
                .as_ref()
                .map(|b| matches!(b.state(), BreakerState::Open { .. }))
                .unwrap_or(false),
            shutting_down: self.shutdown.is_some(),
        }
    }

    fn finish(mut self) {
        if let Some(phase) = self.shutdown.take() {
            for done in phase.done_txs {
                let _ = done.send(());
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(dispatcher = %self.config.name, "pool terminated");
    }
}
