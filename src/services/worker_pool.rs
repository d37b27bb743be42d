//! Bounded-concurrency queue consumer.
//!
//! [`WorkerPool`] runs `concurrency` consumer tasks that reserve messages,
//! wait on a pool-wide rate limiter and dispatch through the
//! [`HandlerRegistry`]. A separate task sweeps expired leases. Lifecycle
//! events are published on a broadcast channel for the restart supervisor.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::models::job::JobResult;
use crate::services::batch::{JobContext, JobError, RunOutcome};
use crate::services::handlers::HandlerRegistry;
use crate::services::queue::{Delivery, FailOutcome, JobQueue};
use crate::services::store::JobStore;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// Pool-wide dispatches per second.
    pub rate_per_second: u32,
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub stalled_interval: Duration,
    pub max_stalled: u32,
    pub drain_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            rate_per_second: 10,
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            stalled_interval: Duration::from_secs(30),
            max_stalled: 1,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Active { job_id: Uuid },
    Completed { job_id: Uuid },
    Failed { job_id: Uuid, error: String, will_retry: bool },
    Stalled { job_id: Uuid },
    /// A consumer of a freshly started generation reached the broker.
    Connected,
    /// A consumer lost its broker connection; the pool stopped consuming.
    Closed { reason: String },
    /// The restart bound was exceeded.
    Fatal { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub active_workers: usize,
    pub busy_workers: usize,
    pub is_running: bool,
    pub restarts: u32,
    pub fatal: bool,
}

/// Cancellation tokens of jobs running in this process.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job_id: Uuid, token: CancellationToken) {
        self.tokens.lock().await.insert(job_id, token);
    }

    pub async fn remove(&self, job_id: Uuid) {
        self.tokens.lock().await.remove(&job_id);
    }

    /// Trip the token of a running job. False if the job is not running here.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens.lock().await.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct Shared {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    cancellations: Arc<CancellationRegistry>,
    config: WorkerPoolConfig,
    limiter: DirectRateLimiter,
    events: broadcast::Sender<WorkerEvent>,
    busy: AtomicUsize,
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn consume(self: Arc<Self>, worker: usize, shutdown: CancellationToken, slot: ConsumerSlot) {
        let generation = slot.generation.clone();
        tracing::debug!(worker, "Consumer started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let reserved = tokio::select! {
                _ = shutdown.cancelled() => break,
                reserved = self.queue.reserve(self.config.lease) => reserved,
            };

            if reserved.is_ok() && !generation.connected.swap(true, Ordering::SeqCst) {
                self.emit(WorkerEvent::Connected);
            }

            match reserved {
                Ok(Some(delivery)) => {
                    tokio::select! {
                        _ = self.limiter.until_ready() => {}
                        _ = shutdown.cancelled() => {
                            if let Err(e) = self.queue.release(&delivery).await {
                                tracing::warn!(job_id = %delivery.message.job_id, error = %e, "Release failed");
                            }
                            break;
                        }
                    }
                    self.handle(delivery, &shutdown).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) if e.is_connection_lost() => {
                    tracing::error!(worker, error = %e, "Broker connection lost");
                    if !generation.closed.swap(true, Ordering::SeqCst) {
                        self.emit(WorkerEvent::Closed {
                            reason: e.to_string(),
                        });
                    }
                    break;
                }
                Err(e) => {
                    tracing::error!(worker, error = %e, "Reserve failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "Consumer stopped");
    }

    async fn handle(self: &Arc<Self>, delivery: Delivery, shutdown: &CancellationToken) {
        let job_id = delivery.message.job_id;
        let job_type = delivery.message.job_type;
        let heartbeat_stop = CancellationToken::new();
        let in_flight = InFlight::begin(self.clone(), delivery.clone(), heartbeat_stop.clone().drop_guard());
        self.emit(WorkerEvent::Active { job_id });
        tracing::info!(
            job_id = %job_id,
            job_type = %job_type,
            attempt = delivery.attempts_made,
            "Processing job"
        );

        let ctx = JobContext::new(job_id, job_type, shutdown);
        self.cancellations.register(job_id, ctx.cancel.clone()).await;

        let heartbeat = tokio::spawn(heartbeat(
            self.queue.clone(),
            job_id,
            self.config.lease,
            self.config.heartbeat_interval,
            heartbeat_stop.clone(),
        ));

        let outcome = self.registry.dispatch(&ctx).await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        self.cancellations.remove(job_id).await;

        match outcome {
            Ok(RunOutcome::Interrupted { cursor }) => {
                tracing::info!(job_id = %job_id, cursor, "Handing job back to the queue");
                if let Err(e) = self.queue.release(&delivery).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Release failed, lease will expire");
                }
            }
            Ok(outcome) => {
                if let Err(e) = self.queue.complete(&delivery).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Acknowledge failed");
                }
                match outcome {
                    RunOutcome::Failed { error } => self.emit(WorkerEvent::Failed {
                        job_id,
                        error,
                        will_retry: false,
                    }),
                    _ => self.emit(WorkerEvent::Completed { job_id }),
                }
            }
            Err(e) => self.handle_error(&delivery, e).await,
        }
        in_flight.settled();
    }

    async fn handle_error(&self, delivery: &Delivery, error: JobError) {
        let job_id = delivery.message.job_id;
        let message = error.to_string();
        let retryable = error.is_retryable();

        let will_retry = match self.queue.fail(delivery, &message, retryable).await {
            Ok(FailOutcome::Retrying { delay }) => {
                tracing::warn!(
                    job_id = %job_id,
                    attempt = delivery.attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Job attempt failed, retrying"
                );
                true
            }
            Ok(FailOutcome::Exhausted) => {
                tracing::error!(job_id = %job_id, error = %message, "Job failed permanently");
                self.record_dead(job_id, &message).await;
                false
            }
            Ok(FailOutcome::Superseded) => false,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not report failure to the queue");
                true
            }
        };

        self.emit(WorkerEvent::Failed {
            job_id,
            error: message,
            will_retry,
        });
    }

    /// The broker gave up on a job: make sure its record is terminal too.
    async fn record_dead(&self, job_id: Uuid, error: &str) {
        match self.store.get_job(job_id).await {
            Ok(Some(job)) if !job.status.is_terminal() => {
                if let Err(e) = self
                    .store
                    .save_job_result(job_id, &JobResult::failure(error))
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Could not mark dead job failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Could not load dead job"),
        }
    }

    async fn sweep_stalled(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.stalled_interval) => {}
            }

            let sweep = match self.queue.recover_stalled(self.config.max_stalled).await {
                Ok(sweep) => sweep,
                Err(e) => {
                    tracing::warn!(error = %e, "Stalled job sweep failed");
                    continue;
                }
            };
            for job_id in sweep.recovered {
                tracing::warn!(job_id = %job_id, "Stalled job requeued");
                self.emit(WorkerEvent::Stalled { job_id });
            }
            for job_id in sweep.failed {
                tracing::error!(job_id = %job_id, "Job stalled too often, giving up");
                self.emit(WorkerEvent::Stalled { job_id });
                self.record_dead(job_id, "job stalled more than allowable limit").await;
            }

            if let Ok(counts) = self.queue.counts().await {
                metrics::gauge!("queue_depth").set((counts.waiting + counts.delayed) as f64);
            }
        }
    }
}

async fn heartbeat(
    queue: Arc<dyn JobQueue>,
    job_id: Uuid,
    lease: Duration,
    every: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        if let Err(e) = queue.heartbeat(job_id, lease).await {
            tracing::warn!(job_id = %job_id, error = %e, "Lease heartbeat failed");
        }
    }
}

/// One delivery being worked on. Dropping it before [`InFlight::settled`],
/// as happens when a drain aborts the consumer, stops the heartbeat and hands
/// the message back to the queue.
struct InFlight {
    shared: Arc<Shared>,
    delivery: Option<Delivery>,
    _heartbeat: DropGuard,
}

impl InFlight {
    fn begin(shared: Arc<Shared>, delivery: Delivery, heartbeat: DropGuard) -> Self {
        let busy = shared.busy.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("worker_pool_busy").set(busy as f64);
        Self {
            shared,
            delivery: Some(delivery),
            _heartbeat: heartbeat,
        }
    }

    fn settled(mut self) {
        self.delivery = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let busy = self.shared.busy.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::gauge!("worker_pool_busy").set(busy as f64);

        let Some(delivery) = self.delivery.take() else {
            return;
        };
        let job_id = delivery.message.job_id;
        tracing::warn!(job_id = %job_id, "Job aborted mid-batch, handing it back to the queue");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(job_id = %job_id, "No runtime to release aborted job, lease will expire");
            return;
        };
        let shared = self.shared.clone();
        runtime.spawn(async move {
            shared.cancellations.remove(job_id).await;
            if let Err(e) = shared.queue.release(&delivery).await {
                tracing::warn!(job_id = %job_id, error = %e, "Release failed, lease will expire");
            }
        });
    }
}

/// Flags shared by the consumers of one pool generation.
#[derive(Default)]
struct GenerationState {
    closed: AtomicBool,
    connected: AtomicBool,
    live: AtomicUsize,
}

/// Counts a consumer as live from spawn until its task ends or is aborted.
struct ConsumerSlot {
    generation: Arc<GenerationState>,
}

impl ConsumerSlot {
    fn claim(generation: &Arc<GenerationState>) -> Self {
        generation.live.fetch_add(1, Ordering::SeqCst);
        Self {
            generation: generation.clone(),
        }
    }
}

impl Drop for ConsumerSlot {
    fn drop(&mut self) {
        self.generation.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Generation {
    shutdown: CancellationToken,
    state: Arc<GenerationState>,
    tasks: JoinSet<()>,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    running: Mutex<Option<Generation>>,
    restarts: AtomicU32,
    fatal: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        cancellations: Arc<CancellationRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        let rate = NonZeroU32::new(config.rate_per_second).unwrap_or(NonZeroU32::MIN);
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                queue,
                store,
                registry,
                cancellations,
                limiter: RateLimiter::direct(Quota::per_second(rate)),
                config,
                events,
                busy: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
            restarts: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    pub fn cancellations(&self) -> Arc<CancellationRegistry> {
        self.shared.cancellations.clone()
    }

    /// Start consuming. Returns false if the pool was already started.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Worker pool already started");
            return false;
        }

        let shutdown = CancellationToken::new();
        let state = Arc::new(GenerationState::default());
        let mut tasks = JoinSet::new();
        for worker in 0..self.shared.config.concurrency.max(1) {
            tasks.spawn(self.shared.clone().consume(
                worker,
                shutdown.clone(),
                ConsumerSlot::claim(&state),
            ));
        }
        tasks.spawn(self.shared.clone().sweep_stalled(shutdown.clone()));

        tracing::info!(
            concurrency = self.shared.config.concurrency,
            rate_per_second = self.shared.config.rate_per_second,
            job_types = ?self.shared.registry.job_types(),
            "Worker pool started"
        );
        *running = Some(Generation {
            shutdown,
            state,
            tasks,
        });
        true
    }

    /// Graceful drain. Returns false if the pool was not running.
    pub async fn stop(&self) -> bool {
        let Some(mut generation) = self.running.lock().await.take() else {
            return false;
        };

        tracing::info!("Stopping worker pool");
        generation.shutdown.cancel();
        let drained = tokio::time::timeout(self.shared.config.drain_timeout, async {
            while generation.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                timeout_secs = self.shared.config.drain_timeout.as_secs(),
                "Drain timed out, aborting remaining workers"
            );
            generation.tasks.abort_all();
            while generation.tasks.join_next().await.is_some() {}
        }
        tracing::info!("Worker pool stopped");
        true
    }

    /// Stop and start again. Returns false without starting when the pool
    /// had already been stopped, e.g. through `/workers/stop`.
    pub async fn restart(&self) -> bool {
        if !self.stop().await {
            tracing::info!("Worker pool was stopped, skipping restart");
            return false;
        }
        let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::counter!("worker_pool_restarts_total").increment(1);
        tracing::warn!(restarts, "Restarting worker pool");
        self.start().await
    }

    pub async fn mark_fatal(&self, reason: &str) {
        self.fatal.store(true, Ordering::SeqCst);
        tracing::error!(reason, "Worker pool is fatally stopped");
        self.shared.emit(WorkerEvent::Fatal {
            reason: reason.to_string(),
        });
        self.stop().await;
    }

    pub async fn status(&self) -> WorkerStatus {
        let running = self.running.lock().await;
        let is_running = running
            .as_ref()
            .is_some_and(|g| !g.state.closed.load(Ordering::SeqCst));
        WorkerStatus {
            active_workers: running
                .as_ref()
                .map_or(0, |g| g.state.live.load(Ordering::SeqCst)),
            busy_workers: self.shared.busy.load(Ordering::SeqCst),
            is_running,
            restarts: self.restarts.load(Ordering::SeqCst),
            fatal: self.fatal.load(Ordering::SeqCst),
        }
    }
}
