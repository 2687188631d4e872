//! Worker runtime: authorized, concurrent job execution.
//!
//! Per job: `received → envelope decoded → authorized → processing →
//! {completed | failed-retrying | failed-terminal}`. Envelope and
//! authorization failures are terminal and `process` never runs for them.

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::envelope::JobEnvelope;
use super::job::{JobError, JobInfo, QueuedJob};
use super::queue::JobQueue;
use super::registry::QueueRegistry;
use crate::authz::{AuthorizationContext, AuthorizationGuard, OrganizationId, PermissionSet};
use crate::error::{Result, WardenError};

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Business logic for one queue, run only under a freshly evaluated context.
///
/// Delivery is at least once: `process` must tolerate seeing a job again.
#[async_trait]
pub trait OrgWorker: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    fn queue_name(&self) -> &str;

    /// Permissions the job's user must hold for the job to run.
    fn required_permissions(&self) -> PermissionSet;

    async fn process(
        &self,
        payload: Self::Payload,
        ctx: &AuthorizationContext,
        job: &JobInfo,
    ) -> std::result::Result<Self::Output, JobError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Options and Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for one registered worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Attempts running longer than this fail as retryable
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            job_timeout: None,
        }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

/// Statistics for one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Attempts started
    pub processed: Arc<AtomicU64>,
    pub completed: Arc<AtomicU64>,
    /// Attempts that failed and were rescheduled
    pub retried: Arc<AtomicU64>,
    /// Jobs that failed terminally
    pub failed: Arc<AtomicU64>,
    /// Currently running attempts
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    queue: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stats: WorkerStats,
}

impl WorkerHandle {
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop fetching jobs and wait for in-flight jobs to finish.
    pub async fn close(&self) {
        self.cancel.cancel();
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                warn!(queue = %self.queue, error = %e, "Worker poll loop ended abnormally");
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!(queue = %self.queue, "Worker closed");
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("queue", &self.queue)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runtime
// ═══════════════════════════════════════════════════════════════════════════════

/// Registers [`OrgWorker`]s against queues from a [`QueueRegistry`].
#[derive(Clone)]
pub struct WorkerRuntime {
    guard: AuthorizationGuard,
    queues: Arc<QueueRegistry>,
}

impl WorkerRuntime {
    pub fn new(guard: AuthorizationGuard, queues: Arc<QueueRegistry>) -> Self {
        Self { guard, queues }
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    /// Start consuming the worker's queue.
    pub fn register_worker<W: OrgWorker>(
        &self,
        worker: Arc<W>,
        options: WorkerOptions,
    ) -> Result<WorkerHandle> {
        if options.concurrency == 0 {
            return Err(WardenError::validation("Worker concurrency must be at least 1"));
        }

        let queue = self.queues.get_queue(worker.queue_name());
        let stats = WorkerStats::new();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let executor = Arc::new(Executor {
            required: worker.required_permissions(),
            worker,
            queue: queue.clone(),
            guard: self.guard.clone(),
            job_timeout: options.job_timeout,
            stats: stats.clone(),
        });

        info!(
            queue = %queue.name(),
            concurrency = options.concurrency,
            "Worker registered"
        );

        let poller = tokio::spawn(poll_loop(
            executor,
            queue.clone(),
            options,
            cancel.clone(),
            tracker.clone(),
        ));

        Ok(WorkerHandle {
            queue: queue.name().to_string(),
            cancel,
            tracker,
            poller: parking_lot::Mutex::new(Some(poller)),
            stats,
        })
    }
}

async fn poll_loop<W: OrgWorker>(
    executor: Arc<Executor<W>>,
    queue: Arc<JobQueue>,
    options: WorkerOptions,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    let notify = queue.notifier();

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match queue.reserve().await {
            Ok(Some(job)) => {
                let executor = executor.clone();
                let span = tracing::info_span!("job", queue = %queue.name(), job_id = %job.id);
                tracker.spawn(
                    async move {
                        executor.run(job).await;
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(options.poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(queue = %queue.name(), error = %e, "Failed to reserve job");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.poll_interval) => {}
                }
            }
        }
    }

    debug!(queue = %queue.name(), "Worker poll loop stopped");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════════════════════

struct Executor<W: OrgWorker> {
    worker: Arc<W>,
    queue: Arc<JobQueue>,
    guard: AuthorizationGuard,
    required: PermissionSet,
    job_timeout: Option<Duration>,
    stats: WorkerStats,
}

enum Outcome {
    Completed(serde_json::Value),
    Failed {
        error: JobError,
        stage: &'static str,
        org_id: Option<OrganizationId>,
    },
}

impl<W: OrgWorker> Executor<W> {
    async fn run(&self, job: QueuedJob) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = self.attempt(&job).await;
        let queue = self.queue.name().to_string();
        histogram!("warden_job_duration_seconds", "queue" => queue.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Outcome::Completed(value) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                counter!("warden_jobs_total", "queue" => queue, "outcome" => "completed").increment(1);
                debug!(job_id = %job.id, attempt = job.attempts_made, "Job completed");
                if let Err(e) = self.queue.complete(&job, value).await {
                    error!(job_id = %job.id, error = %e, "Failed to record job completion");
                }
            }
            Outcome::Failed { error, stage, org_id } => {
                let org = org_id.as_ref().map(|o| o.as_str()).unwrap_or("unknown");
                let retry_delay = error
                    .retryable
                    .then(|| job.options.retry_delay(job.attempts_made))
                    .flatten();

                match retry_delay {
                    Some(delay) => {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        counter!("warden_jobs_total", "queue" => queue.clone(), "outcome" => "retried").increment(1);
                        warn!(
                            job_id = %job.id,
                            queue = %queue,
                            attempt = job.attempts_made,
                            max_attempts = job.options.attempts,
                            org_id = %org,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Job attempt failed, retrying"
                        );
                        if let Err(e) = self.queue.retry(&job, &error, delay).await {
                            error!(job_id = %job.id, error = %e, "Failed to reschedule job");
                        }
                    }
                    None => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        counter!("warden_jobs_total", "queue" => queue.clone(), "outcome" => "failed").increment(1);
                        error!(
                            job_id = %job.id,
                            queue = %queue,
                            attempt = job.attempts_made,
                            max_attempts = job.options.attempts,
                            org_id = %org,
                            stage,
                            error = %error,
                            "Job failed terminally"
                        );
                        if let Err(e) = self.queue.fail(&job, &error).await {
                            error!(job_id = %job.id, error = %e, "Failed to record job failure");
                        }
                    }
                }
            }
        }

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }

    async fn attempt(&self, job: &QueuedJob) -> Outcome {
        let envelope = match JobEnvelope::<W::Payload>::decode(job.payload.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Outcome::Failed {
                    error: JobError::fatal(e.to_string()).with_code("INVALID_ENVELOPE"),
                    stage: "envelope",
                    org_id: None,
                }
            }
        };
        let org_id = Some(envelope.org_id.clone());

        let ctx = match self.guard.evaluate(&envelope.access_request(&self.required)).await {
            Ok(ctx) => ctx,
            Err(e) => {
                return Outcome::Failed {
                    error: JobError::fatal(e.to_string()).with_code(e.reason()),
                    stage: "authorization",
                    org_id,
                }
            }
        };

        let info = JobInfo {
            id: job.id.clone(),
            name: job.name.clone(),
            queue: self.queue.name().to_string(),
            attempt: job.attempts_made,
            max_attempts: job.options.attempts,
        };

        let processing = AssertUnwindSafe(self.worker.process(envelope.payload, &ctx, &info))
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|panic| Err(panicked(panic.as_ref()))));
        let result = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, processing).await {
                Ok(result) => result,
                Err(_) => Err(JobError::retryable(format!(
                    "attempt timed out after {}ms",
                    limit.as_millis()
                ))
                .with_code("JOB_TIMEOUT")),
            },
            None => processing.await,
        };

        match result.and_then(|output| {
            serde_json::to_value(output)
                .map_err(|e| JobError::fatal(format!("job output could not be serialized: {}", e)))
        }) {
            Ok(value) => Outcome::Completed(value),
            Err(error) => Outcome::Failed {
                error,
                stage: "process",
                org_id,
            },
        }
    }
}

/// A panicking `process` counts as a failed attempt and stays retryable.
fn panicked(payload: &(dyn Any + Send)) -> JobError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|m| m.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    JobError::retryable(format!("worker panicked: {}", message)).with_code("JOB_PANICKED")
}
