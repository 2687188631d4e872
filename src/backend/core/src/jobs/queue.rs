//! Named job queues with backpressure and dead letter handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use super::envelope::JobEnvelope;
use super::job::{instant_after, JobError, JobId, JobOptions, JobStatus, QueuedJob};
use super::scheduler::next_tick;
use crate::authz::AuthorizationContext;
use crate::error::{ErrorCode, ErrorDetails, Result, WardenError};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for one job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Ceiling on waiting + delayed jobs
    pub max_pending_jobs: usize,
    /// Maximum items in the dead letter buffer
    pub dead_letter_max_size: usize,
    /// Finished jobs kept for inspection before the oldest are dropped
    pub max_retained_jobs: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_jobs: 1000,
            dead_letter_max_size: 1000,
            max_retained_jobs: 1000,
        }
    }
}

impl QueueConfig {
    pub fn with_max_pending_jobs(mut self, max: usize) -> Self {
        self.max_pending_jobs = max;
        self
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    /// Number of completed jobs (total)
    pub completed: u64,
    /// Number of terminally failed jobs (total)
    pub failed: u64,
    pub dead_letter: usize,
}

impl QueueStats {
    /// Jobs counted against the pending ceiling.
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{queue}' is saturated ({pending}/{max} pending jobs)")]
    Saturated {
        queue: String,
        pending: usize,
        max: usize,
    },

    #[error("queue '{0}' is closed")]
    Closed(String),

    #[error("invalid repeat schedule: {0}")]
    InvalidSchedule(String),

    #[error("job delay of {0:?} is out of range")]
    InvalidDelay(Duration),

    #[error("job payload could not be serialized: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] WardenError),
}

impl QueueError {
    /// Backpressure: the caller may try again later.
    pub fn is_saturated(&self) -> bool {
        matches!(self, Self::Saturated { .. })
    }
}

impl From<QueueError> for WardenError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Saturated { queue, pending, max } => WardenError::with_internal(
                ErrorCode::QueueSaturated,
                "Too many pending jobs, try again later",
                format!("queue '{}' has {}/{} pending jobs", queue, pending, max),
            )
            .with_details(
                ErrorDetails::new()
                    .with_entity("queue", queue)
                    .with_retry_after(1),
            ),
            QueueError::Closed(queue) => WardenError::with_internal(
                ErrorCode::QueueClosed,
                "Queue is closed",
                format!("queue '{}' is closed", queue),
            ),
            QueueError::InvalidSchedule(reason) => {
                WardenError::with_internal(ErrorCode::InvalidSchedule, "Invalid repeat schedule", reason)
            }
            QueueError::InvalidDelay(delay) => WardenError::with_internal(
                ErrorCode::InvalidInput,
                "Job delay is out of range",
                format!("delay of {:?} overflows the scheduler clock", delay),
            ),
            QueueError::Payload(e) => WardenError::from(e),
            QueueError::Backend(e) => e,
        }
    }
}

/// Result of an add: either a new job or the existing one with the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added(JobId),
    Duplicate(JobId),
}

impl AddOutcome {
    pub fn id(&self) -> &JobId {
        match self {
            Self::Added(id) | Self::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Backend answer to an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
    Saturated { pending: usize },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dead Letter Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded buffer of terminally failed jobs; the oldest is dropped when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    jobs: VecDeque<QueuedJob>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, job: QueuedJob) {
        if self.max_size == 0 {
            return;
        }
        self.jobs.retain(|j| j.id != job.id);
        if self.jobs.len() >= self.max_size {
            self.jobs.pop_front();
        }
        self.jobs.push_back(job);
    }

    pub fn take(&mut self, id: &JobId) -> Option<QueuedJob> {
        let index = self.jobs.iter().position(|j| &j.id == id)?;
        self.jobs.remove(index)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn snapshot(&self) -> Vec<QueuedJob> {
        self.jobs.iter().cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage for one named queue, delivering each job at least once.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new job unless its id exists or `limit` pending jobs are queued.
    async fn insert(&self, job: QueuedJob, limit: Option<usize>) -> Result<InsertOutcome>;

    /// Atomically hand the next ready job to exactly one caller, marking it
    /// active and counting the attempt.
    async fn reserve(&self) -> Result<Option<QueuedJob>>;

    async fn complete(&self, id: &JobId, return_value: serde_json::Value, remove: bool) -> Result<()>;

    /// Put an active job back, ready after `delay`. Not subject to the ceiling.
    async fn retry(&self, id: &JobId, error: &JobError, delay: Duration) -> Result<()>;

    /// Mark an active job terminally failed, dead-lettering it unless removed.
    async fn fail(&self, id: &JobId, error: &JobError, remove: bool) -> Result<()>;

    /// Drop a job that is not active.
    async fn remove(&self, id: &JobId) -> Result<bool>;

    async fn get(&self, id: &JobId) -> Result<Option<QueuedJob>>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn dead_letters(&self) -> Result<Vec<QueuedJob>>;

    /// Move a dead-lettered job back to waiting with a fresh attempt budget.
    async fn requeue_dead_letter(&self, id: &JobId) -> Result<bool>;
}

#[derive(Debug)]
struct QueueState {
    jobs: HashMap<JobId, QueuedJob>,
    waiting: VecDeque<JobId>,
    /// Ordered by due time, then insertion sequence
    delayed: BTreeMap<(DateTime<Utc>, u64), JobId>,
    active: HashSet<JobId>,
    /// Retained finished jobs, oldest first
    finished: VecDeque<JobId>,
    dead_letter: DeadLetterQueue,
    completed_total: u64,
    failed_total: u64,
    seq: u64,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.waiting.len() + self.delayed.len()
    }

    fn enqueue(&mut self, mut job: QueuedJob, now: DateTime<Utc>) {
        let id = job.id.clone();
        match job.process_after.filter(|at| *at > now) {
            Some(at) => {
                job.status = JobStatus::Delayed;
                self.seq += 1;
                self.delayed.insert((at, self.seq), id.clone());
            }
            None => {
                job.status = JobStatus::Waiting;
                self.waiting.push_back(id.clone());
            }
        }
        self.jobs.insert(id, job);
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.status = JobStatus::Waiting;
            }
            self.waiting.push_back(id);
        }
    }

    fn unlink(&mut self, id: &JobId) {
        self.waiting.retain(|j| j != id);
        self.delayed.retain(|_, j| j != id);
        self.finished.retain(|j| j != id);
    }

    fn retain_finished(&mut self, id: JobId, max: usize) {
        self.finished.push_back(id);
        while self.finished.len() > max {
            if let Some(oldest) = self.finished.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }
}

/// In-memory queue backend guarded by a single mutex.
pub struct InMemoryQueueBackend {
    state: Mutex<QueueState>,
    max_retained_jobs: usize,
}

impl InMemoryQueueBackend {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                waiting: VecDeque::new(),
                delayed: BTreeMap::new(),
                active: HashSet::new(),
                finished: VecDeque::new(),
                dead_letter: DeadLetterQueue::new(config.dead_letter_max_size),
                completed_total: 0,
                failed_total: 0,
                seq: 0,
            }),
            max_retained_jobs: config.max_retained_jobs,
        }
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn insert(&self, job: QueuedJob, limit: Option<usize>) -> Result<InsertOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.promote_due(now);
        if let Some(limit) = limit {
            let pending = state.pending();
            if pending >= limit {
                return Ok(InsertOutcome::Saturated { pending });
            }
        }
        state.enqueue(job, now);
        Ok(InsertOutcome::Inserted)
    }

    async fn reserve(&self) -> Result<Option<QueuedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.promote_due(now);

        while let Some(id) = state.waiting.pop_front() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.status = JobStatus::Active;
            job.attempts_made += 1;
            job.started_at = Some(now);
            let reserved = job.clone();
            state.active.insert(id);
            return Ok(Some(reserved));
        }
        Ok(None)
    }

    async fn complete(&self, id: &JobId, return_value: serde_json::Value, remove: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.active.remove(id);
        state.completed_total += 1;
        if remove {
            state.jobs.remove(id);
            return Ok(());
        }
        if let Some(job) = state.jobs.get_mut(id) {
            job.status = JobStatus::Completed;
            job.finished_at = Some(Utc::now());
            job.return_value = Some(return_value);
        }
        state.retain_finished(id.clone(), self.max_retained_jobs);
        Ok(())
    }

    async fn retry(&self, id: &JobId, error: &JobError, delay: Duration) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.active.remove(id);
        let Some(mut job) = state.jobs.remove(id) else {
            return Err(WardenError::job_not_found("retry", id));
        };
        job.last_error = Some(error.to_string());
        // Overflowing backoff parks the job at the last representable instant.
        job.process_after = (!delay.is_zero())
            .then(|| instant_after(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
        state.enqueue(job, now);
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: &JobError, remove: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.active.remove(id);
        state.failed_total += 1;
        if remove {
            state.jobs.remove(id);
            return Ok(());
        }
        let failed = state.jobs.get_mut(id).map(|job| {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            job.last_error = Some(error.to_string());
            job.clone()
        });
        if let Some(job) = failed {
            state.dead_letter.push(job);
        }
        state.retain_finished(id.clone(), self.max_retained_jobs);
        Ok(())
    }

    async fn remove(&self, id: &JobId) -> Result<bool> {
        let mut state = self.state.lock();
        if state.active.contains(id) {
            return Ok(false);
        }
        state.unlink(id);
        state.dead_letter.take(id);
        Ok(state.jobs.remove(id).is_some())
    }

    async fn get(&self, id: &JobId) -> Result<Option<QueuedJob>> {
        Ok(self.state.lock().jobs.get(id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut state = self.state.lock();
        state.promote_due(Utc::now());
        Ok(QueueStats {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
            completed: state.completed_total,
            failed: state.failed_total,
            dead_letter: state.dead_letter.len(),
        })
    }

    async fn dead_letters(&self) -> Result<Vec<QueuedJob>> {
        Ok(self.state.lock().dead_letter.snapshot())
    }

    async fn requeue_dead_letter(&self, id: &JobId) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(mut job) = state.dead_letter.take(id) else {
            return Ok(false);
        };
        state.unlink(id);
        job.attempts_made = 0;
        job.process_after = None;
        job.finished_at = None;
        state.enqueue(job, now);
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// A named queue. Obtain shared instances from a [`QueueRegistry`].
///
/// [`QueueRegistry`]: super::registry::QueueRegistry
pub struct JobQueue {
    name: String,
    config: QueueConfig,
    backend: Arc<dyn QueueBackend>,
    notify: Arc<Notify>,
    closed: AtomicBool,
    /// Live repeat series and their latest instance
    repeats: DashMap<String, JobId>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        let backend = Arc::new(InMemoryQueueBackend::new(&config));
        Self::with_backend(name, config, backend)
    }

    pub fn with_backend(
        name: impl Into<String>,
        config: QueueConfig,
        backend: Arc<dyn QueueBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            backend,
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            repeats: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producers
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue a job.
    ///
    /// Fails with [`QueueError::Saturated`] when `max_pending_jobs` jobs are
    /// already waiting or delayed. A job id that is already stored yields
    /// [`AddOutcome::Duplicate`] without creating a second job.
    #[instrument(skip(self, payload, options), fields(queue = %self.name))]
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        name: &str,
        payload: &T,
        options: JobOptions,
    ) -> std::result::Result<AddOutcome, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.name.clone()));
        }
        if let Some(delay) = options.delay {
            if instant_after(Utc::now(), delay).is_none() {
                return Err(QueueError::InvalidDelay(delay));
            }
        }
        let payload = serde_json::to_value(payload)?;

        match &options.repeat {
            Some(repeat) => {
                repeat.validate()?;
                let key = repeat_key(name, &options);
                if let Some(live) = self.repeats.get(&key) {
                    debug!(repeat_key = %key, job_id = %live.value(), "Repeat series already scheduled");
                    return Ok(AddOutcome::Duplicate(live.value().clone()));
                }
                let tick = repeat.next_after(Utc::now())?;
                let job = repeat_instance(&key, tick, name, payload, options.clone());
                self.insert_repeat(key, job).await
            }
            None => {
                let id = options.job_id.clone().unwrap_or_default();
                self.insert(QueuedJob::new(id, name, payload, options)).await
            }
        }
    }

    /// Insert the first instance of a series, registering the key only once
    /// the instance is stored. A concurrent add of the same series wins and
    /// ours is withdrawn.
    async fn insert_repeat(
        &self,
        key: String,
        job: QueuedJob,
    ) -> std::result::Result<AddOutcome, QueueError> {
        let id = match self.insert(job).await? {
            AddOutcome::Added(id) => id,
            duplicate => return Ok(duplicate),
        };

        let winner = self.repeats.entry(key).or_insert_with(|| id.clone()).value().clone();
        if winner != id {
            self.backend.remove(&id).await?;
            return Ok(AddOutcome::Duplicate(winner));
        }
        Ok(AddOutcome::Added(id))
    }

    /// Enqueue a job carrying the caller's authorization context in its envelope.
    pub async fn add_authorized<T: Serialize>(
        &self,
        ctx: &AuthorizationContext,
        name: &str,
        payload: T,
        options: JobOptions,
    ) -> std::result::Result<AddOutcome, QueueError> {
        let envelope = JobEnvelope::from_context(ctx, payload);
        self.add(name, &envelope, options).await
    }

    async fn insert(&self, job: QueuedJob) -> std::result::Result<AddOutcome, QueueError> {
        let id = job.id.clone();
        let job_name = job.name.clone();
        match self
            .backend
            .insert(job, Some(self.config.max_pending_jobs))
            .await?
        {
            InsertOutcome::Inserted => {
                counter!("warden_jobs_added_total", "queue" => self.name.clone()).increment(1);
                debug!(job_id = %id, job_name = %job_name, "Job added");
                self.notify.notify_one();
                Ok(AddOutcome::Added(id))
            }
            InsertOutcome::Duplicate => {
                debug!(job_id = %id, "Job id already queued");
                Ok(AddOutcome::Duplicate(id))
            }
            InsertOutcome::Saturated { pending } => {
                counter!("warden_queue_saturated_total", "queue" => self.name.clone()).increment(1);
                warn!(pending, max = self.config.max_pending_jobs, "Queue saturated");
                Err(QueueError::Saturated {
                    queue: self.name.clone(),
                    pending,
                    max: self.config.max_pending_jobs,
                })
            }
        }
    }

    /// Stop a repeat series: no further ticks are materialized and the
    /// pending instance is dropped.
    pub async fn remove_repeatable(&self, key: &str) -> Result<bool> {
        match self.repeats.remove(key) {
            Some((_, id)) => {
                self.backend.remove(&id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Keys of live repeat series.
    pub fn repeat_keys(&self) -> Vec<String> {
        self.repeats.iter().map(|e| e.key().clone()).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consumers
    // ─────────────────────────────────────────────────────────────────────────

    /// Take the next ready job. Returns `None` once the queue is closed.
    ///
    /// Reserving a repeat instance materializes the series' next tick.
    pub async fn reserve(&self) -> Result<Option<QueuedJob>> {
        if self.is_closed() {
            return Ok(None);
        }
        let job = self.backend.reserve().await?;
        if let Some(job) = &job {
            if job.attempts_made == 1 {
                self.materialize_next(job).await;
            }
        }
        Ok(job)
    }

    async fn materialize_next(&self, job: &QueuedJob) {
        let (Some(key), Some(repeat)) = (&job.repeat_key, &job.options.repeat) else {
            return;
        };
        if !self.repeats.contains_key(key) {
            return;
        }
        let current = job.process_after.unwrap_or(job.created_at);
        let tick = match next_tick(repeat, current, Utc::now()) {
            Ok(tick) => tick,
            Err(e) => {
                warn!(repeat_key = %key, error = %e, "Repeat series stopped");
                self.repeats.remove(key);
                return;
            }
        };

        let next = repeat_instance(key, tick, &job.name, job.payload.clone(), job.options.clone());
        let next_id = next.id.clone();
        // Repeat ticks are scheduled work, not new demand: no ceiling.
        match self.backend.insert(next, None).await {
            Ok(_) => {
                self.repeats.insert(key.clone(), next_id);
            }
            Err(e) => warn!(repeat_key = %key, error = %e, "Failed to schedule repeat tick"),
        }
    }

    pub(crate) async fn complete(&self, job: &QueuedJob, return_value: serde_json::Value) -> Result<()> {
        self.backend
            .complete(&job.id, return_value, job.options.remove_on_complete)
            .await?;
        counter!("warden_jobs_completed_total", "queue" => self.name.clone()).increment(1);
        Ok(())
    }

    pub(crate) async fn retry(&self, job: &QueuedJob, error: &JobError, delay: Duration) -> Result<()> {
        self.backend.retry(&job.id, error, delay).await?;
        counter!("warden_jobs_retried_total", "queue" => self.name.clone()).increment(1);
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) async fn fail(&self, job: &QueuedJob, error: &JobError) -> Result<()> {
        self.backend
            .fail(&job.id, error, job.options.remove_on_fail)
            .await?;
        counter!("warden_jobs_failed_total", "queue" => self.name.clone()).increment(1);
        Ok(())
    }

    /// Resolves when a job may have become available.
    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_job(&self, id: &JobId) -> Result<Option<QueuedJob>> {
        self.backend.get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let stats = self.backend.stats().await?;
        gauge!("warden_queue_pending", "queue" => self.name.clone()).set(stats.pending() as f64);
        gauge!("warden_queue_active", "queue" => self.name.clone()).set(stats.active as f64);
        Ok(stats)
    }

    pub async fn dead_letters(&self) -> Result<Vec<QueuedJob>> {
        self.backend.dead_letters().await
    }

    pub async fn retry_dead_letter(&self, id: &JobId) -> Result<()> {
        if !self.backend.requeue_dead_letter(id).await? {
            return Err(WardenError::job_not_found(&self.name, id));
        }
        info!(queue = %self.name, job_id = %id, "Dead-lettered job requeued");
        self.notify.notify_one();
        Ok(())
    }

    /// Reject further adds and stop handing out jobs. Stored jobs are kept.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.repeats.clear();
            self.notify.notify_waiters();
            info!(queue = %self.name, "Queue closed");
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn repeat_key(name: &str, options: &JobOptions) -> String {
    match (&options.job_id, &options.repeat) {
        (Some(id), _) => format!("{}:{}", name, id),
        (None, Some(repeat)) => format!("{}:{}", name, repeat.describe()),
        (None, None) => name.to_string(),
    }
}

fn repeat_instance(
    key: &str,
    tick: DateTime<Utc>,
    name: &str,
    payload: serde_json::Value,
    options: JobOptions,
) -> QueuedJob {
    let id = JobId::from(format!("repeat:{}:{}", key, tick.timestamp_millis()));
    QueuedJob::new(id, name, payload, options)
        .with_process_after(tick)
        .with_repeat_key(key)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::scheduler::RepeatOptions;
    use serde_json::json;

    fn queue(max_pending: usize) -> JobQueue {
        JobQueue::new(
            "test",
            QueueConfig::default().with_max_pending_jobs(max_pending),
        )
    }

    #[tokio::test]
    async fn test_fifo_reserve() {
        let queue = queue(10);
        queue.add("a", &json!(1), JobOptions::new()).await.unwrap();
        queue.add("b", &json!(2), JobOptions::new()).await.unwrap();

        assert_eq!(queue.reserve().await.unwrap().unwrap().name, "a");
        assert_eq!(queue.reserve().await.unwrap().unwrap().name, "b");
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive() {
        let queue = queue(10);
        queue.add("a", &json!(1), JobOptions::new()).await.unwrap();

        let job = queue.reserve().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts_made, 1);
        assert!(queue.reserve().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_saturation_counts_only_pending() {
        let queue = queue(1);
        queue.add("a", &json!(1), JobOptions::new()).await.unwrap();
        let err = queue.add("b", &json!(2), JobOptions::new()).await.unwrap_err();
        assert!(err.is_saturated());

        let warden: WardenError = err.into();
        assert_eq!(warden.code(), ErrorCode::QueueSaturated);
        assert!(warden.is_retryable());

        queue.reserve().await.unwrap();
        assert!(queue.add("b", &json!(2), JobOptions::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_id() {
        let queue = queue(10);
        let options = JobOptions::new().with_job_id("accrual-2024-01");
        let first = queue.add("a", &json!(1), options.clone()).await.unwrap();
        let second = queue.add("a", &json!(2), options).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.id(), second.id());
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_delayed_job_becomes_ready() {
        let queue = queue(10);
        queue
            .add("a", &json!(1), JobOptions::new().with_delay(Duration::from_millis(30)))
            .await
            .unwrap();

        assert_eq!(queue.stats().await.unwrap().delayed, 1);
        assert!(queue.reserve().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.reserve().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_bypasses_ceiling() {
        let queue = queue(1);
        queue.add("a", &json!(1), JobOptions::new().with_attempts(2)).await.unwrap();
        let job = queue.reserve().await.unwrap().unwrap();
        queue.add("b", &json!(2), JobOptions::new()).await.unwrap();

        queue
            .retry(&job, &JobError::retryable("boom"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(queue.stats().await.unwrap().waiting, 2);

        let stored = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_complete_and_remove_on_complete() {
        let queue = queue(10);
        let kept = queue.add("a", &json!(1), JobOptions::new()).await.unwrap();
        let removed = queue
            .add("b", &json!(2), JobOptions::new().remove_on_complete(true))
            .await
            .unwrap();

        for _ in 0..2 {
            let job = queue.reserve().await.unwrap().unwrap();
            queue.complete(&job, json!({"ok": true})).await.unwrap();
        }

        let stored = queue.get_job(kept.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.return_value, Some(json!({"ok": true})));
        assert!(queue.get_job(removed.id()).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_and_requeue() {
        let queue = queue(10);
        let added = queue.add("a", &json!(1), JobOptions::new()).await.unwrap();
        let job = queue.reserve().await.unwrap().unwrap();
        queue.fail(&job, &JobError::fatal("bad data")).await.unwrap();

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, JobStatus::Failed);

        queue.retry_dead_letter(added.id()).await.unwrap();
        let again = queue.reserve().await.unwrap().unwrap();
        assert_eq!(again.attempts_made, 1);
        assert!(queue.dead_letters().await.unwrap().is_empty());

        assert!(queue.retry_dead_letter(&JobId::from("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_retained_jobs_are_bounded() {
        let queue = JobQueue::new(
            "test",
            QueueConfig {
                max_retained_jobs: 2,
                ..Default::default()
            },
        );
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(queue.add("a", &json!(i), JobOptions::new()).await.unwrap());
            let job = queue.reserve().await.unwrap().unwrap();
            queue.complete(&job, json!(null)).await.unwrap();
        }
        assert!(queue.get_job(ids[0].id()).await.unwrap().is_none());
        assert!(queue.get_job(ids[2].id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let queue = queue(10);
        queue.add("a", &json!(1), JobOptions::new()).await.unwrap();
        queue.close();

        assert!(matches!(
            queue.add("b", &json!(2), JobOptions::new()).await,
            Err(QueueError::Closed(_))
        ));
        assert!(queue.reserve().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_repeat_materializes_next_tick() {
        let queue = queue(10);
        let options = JobOptions::new().with_repeat(RepeatOptions::every(Duration::from_millis(20)));
        let first = queue.add("digest", &json!({}), options).await.unwrap();
        assert!(first.id().as_str().starts_with("repeat:digest:every:20:"));
        assert_eq!(queue.stats().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let job = queue.reserve().await.unwrap().unwrap();
        assert_eq!(&job.id, first.id());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending(), 1);
        assert_eq!(queue.repeat_keys(), vec!["digest:every:20".to_string()]);

        assert!(queue.remove_repeatable("digest:every:20").await.unwrap());
        assert_eq!(queue.stats().await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_repeat_series_added_once() {
        let queue = queue(10);
        let options = JobOptions::new().with_repeat(RepeatOptions::every(Duration::from_secs(60)));
        let first = queue.add("digest", &json!({}), options.clone()).await.unwrap();
        let second = queue.add("digest", &json!({}), options).await.unwrap();

        assert!(second.is_duplicate());
        assert_eq!(first.id(), second.id());
        assert_eq!(queue.stats().await.unwrap().pending(), 1);

        assert!(queue.remove_repeatable("digest:every:60000").await.unwrap());
        assert_eq!(queue.stats().await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_saturated_repeat_add_leaves_no_series() {
        let queue = queue(1);
        queue.add("a", &json!(1), JobOptions::new()).await.unwrap();

        let options = JobOptions::new().with_repeat(RepeatOptions::every(Duration::from_secs(60)));
        let err = queue.add("digest", &json!({}), options).await.unwrap_err();
        assert!(err.is_saturated());
        assert!(queue.repeat_keys().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_delay_rejected() {
        let queue = queue(10);
        let err = queue
            .add(
                "a",
                &json!(1),
                JobOptions::new().with_delay(Duration::from_secs(10_000_000_000_000)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidDelay(_)));
        assert_eq!(WardenError::from(err).code(), ErrorCode::InvalidInput);
        assert_eq!(queue.stats().await.unwrap().pending(), 0);

        let err = queue
            .add("a", &json!(1), JobOptions::new().with_delay(Duration::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidDelay(_)));
    }

    #[tokio::test]
    async fn test_overflowing_retry_delay_parks_job() {
        let queue = queue(10);
        queue.add("a", &json!(1), JobOptions::new().with_attempts(2)).await.unwrap();
        let job = queue.reserve().await.unwrap().unwrap();

        queue
            .retry(&job, &JobError::retryable("boom"), Duration::MAX)
            .await
            .unwrap();

        let stored = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);
        assert_eq!(stored.process_after, Some(DateTime::<Utc>::MAX_UTC));
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_repeat_rejected() {
        let queue = queue(10);
        let err = queue
            .add("x", &json!({}), JobOptions::new().with_repeat(RepeatOptions::cron("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidSchedule(_)));
    }
}
