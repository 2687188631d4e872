//! Job records and options.
//!
//! This module provides the data carried by every queued job:
//!
//! - **JobId**: caller-supplied or generated identifier, the idempotency key
//! - **JobOptions**: attempts, backoff, delay, retention and repeat settings
//! - **JobStatus**: lifecycle state of a stored job
//! - **JobError**: failure reported by a worker, retryable or fatal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::scheduler::RepeatOptions;
use crate::error::WardenError;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of a job instance within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Ready to be reserved
    Waiting,
    /// Waiting for its delay, backoff or repeat tick to elapse
    Delayed,
    /// Owned by exactly one worker
    Active,
    Completed,
    /// Attempts exhausted or failed fatally
    Failed,
}

impl JobStatus {
    /// Not yet started: counted against the pending ceiling.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Delayed => write!(f, "delayed"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

/// Business errors surfaced through `WardenError` are transient unless their
/// code says otherwise; authorization and validation failures never retry.
impl From<WardenError> for JobError {
    fn from(error: WardenError) -> Self {
        let retryable = !(error.is_authorization()
            || error.code().category() == "validation");
        Self {
            message: error.user_message().to_string(),
            retryable,
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Delay between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `delay * 2^(attempt - 1)`
    Exponential {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self::Exponential { delay }
    }

    /// Delay after the given 1-based attempt failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { delay } => {
                let exponent = attempt.saturating_sub(1).min(31);
                delay.saturating_mul(1u32 << exponent)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-job options supplied at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Idempotency key; generated when absent
    #[serde(default)]
    pub job_id: Option<JobId>,

    /// Total attempts including the first
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default)]
    pub backoff: Option<Backoff>,

    /// Delay before the first attempt
    #[serde(default, with = "humantime_serde")]
    pub delay: Option<Duration>,

    #[serde(default)]
    pub remove_on_complete: bool,

    #[serde(default)]
    pub remove_on_fail: bool,

    #[serde(default)]
    pub repeat: Option<RepeatOptions>,
}

fn default_attempts() -> u32 {
    1
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            attempts: default_attempts(),
            backoff: None,
            delay: None,
            remove_on_complete: false,
            remove_on_fail: false,
            repeat: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Clamped to at least one attempt.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = remove;
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Delay before the attempt following `attempt`, if another is allowed.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts {
            return None;
        }
        Some(
            self.backoff
                .map(|b| b.delay_for_attempt(attempt))
                .unwrap_or(Duration::ZERO),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queued Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A job as stored by a queue backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    /// Job name, e.g. `leave-accrual`
    pub name: String,
    /// Serialized envelope
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Attempts started so far
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// Not reservable before this instant
    pub process_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub return_value: Option<serde_json::Value>,
    /// Series this job was materialized from
    pub repeat_key: Option<String>,
}

/// `now + delay`, or `None` when the result is past the last representable
/// instant.
pub fn instant_after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

impl QueuedJob {
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        let process_after = options
            .delay
            .filter(|d| !d.is_zero())
            .map(|d| instant_after(now, d).unwrap_or(DateTime::<Utc>::MAX_UTC));

        Self {
            id,
            name: name.into(),
            payload,
            options,
            status: JobStatus::Waiting,
            attempts_made: 0,
            created_at: now,
            process_after,
            started_at: None,
            finished_at: None,
            last_error: None,
            return_value: None,
            repeat_key: None,
        }
    }

    pub fn with_process_after(mut self, at: DateTime<Utc>) -> Self {
        self.process_after = Some(at);
        self
    }

    pub fn with_repeat_key(mut self, key: impl Into<String>) -> Self {
        self.repeat_key = Some(key.into());
        self
    }

    /// Whether the job must wait before it can be reserved.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.process_after.map_or(false, |at| at > now)
    }
}

/// What a worker learns about the job it is processing.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub queue: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobInfo {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
