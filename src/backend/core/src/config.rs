//! Configuration management.
//!
//! Layered sources: an optional file, then `WARDEN__`-prefixed environment
//! variables (`WARDEN__QUEUES__MAX_PENDING_JOBS=500`). Durations are written
//! as humantime strings (`"250ms"`, `"30s"`).

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::cache::{InMemoryConfig, RateLimitConfig, TenantCacheConfig};
use crate::error::WardenError;
use crate::jobs::{QueueConfig, QueueRegistry, WorkerOptions};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Tenant cache
    #[serde(default)]
    pub cache: CacheSettings,

    /// Queue defaults and per-queue overrides
    #[serde(default)]
    pub queues: QueueSettings,

    /// Worker host process
    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Entries held before LRU eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    #[serde(default = "default_short_lived_ttl", with = "humantime_serde")]
    pub short_lived_ttl: Duration,

    /// Serialized results larger than this are not stored
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: usize,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            default_ttl: default_cache_ttl(),
            short_lived_ttl: default_short_lived_ttl(),
            max_entry_size: default_max_entry_size(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl CacheSettings {
    pub fn backend_config(&self) -> InMemoryConfig {
        InMemoryConfig {
            max_entries: self.max_entries,
            default_ttl: self.default_ttl,
        }
    }

    pub fn tenant_cache_config(&self) -> TenantCacheConfig {
        TenantCacheConfig {
            default_ttl: self.default_ttl,
            short_lived_ttl: self.short_lived_ttl,
            max_entry_size: self.max_entry_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Requests allowed per window
    #[serde(default = "default_rate_limit")]
    pub limit: u64,

    #[serde(default = "default_rate_window", with = "humantime_serde")]
    pub window: Duration,

    /// Distinct keys tracked at once
    #[serde(default = "default_max_entries")]
    pub max_keys: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: default_rate_limit(),
            window: default_rate_window(),
            max_keys: default_max_entries(),
        }
    }
}

impl RateLimitSettings {
    pub fn limiter_config(&self, name: impl Into<String>) -> RateLimitConfig {
        RateLimitConfig {
            name: name.into(),
            limit: self.limit,
            window: self.window,
            max_keys: self.max_keys,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Ceiling on waiting + delayed jobs per queue
    #[serde(default = "default_max_pending_jobs")]
    pub max_pending_jobs: usize,

    #[serde(default = "default_dead_letter_max_size")]
    pub dead_letter_max_size: usize,

    /// Finished jobs kept for inspection
    #[serde(default = "default_max_retained_jobs")]
    pub max_retained_jobs: usize,

    /// Concurrent jobs per worker
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Attempts running longer than this fail as retryable
    #[serde(default, with = "humantime_serde")]
    pub job_timeout: Option<Duration>,

    /// Per-queue overrides keyed by queue name
    #[serde(default)]
    pub overrides: HashMap<String, QueueOverride>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_pending_jobs: default_max_pending_jobs(),
            dead_letter_max_size: default_dead_letter_max_size(),
            max_retained_jobs: default_max_retained_jobs(),
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            job_timeout: None,
            overrides: HashMap::new(),
        }
    }
}

/// Settings for one named queue; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueOverride {
    #[serde(default)]
    pub max_pending_jobs: Option<usize>,
    #[serde(default)]
    pub dead_letter_max_size: Option<usize>,
    #[serde(default)]
    pub max_retained_jobs: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub job_timeout: Option<Duration>,
}

impl QueueSettings {
    pub fn defaults(&self) -> QueueConfig {
        QueueConfig {
            max_pending_jobs: self.max_pending_jobs,
            dead_letter_max_size: self.dead_letter_max_size,
            max_retained_jobs: self.max_retained_jobs,
        }
    }

    pub fn queue_config(&self, name: &str) -> QueueConfig {
        let defaults = self.defaults();
        match self.overrides.get(name) {
            Some(o) => QueueConfig {
                max_pending_jobs: o.max_pending_jobs.unwrap_or(defaults.max_pending_jobs),
                dead_letter_max_size: o
                    .dead_letter_max_size
                    .unwrap_or(defaults.dead_letter_max_size),
                max_retained_jobs: o.max_retained_jobs.unwrap_or(defaults.max_retained_jobs),
            },
            None => defaults,
        }
    }

    pub fn worker_options(&self, name: &str) -> WorkerOptions {
        let o = self.overrides.get(name).cloned().unwrap_or_default();
        WorkerOptions {
            concurrency: o.concurrency.unwrap_or(self.concurrency),
            poll_interval: o.poll_interval.unwrap_or(self.poll_interval),
            job_timeout: o.job_timeout.or(self.job_timeout),
        }
    }

    /// A registry that applies these defaults and overrides.
    pub fn registry(&self) -> QueueRegistry {
        self.overrides
            .keys()
            .fold(QueueRegistry::new(self.defaults()), |registry, name| {
                let config = self.queue_config(name);
                registry.with_queue_config(name.clone(), config)
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSettings {
    /// Run the cleanup and exit after this long
    #[serde(default, with = "humantime_serde")]
    pub idle_exit: Option<Duration>,
}

// Default value functions
fn default_max_entries() -> usize { 10_000 }
fn default_cache_ttl() -> Duration { Duration::from_secs(300) }
fn default_short_lived_ttl() -> Duration { Duration::from_secs(30) }
fn default_max_entry_size() -> usize { 1024 * 1024 }
fn default_rate_limit() -> u64 { 60 }
fn default_rate_window() -> Duration { Duration::from_secs(60) }
fn default_max_pending_jobs() -> usize { 1000 }
fn default_dead_letter_max_size() -> usize { 1000 }
fn default_max_retained_jobs() -> usize { 1000 }
fn default_concurrency() -> usize { 1 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }

impl WardenConfig {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: WardenConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: WardenConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.cache.max_entries == 0 {
            return Err(WardenError::configuration("cache.max_entries must be at least 1"));
        }
        if self.queues.max_pending_jobs == 0 {
            return Err(WardenError::configuration("queues.max_pending_jobs must be at least 1"));
        }
        if self.queues.concurrency == 0 {
            return Err(WardenError::configuration("queues.concurrency must be at least 1"));
        }
        for (name, o) in &self.queues.overrides {
            if o.max_pending_jobs == Some(0) || o.concurrency == Some(0) {
                return Err(WardenError::configuration(format!(
                    "queues.overrides.{name}: max_pending_jobs and concurrency must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("WARDEN")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.queues.max_pending_jobs, 1000);
        assert_eq!(config.queues.concurrency, 1);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
        assert!(config.worker.idle_exit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_override_falls_back_to_defaults() {
        let mut settings = QueueSettings::default();
        settings.overrides.insert(
            "hr-leave-accrual".to_string(),
            QueueOverride {
                max_pending_jobs: Some(100),
                concurrency: Some(4),
                ..Default::default()
            },
        );

        let config = settings.queue_config("hr-leave-accrual");
        assert_eq!(config.max_pending_jobs, 100);
        assert_eq!(config.dead_letter_max_size, 1000);
        assert_eq!(settings.queue_config("other").max_pending_jobs, 1000);

        let options = settings.worker_options("hr-leave-accrual");
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.poll_interval, Duration::from_secs(1));

        let registry = settings.registry();
        assert_eq!(registry.config_for("hr-leave-accrual").max_pending_jobs, 100);
    }

    #[test]
    fn test_humantime_durations() {
        let settings: QueueSettings =
            serde_json::from_str(r#"{"poll_interval": "250ms", "job_timeout": "30s"}"#).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.job_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = WardenConfig::default();
        config.queues.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
