//! Prometheus metrics for the cache, queues and workers.
//!
//! Components record through the `metrics` facade macros; this module only
//! installs the recorder and describes the metric families.
//!
//! # Example
//!
//! ```rust,no_run
//! use warden_core::telemetry::metrics::{init_metrics, MetricsConfig};
//!
//! let registry = init_metrics(&MetricsConfig::default(), "warden-core").unwrap();
//! println!("{}", registry.render());
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Serve `/metrics` on this address (e.g., "0.0.0.0:9090")
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_addr: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ]
}

/// Access to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry that records nothing.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder, and its HTTP listener when configured.
///
/// Must be called from within a tokio runtime when `listen_addr` is set.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = match config.listen_addr {
        Some(addr) => {
            let (recorder, exporter) = builder.with_http_listener(addr).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow::anyhow!("a global metrics recorder is already installed"))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Prometheus exporter stopped");
                }
            });
            handle
        }
        None => builder.install_recorder()?,
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        listen_addr = ?config.listen_addr,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Cache
    describe_counter!("warden_cache_reads_total", "Cached reads by outcome (hit, miss, stale, bypass)");
    describe_counter!("cache_hits_total", "Backend cache hits");
    describe_counter!("cache_misses_total", "Backend cache misses");
    describe_counter!("cache_evictions_total", "Entries evicted by the LRU bound");
    describe_counter!("cache_invalidations_total", "Cache tag invalidations");
    describe_counter!("cache_tags_pruned_total", "Cache tags dropped by the tag cap");
    describe_gauge!("cache_entries", "Entries currently cached");
    describe_gauge!("cache_size_bytes", "Bytes currently cached");
    describe_histogram!("cache_entry_size_bytes", "Size of stored cache entries");
    describe_counter!("rate_limit_checks_total", "Rate limiter decisions");

    // Authorization
    describe_counter!("warden_authz_decisions_total", "Guard decisions by outcome and reason");

    // Queues
    describe_counter!("warden_jobs_added_total", "Jobs accepted by a queue");
    describe_counter!("warden_queue_saturated_total", "Adds rejected by the pending ceiling");
    describe_gauge!("warden_queue_pending", "Waiting and delayed jobs");
    describe_gauge!("warden_queue_active", "Jobs currently reserved by a worker");
    describe_counter!("warden_jobs_completed_total", "Jobs completed");
    describe_counter!("warden_jobs_retried_total", "Job attempts rescheduled");
    describe_counter!("warden_jobs_failed_total", "Jobs failed terminally");

    // Workers
    describe_counter!("warden_jobs_total", "Job attempts by outcome");
    describe_histogram!("warden_job_duration_seconds", "Job attempt duration in seconds");

    // Errors
    describe_counter!("warden_errors_total", "Errors constructed, by code and category");
}
