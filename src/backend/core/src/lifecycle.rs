//! Process lifecycle: cleanup callbacks run once on shutdown.
//!
//! Handlers are keyed by id (re-registering replaces the previous handler).
//! A cleanup run fans every handler out onto its own task and waits for all
//! of them regardless of individual failures. Concurrent or repeated calls to
//! [`LifecycleRegistry::run_cleanup`] share the first run.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type CleanupHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A handler that did not finish cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of a cleanup run, one entry per handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Registry of async cleanup callbacks.
#[derive(Default)]
pub struct LifecycleRegistry {
    handlers: Mutex<BTreeMap<String, CleanupHandler>>,
    run: Mutex<Option<Shared<BoxFuture<'static, CleanupReport>>>>,
    signals_attached: AtomicBool,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id`, replacing any handler with the same id.
    pub fn register_cleanup<F, Fut>(&self, id: impl Into<String>, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        let handler: CleanupHandler = Arc::new(move || handler().boxed());
        if self.handlers.lock().insert(id.clone(), handler).is_some() {
            warn!(cleanup_id = %id, "Cleanup handler replaced");
        }
    }

    pub fn unregister_cleanup(&self, id: &str) -> bool {
        self.handlers.lock().remove(id).is_some()
    }

    pub fn handler_ids(&self) -> Vec<String> {
        self.handlers.lock().keys().cloned().collect()
    }

    /// Whether a cleanup run has been started.
    pub fn has_run(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Run every registered handler concurrently and collect each outcome.
    ///
    /// Handlers registered after the first call are not part of that run.
    pub async fn run_cleanup(&self) -> CleanupReport {
        let run = self
            .run
            .lock()
            .get_or_insert_with(|| {
                let handlers: Vec<(String, CleanupHandler)> = self
                    .handlers
                    .lock()
                    .iter()
                    .map(|(id, h)| (id.clone(), h.clone()))
                    .collect();
                execute(handlers).boxed().shared()
            })
            .clone();
        run.await
    }

    /// Run the cleanup once SIGINT or SIGTERM arrives.
    ///
    /// Only the first call attaches; later calls return `None`.
    pub fn attach_shutdown_signals(self: &Arc<Self>) -> Option<JoinHandle<CleanupReport>> {
        if self.signals_attached.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.attach_trigger(shutdown_signal()))
    }

    /// Run the cleanup when `trigger` resolves, e.g. an idle-exit timer.
    pub fn attach_trigger<F>(self: &Arc<Self>, trigger: F) -> JoinHandle<CleanupReport>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = self.clone();
        tokio::spawn(async move {
            trigger.await;
            registry.run_cleanup().await
        })
    }
}

impl std::fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleRegistry")
            .field("handlers", &self.handler_ids())
            .field("has_run", &self.has_run())
            .finish()
    }
}

async fn execute(handlers: Vec<(String, CleanupHandler)>) -> CleanupReport {
    info!(handlers = handlers.len(), "Running cleanup handlers");

    let (ids, tasks): (Vec<String>, Vec<JoinHandle<anyhow::Result<()>>>) = handlers
        .into_iter()
        .map(|(id, handler)| (id, tokio::spawn(handler())))
        .unzip();

    let mut report = CleanupReport::default();
    for (id, outcome) in ids.into_iter().zip(join_all(tasks).await) {
        match outcome {
            Ok(Ok(())) => report.succeeded.push(id),
            Ok(Err(e)) => {
                error!(cleanup_id = %id, error = %e, "Cleanup handler failed");
                report.failed.push(CleanupFailure {
                    id,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                error!(cleanup_id = %id, error = %e, "Cleanup handler panicked");
                report.failed.push(CleanupFailure {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Cleanup finished"
    );
    report
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
