//! Warden Worker - background job host
//!
//! Consumes the HR queues, re-authorizing every job before it runs, and
//! exits after the lifecycle cleanup on SIGINT/SIGTERM or idle timeout.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};

use warden_core::{
    authz::{
        AccessRequest, Action, AuthorizationContext, AuthorizationGuard, DataClassification,
        DataResidency, InMemoryTenantDirectory, Permission, PermissionSet, PolicyEngine,
        PredefinedRole, Resource, RoleBinding, TenantRecord,
    },
    cache::TenantCache,
    config::WardenConfig,
    jobs::{JobError, JobInfo, JobOptions, OrgWorker, WorkerRuntime},
    lifecycle::LifecycleRegistry,
    telemetry::{self, LogFormat},
};

const LEAVE_ACCRUAL_QUEUE: &str = "hr-leave-accrual";
const NOTIFICATIONS_QUEUE: &str = "hr-notifications";

#[derive(Debug, Parser)]
#[command(name = "warden-worker", version, about = "Warden background job host")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<String>,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Seed a demo tenant and enqueue one job per queue
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WardenConfig::from_file(path)?,
        None => WardenConfig::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            WardenConfig::default()
        }),
    };
    if let Some(format) = args.log_format {
        config.telemetry.logging.format = format;
    }

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Warden worker"
    );

    // Authorization
    let policy = PolicyEngine::with_default_roles();
    let directory = InMemoryTenantDirectory::new();
    let guard = AuthorizationGuard::new(Arc::new(policy.clone()), Arc::new(directory.clone()));

    // Queues, cache and workers
    let queues = Arc::new(config.queues.registry());
    let cache = TenantCache::in_memory(
        config.cache.backend_config(),
        config.cache.tenant_cache_config(),
    );
    let runtime = WorkerRuntime::new(guard.clone(), queues.clone());

    let accrual = Arc::new(runtime.register_worker(
        Arc::new(LeaveAccrualWorker),
        config.queues.worker_options(LEAVE_ACCRUAL_QUEUE),
    )?);
    let notifications = Arc::new(runtime.register_worker(
        Arc::new(NotificationDispatchWorker { cache }),
        config.queues.worker_options(NOTIFICATIONS_QUEUE),
    )?);

    // Cleanup: stop fetching, drain in-flight jobs, then close the queues
    let lifecycle = Arc::new(LifecycleRegistry::new());
    for handle in [accrual, notifications] {
        let id = format!("worker:{}", handle.queue_name());
        lifecycle.register_cleanup(id, move || {
            let handle = handle.clone();
            async move {
                handle.close().await;
                Ok(())
            }
        });
    }
    let registry = queues.clone();
    lifecycle.register_cleanup("queues", move || {
        let registry = registry.clone();
        async move {
            registry.close_all();
            Ok(())
        }
    });

    if args.demo {
        seed_demo(&policy, &directory, &guard, &queues).await?;
    }

    let signal_run = lifecycle.attach_shutdown_signals();
    let idle_run = config
        .worker
        .idle_exit
        .map(|after| lifecycle.attach_trigger(tokio::time::sleep(after)));

    let report = match (signal_run, idle_run) {
        (Some(signal), Some(idle)) => {
            tokio::select! {
                report = signal => report?,
                report = idle => report?,
            }
        }
        (Some(signal), None) => signal.await?,
        (None, Some(idle)) => idle.await?,
        (None, None) => lifecycle.run_cleanup().await,
    };

    tracing::info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Worker shutdown complete"
    );
    telemetry.shutdown();

    if report.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} cleanup handler(s) failed", report.failed.len()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveAccrualPayload {
    employee_ids: Vec<String>,
    #[serde(default)]
    period: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaveAccrualOutput {
    balances_created: usize,
}

/// Creates one leave balance per employee for the accrual period.
struct LeaveAccrualWorker;

#[async_trait]
impl OrgWorker for LeaveAccrualWorker {
    type Payload = LeaveAccrualPayload;
    type Output = LeaveAccrualOutput;

    fn queue_name(&self) -> &str {
        LEAVE_ACCRUAL_QUEUE
    }

    fn required_permissions(&self) -> PermissionSet {
        [Permission::new(Resource::LeaveBalance, Action::Create)]
            .into_iter()
            .collect()
    }

    async fn process(
        &self,
        payload: LeaveAccrualPayload,
        ctx: &AuthorizationContext,
        job: &JobInfo,
    ) -> Result<LeaveAccrualOutput, JobError> {
        tracing::info!(
            job_id = %job.id,
            org_id = %ctx.org_id(),
            employees = payload.employee_ids.len(),
            period = payload.period.as_deref().unwrap_or("current"),
            "Accruing leave balances"
        );
        Ok(LeaveAccrualOutput {
            balances_created: payload.employee_ids.len(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationPayload {
    template: String,
    recipient_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationOutput {
    sent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NotificationTemplate {
    subject: String,
}

/// Sends a templated notification; templates are cached per tenant.
struct NotificationDispatchWorker {
    cache: TenantCache,
}

#[async_trait]
impl OrgWorker for NotificationDispatchWorker {
    type Payload = NotificationPayload;
    type Output = NotificationOutput;

    fn queue_name(&self) -> &str {
        NOTIFICATIONS_QUEUE
    }

    fn required_permissions(&self) -> PermissionSet {
        [Permission::new(Resource::Notification, Action::Create)]
            .into_iter()
            .collect()
    }

    async fn process(
        &self,
        payload: NotificationPayload,
        ctx: &AuthorizationContext,
        job: &JobInfo,
    ) -> Result<NotificationOutput, JobError> {
        if payload.recipient_ids.is_empty() {
            return Err(JobError::fatal("notification has no recipients").with_code("NO_RECIPIENTS"));
        }

        let template_name = payload.template.clone();
        let template: NotificationTemplate = self
            .cache
            .cached_read_keyed(ctx, NOTIFICATIONS_QUEUE, &payload.template, |_ctx| async move {
                Ok(NotificationTemplate {
                    subject: format!("[{}]", template_name),
                })
            })
            .await?;

        tracing::info!(
            job_id = %job.id,
            org_id = %ctx.org_id(),
            subject = %template.subject,
            recipients = payload.recipient_ids.len(),
            "Dispatching notification"
        );
        Ok(NotificationOutput {
            sent: payload.recipient_ids.len(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Demo
// ═══════════════════════════════════════════════════════════════════════════════

async fn seed_demo(
    policy: &PolicyEngine,
    directory: &InMemoryTenantDirectory,
    guard: &AuthorizationGuard,
    queues: &warden_core::jobs::QueueRegistry,
) -> anyhow::Result<()> {
    directory.upsert_tenant(TenantRecord::new(
        "org-1",
        "Demo Org",
        DataClassification::Official,
        DataResidency::UkOnly,
    ));
    directory.add_member("org-1", "hr-1");
    policy.bind_role(RoleBinding::new(
        "hr-1".into(),
        PredefinedRole::HrManager.id().into(),
        "org-1".into(),
    ));

    let ctx = guard
        .evaluate(
            &AccessRequest::new("org-1", "hr-1")
                .with_permission(Permission::new(Resource::LeaveBalance, Action::Create))
                .with_audit_source("demo:seed"),
        )
        .await?;

    queues
        .get_queue(LEAVE_ACCRUAL_QUEUE)
        .add_authorized(
            &ctx,
            "leave-accrual",
            serde_json::json!({ "employeeIds": ["e-1", "e-2", "e-3", "e-4", "e-5"] }),
            JobOptions::new().with_attempts(3),
        )
        .await?;
    queues
        .get_queue(NOTIFICATIONS_QUEUE)
        .add_authorized(
            &ctx,
            "notify",
            serde_json::json!({ "template": "leave-accrued", "recipientIds": ["e-1"] }),
            JobOptions::new(),
        )
        .await?;

    tracing::info!(org_id = "org-1", "Demo jobs enqueued");
    Ok(())
}
