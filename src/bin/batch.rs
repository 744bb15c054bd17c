use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use tracing::{error, info, warn};

use matchmail::config::Config;
use matchmail::db::repository::{PgRepository, Repository};
use matchmail::db::connect_pool;
use matchmail::error::BatchError;
use matchmail::models::batch::BatchStatus;
use matchmail::services::email_transport::{EmailDeliveryService, MailTransport};
use matchmail::services::import::FileImportSource;
use matchmail::services::metrics::MetricsHub;
use matchmail::services::phase_runner::PhaseRunner;
use matchmail::services::scheduler::{
    JobPriority, JobSpec, ResourceLimits, RetryPolicy, Scheduler, Trigger,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let timezone: chrono_tz::Tz = config
        .scheduler
        .timezone
        .parse()
        .expect("timezone validated at startup");

    let pool_size = (config.scheduler.max_concurrent_jobs + config.matching.max_parallel_workers)
        .min(50) as u32;
    let pool = connect_pool(&config.database_url, pool_size).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let repo: Arc<dyn Repository> =
        Arc::new(PgRepository::new(pool, config.scoring.batch_insert_size));
    let (metrics, mut alert_rx) = MetricsHub::new();
    let metrics = Arc::new(metrics);

    // Alerts drain to storage in the background; notifiers read the table.
    let alert_repo = repo.clone();
    tokio::spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            if let Err(e) = alert_repo.write_alert(&alert).await {
                error!(error = %e, "failed to persist alert");
            }
        }
    });

    let feed_path =
        env::var("IMPORT_FEED_PATH").unwrap_or_else(|_| "./data/jobs_feed.jsonl".to_string());
    let runner = Arc::new(PhaseRunner::new(
        repo.clone(),
        metrics.clone(),
        config.clone(),
        Arc::new(FileImportSource::new(feed_path)),
    ));

    let delivery = Arc::new(EmailDeliveryService::new(
        repo.clone(),
        MailTransport::from_config(&config.email)?,
        metrics.clone(),
        &config.email,
    )?);

    let scheduler = Scheduler::new(config.scheduler.clone(), metrics.clone());
    let retry = RetryPolicy::from_config(&config.scheduler);

    // Nightly pipeline at 02:00 local. A failed run returns Err so the
    // scheduler retries it; the retry resumes from the last checkpoint.
    let batch_cron = env::var("BATCH_CRON").unwrap_or_else(|_| "0 2 * * *".to_string());
    let pipeline_runner = runner.clone();
    scheduler.add_job(JobSpec {
        id: "daily-batch".into(),
        name: "nightly matching pipeline".into(),
        trigger: Trigger::cron(&batch_cron, timezone)?,
        func: Arc::new(move |ctx| {
            let runner = pipeline_runner.clone();
            Box::pin(async move {
                let run = runner.run_batch(ctx.cancel).await?;
                match run.status {
                    BatchStatus::Completed => Ok(()),
                    BatchStatus::Cancelled => Err(BatchError::Cancelled(run.batch_id)),
                    status => Err(BatchError::BatchFailed {
                        batch_id: run.batch_id,
                        detail: status.to_string(),
                    }),
                }
            })
        }),
        enabled: true,
        priority: JobPriority::Critical,
        max_instances: 1,
        dependencies: HashSet::new(),
        retry: retry.clone(),
        limits: ResourceLimits {
            memory_mb: Some(4096),
            cpu_percent: None,
            timeout: Some(Duration::from_secs(config.targets.total_runtime_secs * 2)),
        },
        coalesce: config.scheduler.coalesce,
    });

    // Manual run requests land as PENDING rows via the admin API.
    let poll_repo = repo.clone();
    let poll_scheduler = scheduler.clone();
    scheduler.add_job(JobSpec {
        id: "pending-run-poll".into(),
        name: "manual run trigger poll".into(),
        trigger: Trigger::interval(Duration::from_secs(30)),
        func: Arc::new(move |_ctx| {
            let repo = poll_repo.clone();
            let scheduler = poll_scheduler.clone();
            Box::pin(async move {
                let pending = repo.list_batch_runs(Some(BatchStatus::Pending), 1).await?;
                if !pending.is_empty() {
                    info!("pending run found, triggering pipeline");
                    scheduler.run_now("daily-batch");
                }
                Ok(())
            })
        }),
        enabled: true,
        priority: JobPriority::Normal,
        max_instances: 1,
        dependencies: HashSet::new(),
        retry: retry.clone(),
        limits: ResourceLimits::default(),
        coalesce: true,
    });

    // Queue drain runs all day; the queue itself enforces send times.
    let delivery_job = delivery.clone();
    scheduler.add_job(JobSpec {
        id: "email-delivery".into(),
        name: "digest delivery".into(),
        trigger: Trigger::interval(Duration::from_secs(60)),
        func: Arc::new(move |_ctx| {
            let delivery = delivery_job.clone();
            Box::pin(async move {
                delivery.deliver_due().await?;
                Ok(())
            })
        }),
        enabled: true,
        priority: JobPriority::High,
        max_instances: 1,
        dependencies: HashSet::new(),
        retry: retry.clone(),
        limits: ResourceLimits {
            memory_mb: None,
            cpu_percent: None,
            timeout: Some(Duration::from_secs(300)),
        },
        coalesce: true,
    });

    // Retention purge, only after a successful nightly run.
    let cleanup_repo = repo.clone();
    let retention_days = config.scheduler.job_history_retention_days;
    scheduler.add_job(JobSpec {
        id: "history-cleanup".into(),
        name: "retention cleanup".into(),
        trigger: Trigger::cron("30 5 * * *", timezone)?,
        func: Arc::new(move |_ctx| {
            let repo = cleanup_repo.clone();
            Box::pin(async move {
                let removed = repo.cleanup_expired(retention_days).await?;
                info!(removed, "scheduled retention cleanup done");
                Ok(())
            })
        }),
        enabled: true,
        priority: JobPriority::Low,
        max_instances: 1,
        dependencies: HashSet::from(["daily-batch".to_string()]),
        retry: retry.clone(),
        limits: ResourceLimits::default(),
        coalesce: true,
    });

    // Periodic metrics report for the worker log.
    let report_metrics = metrics.clone();
    scheduler.add_job(JobSpec {
        id: "metrics-report".into(),
        name: "metrics snapshot log".into(),
        trigger: Trigger::interval(Duration::from_secs(
            config.scheduler.metrics_interval_secs.max(5),
        )),
        func: Arc::new(move |_ctx| {
            let metrics = report_metrics.clone();
            Box::pin(async move {
                let snap = metrics.snapshot();
                info!(
                    pairs_scored = snap.pairs_scored,
                    pairs_per_second = format!("{:.0}", snap.pairs_per_second),
                    users_processed = snap.users_processed,
                    emails_queued = snap.emails_queued,
                    cache_hit_rate = format!("{:.3}", snap.cache_hit_rate),
                    queue_utilization = format!("{:.2}", snap.queue_utilization),
                    "metrics snapshot"
                );
                Ok(())
            })
        }),
        enabled: true,
        priority: JobPriority::Low,
        max_instances: 1,
        dependencies: HashSet::new(),
        retry,
        limits: ResourceLimits::default(),
        coalesce: true,
    });

    info!("matchmail batch worker started");
    let scheduler_handle = tokio::spawn(scheduler.clone().run());

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");
    scheduler.shutdown();
    scheduler_handle.await?;
    Ok(())
}
