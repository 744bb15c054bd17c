use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::repository::Repository;
use crate::error::{BatchError, Result};
use crate::models::batch::{
    AlertSeverity, BatchRun, BatchStatus, Checkpoint, CheckpointPayload, Phase,
};
use crate::services::cache::{AdjacencyCache, CacheRegistry};
use crate::services::copywriter::Copywriter;
use crate::services::dedup::Deduplicator;
use crate::services::email_queue::EmailQueueService;
use crate::services::email_renderer::EmailRenderer;
use crate::services::import::{ImportSource, JobImporter};
use crate::services::matching::{MatchingOrchestrator, SlateStore};
use crate::services::metrics::MetricsHub;
use crate::services::scoring::{JobRowSet, ScoringEngine};
use crate::services::sections::SectionSelector;
use crate::services::supplement::Supplementer;

/// Jobs posted within this window form the nightly candidate set.
const CANDIDATE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Default)]
struct PhaseResult {
    processed: u64,
    errors: u64,
    error_summary: HashMap<String, u64>,
}

struct RunState {
    run: BatchRun,
    caches: Option<Arc<CacheRegistry>>,
    slates: SlateStore,
    resume_matching: Option<i64>,
    resume_email: Option<i64>,
}

/// Drives the fixed phase sequence with timing, end-of-phase
/// checkpoints, and per-phase failure policy. Every phase is
/// re-enterable: a crashed run is adopted on the next trigger and
/// resumed from its checkpoints.
pub struct PhaseRunner {
    repo: Arc<dyn Repository>,
    metrics: Arc<MetricsHub>,
    config: Config,
    import_source: Arc<dyn ImportSource>,
}

impl PhaseRunner {
    pub fn new(
        repo: Arc<dyn Repository>,
        metrics: Arc<MetricsHub>,
        config: Config,
        import_source: Arc<dyn ImportSource>,
    ) -> Self {
        Self {
            repo,
            metrics,
            config,
            import_source,
        }
    }

    pub async fn run_batch(&self, cancel: watch::Receiver<bool>) -> Result<BatchRun> {
        let (mut state, skip_completed) = self.adopt_or_create().await?;
        let batch_id = state.run.batch_id;
        let correlation_id = MetricsHub::mint_correlation_id();
        info!(%batch_id, %correlation_id, resuming = skip_completed, "batch starting");

        state.run.status = BatchStatus::Running;
        self.repo.update_batch_run(&state.run).await?;

        for phase in Phase::ALL {
            // Init rebuilds in-process state (caches) and must run even
            // on a resumed batch; later phases skip once complete.
            if phase != Phase::Init
                && skip_completed
                && self.phase_is_complete(batch_id, phase).await?
            {
                info!(%batch_id, %phase, "phase already complete, skipping");
                continue;
            }
            if *cancel.borrow() {
                return self.finish(state.run, BatchStatus::Cancelled).await;
            }

            state.run.start_phase(phase);
            let result = self
                .run_phase_with_policy(phase, &mut state, correlation_id, &cancel)
                .await;
            state.run.end_phase(phase);
            if let Some(timing) = state.run.phase_times.get(phase.as_str()) {
                if let Some(ms) = timing.duration_ms {
                    self.metrics.record_phase_duration(phase.as_str(), ms);
                }
            }

            match result {
                Ok(phase_result) => {
                    state.run.counters.processed += phase_result.processed;
                    state.run.counters.errors += phase_result.errors;
                    for (kind, count) in phase_result.error_summary {
                        *state.run.error_summary.entry(kind).or_insert(0) += count;
                    }
                    self.checkpoint_phase_complete(batch_id, phase).await?;
                    self.repo.update_batch_run(&state.run).await?;
                }
                Err(BatchError::Cancelled(_)) => {
                    warn!(%batch_id, %phase, "batch cancelled mid-phase");
                    return self.finish(state.run, BatchStatus::Cancelled).await;
                }
                Err(e) => {
                    error!(%batch_id, %phase, error = %e, "phase failed");
                    state.run.record_error(e.kind());
                    self.metrics.raise_alert(
                        Some(batch_id),
                        AlertSeverity::Critical,
                        format!("phase {phase} failed: {e}"),
                    );
                    return self.finish(state.run, BatchStatus::Failed).await;
                }
            }
        }

        self.finish(state.run, BatchStatus::Completed).await
    }

    /// A crashed run (still RUNNING in storage) is resumed rather than
    /// restarted so already-persisted users are never re-scored.
    async fn adopt_or_create(&self) -> Result<(RunState, bool)> {
        let crashed = self
            .repo
            .list_batch_runs(Some(BatchStatus::Running), 1)
            .await?
            .into_iter()
            .next();
        // Manual `run-now` requests arrive as PENDING rows.
        let pending = match &crashed {
            Some(_) => None,
            None => self
                .repo
                .list_batch_runs(Some(BatchStatus::Pending), 1)
                .await?
                .into_iter()
                .next(),
        };

        let (run, resuming) = match (crashed, pending) {
            (Some(run), _) => {
                warn!(batch_id = %run.batch_id, "adopting crashed run");
                (run, true)
            }
            (None, Some(run)) => {
                info!(batch_id = %run.batch_id, "picking up requested run");
                (run, false)
            }
            (None, None) => {
                let run = BatchRun::new(Uuid::new_v4());
                self.repo.create_batch_run(&run).await?;
                (run, false)
            }
        };

        let batch_id = run.batch_id;
        let mut state = RunState {
            run,
            caches: None,
            slates: Arc::new(Mutex::new(HashMap::new())),
            resume_matching: None,
            resume_email: None,
        };
        if resuming {
            if let Some(cp) = self.repo.read_checkpoint(batch_id, Phase::Matching).await? {
                if !cp.payload.phase_complete {
                    state.resume_matching = cp.payload.frontier_user_id;
                }
            }
            if let Some(cp) = self.repo.read_checkpoint(batch_id, Phase::EmailQueue).await? {
                if !cp.payload.phase_complete {
                    state.resume_email = cp.payload.frontier_user_id;
                }
            }
        }
        Ok((state, resuming))
    }

    async fn phase_is_complete(&self, batch_id: Uuid, phase: Phase) -> Result<bool> {
        Ok(self
            .repo
            .read_checkpoint(batch_id, phase)
            .await?
            .map(|cp| cp.payload.phase_complete)
            .unwrap_or(false))
    }

    async fn checkpoint_phase_complete(&self, batch_id: Uuid, phase: Phase) -> Result<()> {
        let payload = match self.repo.read_checkpoint(batch_id, phase).await? {
            Some(cp) => CheckpointPayload {
                phase_complete: true,
                ..cp.payload
            },
            None => CheckpointPayload {
                phase_complete: true,
                ..Default::default()
            },
        };
        self.repo
            .write_checkpoint(&Checkpoint {
                batch_id,
                phase,
                at: Utc::now(),
                payload,
            })
            .await
    }

    async fn run_phase_with_policy(
        &self,
        phase: Phase,
        state: &mut RunState,
        correlation_id: Uuid,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PhaseResult> {
        let first = self.run_phase(phase, state, correlation_id, cancel).await;
        match (&first, phase) {
            (Ok(_), _) | (Err(BatchError::Cancelled(_)), _) => first,
            // Cleanup problems are recorded, never fatal.
            (Err(e), Phase::Cleanup) => {
                warn!(error = %e, "cleanup errors ignored");
                let mut result = PhaseResult::default();
                result.errors = 1;
                *result.error_summary.entry(e.kind().to_string()).or_insert(0) += 1;
                Ok(result)
            }
            (Err(e), Phase::Import | Phase::Matching | Phase::EmailQueue) => {
                warn!(%phase, error = %e, "phase failed, retrying once from checkpoint");
                // Refresh the resume frontier the failed attempt left.
                if phase == Phase::Matching {
                    if let Some(cp) = self
                        .repo
                        .read_checkpoint(state.run.batch_id, Phase::Matching)
                        .await?
                    {
                        state.resume_matching = cp.payload.frontier_user_id;
                    }
                }
                if phase == Phase::EmailQueue {
                    if let Some(cp) = self
                        .repo
                        .read_checkpoint(state.run.batch_id, Phase::EmailQueue)
                        .await?
                    {
                        state.resume_email = cp.payload.frontier_user_id;
                    }
                }
                self.run_phase(phase, state, correlation_id, cancel).await
            }
            (Err(_), Phase::Init) => first,
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        state: &mut RunState,
        correlation_id: Uuid,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PhaseResult> {
        info!(batch_id = %state.run.batch_id, %phase, "phase starting");
        match phase {
            Phase::Init => self.phase_init(state).await,
            Phase::Import => self.phase_import(state).await,
            Phase::Matching => self.phase_matching(state, correlation_id, cancel).await,
            Phase::EmailQueue => self.phase_email_queue(state, correlation_id, cancel).await,
            Phase::Cleanup => self.phase_cleanup(state).await,
        }
    }

    async fn phase_init(&self, state: &mut RunState) -> Result<PhaseResult> {
        self.config.validate()?;
        let adjacency_rows = self.repo.load_prefecture_adjacency().await?;
        let occupation_rows = self.repo.load_occupation_hierarchy().await?;
        let adjacency = AdjacencyCache::warm(adjacency_rows, occupation_rows);
        info!(entries = adjacency.len(), "run-lifetime caches warmed");
        state.caches = Some(Arc::new(CacheRegistry::new(adjacency)));
        Ok(PhaseResult::default())
    }

    async fn phase_import(&self, state: &mut RunState) -> Result<PhaseResult> {
        let mut result = PhaseResult::default();
        let rows = match self.import_source.fetch().await {
            Ok(rows) => rows,
            Err(e) => {
                // A missing feed leaves yesterday's inventory in place;
                // matching still runs.
                warn!(error = %e, "import feed unavailable, continuing with existing jobs");
                result.errors = 1;
                *result
                    .error_summary
                    .entry("validation".to_string())
                    .or_insert(0) += 1;
                return Ok(result);
            }
        };

        let importer = JobImporter::new();
        let report = importer
            .run(&self.repo, &self.metrics, rows, Utc::now())
            .await?;
        result.processed = report.imported;
        result.errors = report.rejected as u64;
        if report.rejected > 0 {
            result
                .error_summary
                .insert("validation".to_string(), report.rejected as u64);
        }
        Ok(result)
    }

    async fn phase_matching(
        &self,
        state: &mut RunState,
        correlation_id: Uuid,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PhaseResult> {
        let caches = state
            .caches
            .clone()
            .ok_or_else(|| BatchError::Phase {
                phase: Phase::Matching,
                detail: "caches not initialized".into(),
            })?;

        let since = Utc::now() - Duration::days(CANDIDATE_WINDOW_DAYS);
        let jobs = Arc::new(self.repo.load_jobs_since(since).await?);
        let rows = Arc::new(JobRowSet::build(&jobs, &caches.adjacency, Utc::now()));
        info!(candidates = rows.len(), "candidate row set built");

        let orchestrator = MatchingOrchestrator::new(
            self.repo.clone(),
            caches,
            Arc::new(ScoringEngine::new(&self.config.scoring)),
            Arc::new(Deduplicator::new(self.config.scoring.dedup_window_days)),
            Arc::new(SectionSelector::new(self.config.sections.clone())),
            Arc::new(Supplementer::new(
                self.config.sections.total,
                self.config.sections.max_jobs_per_category,
            )),
            self.metrics.clone(),
            self.config.matching.clone(),
        );

        let outcome = orchestrator
            .run(
                state.run.batch_id,
                correlation_id,
                jobs,
                rows,
                state.slates.clone(),
                state.resume_matching,
                cancel.clone(),
            )
            .await?;

        let mut result = PhaseResult {
            processed: outcome.processed,
            errors: outcome.failed,
            error_summary: HashMap::new(),
        };
        if outcome.failed > 0 {
            result
                .error_summary
                .insert("matching_user".to_string(), outcome.failed);
        }
        Ok(result)
    }

    async fn phase_email_queue(
        &self,
        state: &mut RunState,
        correlation_id: Uuid,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PhaseResult> {
        let service = EmailQueueService::new(
            self.repo.clone(),
            Arc::new(EmailRenderer::new(&self.config.email.base_url)?),
            Arc::new(Copywriter::new(
                self.config.email.copywriter_endpoint.clone(),
                self.config.email.copywriter_api_key.clone(),
            )),
            Arc::new(SectionSelector::new(self.config.sections.clone())),
            Arc::new(Supplementer::new(
                self.config.sections.total,
                self.config.sections.max_jobs_per_category,
            )),
            self.metrics.clone(),
            self.config.matching.batch_size,
            self.config.matching.checkpoint_interval,
        );

        let outcome = service
            .run(
                state.run.batch_id,
                correlation_id,
                state.slates.clone(),
                state.resume_email,
                cancel.clone(),
            )
            .await?;
        Ok(PhaseResult {
            processed: outcome.queued,
            errors: 0,
            error_summary: HashMap::new(),
        })
    }

    async fn phase_cleanup(&self, state: &mut RunState) -> Result<PhaseResult> {
        let removed = self
            .repo
            .cleanup_expired(self.config.scheduler.job_history_retention_days)
            .await?;
        if let Some(caches) = &state.caches {
            caches.history.clear();
            self.metrics.set_cache_hit_rate(caches.combined_hit_rate());
        }
        state.slates.lock().expect("slate store poisoned").clear();
        info!(removed, "retention cleanup done");
        Ok(PhaseResult {
            processed: removed,
            ..Default::default()
        })
    }

    /// Terminal bookkeeping: persist status, emit the summary report,
    /// and run the alert thresholds. Always returns the run.
    async fn finish(&self, mut run: BatchRun, status: BatchStatus) -> Result<BatchRun> {
        run.status = status;
        run.ended_at = Some(Utc::now());
        self.repo.update_batch_run(&run).await?;
        self.metrics.check_run_thresholds(&run, &self.config.targets);

        info!(
            batch_id = %run.batch_id,
            status = %run.status,
            processed = run.counters.processed,
            errors = run.counters.errors,
            success_rate = format!("{:.3}", run.success_rate()),
            error_summary = ?run.error_summary,
            phase_times = ?run.phase_times.iter().map(|(phase, timing)| {
                (phase.clone(), timing.duration_ms.unwrap_or(0))
            }).collect::<HashMap<_, _>>(),
            "batch finished"
        );
        Ok(run)
    }
}
