use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{MatchStrategy, MatchingConfig};
use crate::db::repository::Repository;
use crate::error::{BatchError, Result};
use crate::models::batch::{Checkpoint, CheckpointPayload, Phase};
use crate::models::job::{FeatureBits, Job};
use crate::models::matching::{MatchScore, ScoredJob, SectionSlate};
use crate::models::user::{Application, User, UserProfile};
use crate::services::cache::CacheRegistry;
use crate::services::dedup::Deduplicator;
use crate::services::metrics::MetricsHub;
use crate::services::scoring::{JobRowSet, PairScore, ScoreBuffers, ScoringEngine, UserContext};
use crate::services::sections::SectionSelector;
use crate::services::supplement::Supplementer;

/// Per-user slates produced by the matching phase, consumed by email
/// queueing within the same process lifetime.
pub type SlateStore = Arc<Mutex<HashMap<i64, SectionSlate>>>;

struct UserWork {
    user: User,
    profile: Option<UserProfile>,
    history: Arc<Vec<Application>>,
}

struct UserSuccess {
    user_id: i64,
    scores: Vec<MatchScore>,
    slate: SectionSlate,
    pairs: u64,
    elapsed_ms: u64,
    fallbacks: u64,
    error_pairs: usize,
    dedup_malformed: usize,
}

type UserOutcome = std::result::Result<UserSuccess, (i64, BatchError)>;

#[derive(Debug, Default)]
pub struct MatchingOutcome {
    pub processed: u64,
    pub failed: u64,
    pub frontier: Option<i64>,
    pub failed_users: Vec<(i64, String)>,
}

/// Drives the per-user pipeline: history, dedup, bulk score, top-N pool,
/// section selection, supplementation. Work is dispatched onto a bounded
/// worker pool; checkpoints advance at chunk boundaries only, so a
/// restart never duplicates a user's output.
pub struct MatchingOrchestrator {
    repo: Arc<dyn Repository>,
    caches: Arc<CacheRegistry>,
    engine: Arc<ScoringEngine>,
    dedup: Arc<Deduplicator>,
    selector: Arc<SectionSelector>,
    supplementer: Arc<Supplementer>,
    metrics: Arc<MetricsHub>,
    cfg: MatchingConfig,
}

impl MatchingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        caches: Arc<CacheRegistry>,
        engine: Arc<ScoringEngine>,
        dedup: Arc<Deduplicator>,
        selector: Arc<SectionSelector>,
        supplementer: Arc<Supplementer>,
        metrics: Arc<MetricsHub>,
        cfg: MatchingConfig,
    ) -> Self {
        Self {
            repo,
            caches,
            engine,
            dedup,
            selector,
            supplementer,
            metrics,
            cfg,
        }
    }

    pub async fn run(
        &self,
        batch_id: Uuid,
        correlation_id: Uuid,
        jobs: Arc<Vec<Job>>,
        rows: Arc<JobRowSet>,
        slates: SlateStore,
        resume_after: Option<i64>,
        cancel: watch::Receiver<bool>,
    ) -> Result<MatchingOutcome> {
        let mut outcome = MatchingOutcome {
            frontier: resume_after,
            ..Default::default()
        };
        if let Some(frontier) = resume_after {
            info!(%batch_id, frontier, "resuming matching after checkpoint frontier");
        }

        self.warm_popularity(&jobs).await?;

        let mut since_checkpoint = 0usize;
        let mut window_processed = 0u64;
        let mut window_failed = 0u64;
        loop {
            if *cancel.borrow() || self.repo.is_cancel_requested(batch_id).await? {
                return Err(BatchError::Cancelled(batch_id));
            }

            let after = outcome.frontier.unwrap_or(0);
            let users = self
                .repo
                .load_active_users(after, self.cfg.batch_size as i64)
                .await?;
            if users.is_empty() {
                break;
            }
            let chunk_max_user = users.last().map(|u| u.user_id);

            let work = self.prepare_chunk(users).await?;
            let results = self
                .process_chunk(batch_id, work, &jobs, &rows, &cancel)
                .await?;

            let mut chunk_scores: Vec<MatchScore> = Vec::new();
            for result in results {
                match result {
                    Ok(success) => {
                        self.metrics.user_processed();
                        self.metrics
                            .add_pairs_scored(success.pairs, success.elapsed_ms.max(1));
                        self.metrics.fallbacks_generated(success.fallbacks);
                        if success.error_pairs > 0 {
                            self.metrics.record_error("scoring");
                        }
                        if success.dedup_malformed > 0 {
                            self.metrics.record_error("validation");
                        }
                        chunk_scores.extend(success.scores);
                        slates
                            .lock()
                            .expect("slate store poisoned")
                            .insert(success.user_id, success.slate);
                        outcome.processed += 1;
                        window_processed += 1;
                    }
                    Err((user_id, err)) => {
                        warn!(%batch_id, user_id, error = %err, "user failed in matching");
                        self.metrics.user_failed();
                        self.metrics.record_error(err.kind());
                        outcome.failed += 1;
                        window_failed += 1;
                        outcome.failed_users.push((user_id, err.to_string()));
                    }
                }
            }

            // Persist before the frontier moves; the checkpoint must
            // never run ahead of durable results.
            if !chunk_scores.is_empty() {
                self.repo.write_scores_bulk(batch_id, &chunk_scores).await?;
            }
            outcome.frontier = chunk_max_user;
            since_checkpoint += self.cfg.batch_size;

            if since_checkpoint >= self.cfg.checkpoint_interval {
                self.write_checkpoint(batch_id, &outcome).await?;
                since_checkpoint = 0;

                let window_total = window_processed + window_failed;
                if window_total > 0 {
                    let rate = window_failed as f64 / window_total as f64;
                    if rate > self.cfg.user_failure_rate_threshold {
                        return Err(BatchError::Phase {
                            phase: Phase::Matching,
                            detail: format!(
                                "user failure rate {:.1}% over checkpoint window",
                                rate * 100.0
                            ),
                        });
                    }
                }
                window_processed = 0;
                window_failed = 0;
            }

            self.metrics
                .set_cache_hit_rate(self.caches.combined_hit_rate());
            debug!(
                %batch_id,
                %correlation_id,
                processed = outcome.processed,
                failed = outcome.failed,
                "matching chunk complete"
            );
            tokio::task::yield_now().await;
        }

        self.write_checkpoint(batch_id, &outcome).await?;
        self.caches.history.clear();
        Ok(outcome)
    }

    async fn write_checkpoint(&self, batch_id: Uuid, outcome: &MatchingOutcome) -> Result<()> {
        self.repo
            .write_checkpoint(&Checkpoint {
                batch_id,
                phase: Phase::Matching,
                at: Utc::now(),
                payload: CheckpointPayload {
                    frontier_user_id: outcome.frontier,
                    processed: outcome.processed,
                    failed: outcome.failed,
                    ..Default::default()
                },
            })
            .await
    }

    /// One popularity bulk load per run covers every candidate company;
    /// the session cache serves everything after that.
    async fn warm_popularity(&self, jobs: &[Job]) -> Result<()> {
        let now_epoch = Utc::now().timestamp();
        let mut missing: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for job in jobs {
            if seen.insert(job.company_code.as_str())
                && self.caches.popularity.get(&job.company_code, now_epoch).is_none()
            {
                missing.push(job.company_code.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        let loaded = self.repo.load_company_popularity(&missing).await?;
        for code in &missing {
            let value = loaded.get(code).copied().unwrap_or_default();
            self.caches.popularity.put(code, now_epoch, value);
        }
        Ok(())
    }

    async fn prepare_chunk(&self, users: Vec<User>) -> Result<Vec<UserWork>> {
        let user_ids: Vec<i64> = users.iter().map(|u| u.user_id).collect();
        let mut profiles = self.repo.load_user_profiles(&user_ids).await?;

        // Histories go through the transient cache so a retried chunk
        // skips the bulk query.
        let mut missing: Vec<i64> = Vec::new();
        for id in &user_ids {
            if self.caches.history.get(*id).is_none() {
                missing.push(*id);
            }
        }
        if !missing.is_empty() {
            let histories = self.repo.load_user_history(&missing).await?;
            let mut filled = histories;
            for id in &missing {
                filled.entry(*id).or_default();
            }
            self.caches.history.put_bulk(filled);
        }

        Ok(users
            .into_iter()
            .map(|user| {
                let history = self
                    .caches
                    .history
                    .get(user.user_id)
                    .unwrap_or_else(|| Arc::new(Vec::new()));
                UserWork {
                    profile: profiles.remove(&user.user_id),
                    history,
                    user,
                }
            })
            .collect())
    }

    async fn process_chunk(
        &self,
        batch_id: Uuid,
        work: Vec<UserWork>,
        jobs: &Arc<Vec<Job>>,
        rows: &Arc<JobRowSet>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Vec<UserOutcome>> {
        let users = work.len();
        let parallel = match self.cfg.strategy {
            MatchStrategy::Sequential => false,
            MatchStrategy::Parallel => true,
            MatchStrategy::Adaptive => users * rows.len() > 10_000 && users > 5,
        };

        if !parallel {
            let mut buffers = ScoreBuffers::default();
            let now = Utc::now();
            return Ok(work
                .into_iter()
                .map(|w| self.process_user(w, jobs, rows, &mut buffers, now))
                .collect());
        }

        let workers = self.cfg.max_parallel_workers.min(users.max(1));
        let (work_tx, work_rx) = mpsc::channel::<UserWork>(self.cfg.queue_size_limit);
        let (result_tx, mut result_rx) = mpsc::channel::<UserOutcome>(self.cfg.queue_size_limit);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let now = Utc::now();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let jobs = jobs.clone();
            let rows = rows.clone();
            let engine = self.engine.clone();
            let dedup = self.dedup.clone();
            let selector = self.selector.clone();
            let supplementer = self.supplementer.clone();
            let caches = self.caches.clone();
            let pool_size = self.cfg.candidate_pool_size;
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut buffers = ScoreBuffers::default();
                loop {
                    if *cancel.borrow() {
                        break;
                    }
                    let next = { work_rx.lock().await.recv().await };
                    let Some(work) = next else { break };
                    let outcome = process_user_inner(
                        work,
                        &jobs,
                        &rows,
                        &engine,
                        &dedup,
                        &selector,
                        &supplementer,
                        &caches,
                        pool_size,
                        &mut buffers,
                        now,
                    );
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                    // Cooperative boundary between users; the scoring
                    // loop itself never yields.
                    tokio::task::yield_now().await;
                }
            }));
        }
        drop(result_tx);

        let queue_capacity = self.cfg.queue_size_limit;
        let metrics = self.metrics.clone();
        let producer = tokio::spawn(async move {
            for item in work {
                metrics.set_queue_gauge(queue_capacity - work_tx.capacity(), queue_capacity);
                if work_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let mut results = Vec::with_capacity(users);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        let _ = producer.await;
        for handle in handles {
            let _ = handle.await;
        }
        if *cancel.borrow() && results.len() < users {
            return Err(BatchError::Cancelled(batch_id));
        }
        Ok(results)
    }

    fn process_user(
        &self,
        work: UserWork,
        jobs: &Arc<Vec<Job>>,
        rows: &Arc<JobRowSet>,
        buffers: &mut ScoreBuffers,
        now: DateTime<Utc>,
    ) -> UserOutcome {
        process_user_inner(
            work,
            jobs,
            rows,
            &self.engine,
            &self.dedup,
            &self.selector,
            &self.supplementer,
            &self.caches,
            self.cfg.candidate_pool_size,
            buffers,
            now,
        )
    }
}

/// The full per-user pipeline, synchronous on purpose.
#[allow(clippy::too_many_arguments)]
fn process_user_inner(
    work: UserWork,
    jobs: &[Job],
    rows: &JobRowSet,
    engine: &ScoringEngine,
    dedup: &Deduplicator,
    selector: &SectionSelector,
    supplementer: &Supplementer,
    caches: &CacheRegistry,
    pool_size: usize,
    buffers: &mut ScoreBuffers,
    now: DateTime<Utc>,
) -> UserOutcome {
    let user_id = work.user.user_id;
    let started = Instant::now();

    let dedup_outcome = dedup.exclusion_set(user_id, &work.history, rows, now);
    let ctx = UserContext::build(
        &work.user,
        work.profile.as_ref(),
        &work.history,
        rows,
        &caches.adjacency,
        engine.recent_penalty_days(),
        now,
    );

    let error_pairs = engine.score_user(&ctx, rows, &dedup_outcome.excluded_companies, buffers);
    let pairs = buffers.out.len() as u64;

    // Top-N candidate pool by composite, job_id as the stable tiebreak.
    let pool_size = pool_size.min(buffers.out.len());
    let compare = |a: &PairScore, b: &PairScore| {
        b.composite
            .partial_cmp(&a.composite)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                rows.job_ids[a.job_idx as usize].cmp(&rows.job_ids[b.job_idx as usize])
            })
    };
    if pool_size > 0 && pool_size < buffers.out.len() {
        buffers.out.select_nth_unstable_by(pool_size - 1, compare);
    }
    let mut top: Vec<PairScore> = buffers.out[..pool_size].to_vec();
    top.sort_unstable_by(compare);

    let to_scored = |pair: &PairScore| -> ScoredJob {
        let idx = pair.job_idx as usize;
        let job = &jobs[idx];
        ScoredJob {
            job_id: job.job_id,
            company_code: job.company_code.clone(),
            title: job.title.clone(),
            category_code: job.category_code,
            composite: pair.composite,
            hourly_equivalent: rows.hourly[idx],
            location_subscore: engine.location_subscore(&ctx, rows, idx),
            age_hours: rows.age_days[idx] * 24.0,
            weekend_ok: rows.feature_bits[idx] & FeatureBits::WEEKEND_OK != 0,
            short_time: rows.feature_bits[idx] & FeatureBits::SHORT_TIME != 0,
            category_label: job.category_code.to_string(),
            min_salary: job.min_salary,
            is_fallback: false,
        }
    };

    let candidates: Vec<ScoredJob> = top.iter().map(to_scored).collect();
    let mut slate = match selector.select(&candidates, &work.user, now) {
        Ok(slate) => slate,
        Err(err) => return Err((user_id, err)),
    };

    let fallbacks;
    {
        let chosen: std::collections::HashSet<i64> =
            slate.iter_jobs().map(|j| j.job_id).collect();
        let leftovers: Vec<ScoredJob> = candidates
            .iter()
            .filter(|j| !chosen.contains(&j.job_id))
            .cloned()
            .collect();
        let now_epoch = now.timestamp();
        let mut popularity: HashMap<String, f32> = HashMap::new();
        for job in &leftovers {
            if let Some(p) = caches.popularity.get(&job.company_code, now_epoch) {
                popularity.insert(job.company_code.clone(), p.popularity_score);
            }
        }
        let supplemented = supplementer.fill(&mut slate, &work.user, &leftovers, &popularity);
        fallbacks = supplemented.synthetic as u64;
    }

    // Full breakdown rows for the slate only; synthetic items have no
    // backing job row and are not persisted.
    let index_of: HashMap<i64, usize> = top
        .iter()
        .map(|p| (rows.job_ids[p.job_idx as usize], p.job_idx as usize))
        .collect();
    let mut scores = Vec::with_capacity(slate.total());
    let mut job_vec = Vec::new();
    for item in slate.iter_jobs() {
        if item.is_fallback {
            continue;
        }
        if let Some(idx) = index_of.get(&item.job_id) {
            scores.push(engine.explain(&ctx, rows, *idx, &mut job_vec));
        }
    }

    Ok(UserSuccess {
        user_id,
        scores,
        slate,
        pairs,
        elapsed_ms: started.elapsed().as_millis() as u64,
        fallbacks,
        error_pairs,
        dedup_malformed: dedup_outcome.malformed_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::models::job::tests::test_job;
    use crate::models::user::AgeGroup;
    use crate::services::cache::AdjacencyCache;

    fn fixtures(jobs: Vec<Job>) -> (Arc<Vec<Job>>, Arc<JobRowSet>, Arc<CacheRegistry>) {
        let adjacency = AdjacencyCache::warm(
            vec![("13".into(), vec!["11".into(), "14".into()])],
            vec![(101, 100)],
        );
        let caches = Arc::new(CacheRegistry::new(adjacency));
        let rows = Arc::new(JobRowSet::build(&jobs, &caches.adjacency, Utc::now()));
        (Arc::new(jobs), rows, caches)
    }

    fn components() -> (
        Arc<ScoringEngine>,
        Arc<Deduplicator>,
        Arc<SectionSelector>,
        Arc<Supplementer>,
    ) {
        let cfg = test_config();
        (
            Arc::new(ScoringEngine::new(&cfg.scoring)),
            Arc::new(Deduplicator::new(cfg.scoring.dedup_window_days)),
            Arc::new(SectionSelector::new(cfg.sections.clone())),
            Arc::new(Supplementer::new(
                cfg.sections.total,
                cfg.sections.max_jobs_per_category,
            )),
        )
    }

    fn user() -> User {
        User {
            user_id: 7,
            email: "u7@example.com".into(),
            prefecture_code: Some("13".into()),
            city_code: None,
            age_group: Some(AgeGroup::TwentiesEarly),
            gender: None,
            preferred_categories: vec![100],
            preferred_salary_min: Some(1100),
            preferred_work_styles: vec![],
            experience_level: None,
            email_enabled: true,
            is_active: true,
        }
    }

    #[test]
    fn applied_company_never_reaches_slate() {
        let jobs: Vec<Job> = (1..=5)
            .map(|i| {
                let mut j = test_job(i);
                j.company_code = if i <= 2 { "C7".into() } else { format!("X{i}") };
                j
            })
            .collect();
        let (jobs, rows, caches) = fixtures(jobs);
        let (engine, dedup, selector, supplementer) = components();

        let history = vec![Application {
            user_id: 7,
            company_code: "C7".into(),
            applied_at: Some(Utc::now() - chrono::Duration::days(3)),
            category_code: None,
            salary: None,
            prefecture_code: None,
        }];
        let work = UserWork {
            user: user(),
            profile: None,
            history: Arc::new(history),
        };

        let mut buffers = ScoreBuffers::default();
        let result = process_user_inner(
            work,
            &jobs,
            &rows,
            &engine,
            &dedup,
            &selector,
            &supplementer,
            &caches,
            200,
            &mut buffers,
            Utc::now(),
        )
        .expect("user should process");

        assert!(result
            .slate
            .iter_jobs()
            .all(|j| j.company_code != "C7"));
        // Slate is topped up to 40 with synthetic items regardless.
        assert_eq!(result.slate.total(), 40);
        assert!(result.slate.fallback_count() >= 37);
    }

    #[test]
    fn small_pool_supplements_to_forty() {
        let jobs: Vec<Job> = (1..=12).map(test_job).collect();
        let (jobs, rows, caches) = fixtures(jobs);
        let (engine, dedup, selector, supplementer) = components();
        let work = UserWork {
            user: user(),
            profile: None,
            history: Arc::new(Vec::new()),
        };
        let mut buffers = ScoreBuffers::default();
        let result = process_user_inner(
            work,
            &jobs,
            &rows,
            &engine,
            &dedup,
            &selector,
            &supplementer,
            &caches,
            200,
            &mut buffers,
            Utc::now(),
        )
        .expect("user should process");

        assert_eq!(result.slate.total(), 40);
        assert_eq!(result.slate.fallback_count() as u64, result.fallbacks);
        assert!(result
            .slate
            .iter_jobs()
            .filter(|j| j.is_fallback)
            .all(|j| j.category_label == "General"));
        // Persisted rows cover only the real slate items.
        assert_eq!(result.scores.len(), 12);
    }

    #[test]
    fn persisted_scores_match_slate_members() {
        let jobs: Vec<Job> = (1..=60).map(test_job).collect();
        let (jobs, rows, caches) = fixtures(jobs);
        let (engine, dedup, selector, supplementer) = components();
        let work = UserWork {
            user: user(),
            profile: None,
            history: Arc::new(Vec::new()),
        };
        let mut buffers = ScoreBuffers::default();
        let result = process_user_inner(
            work,
            &jobs,
            &rows,
            &engine,
            &dedup,
            &selector,
            &supplementer,
            &caches,
            200,
            &mut buffers,
            Utc::now(),
        )
        .expect("user should process");

        let slate_ids: std::collections::HashSet<i64> = result
            .slate
            .iter_jobs()
            .filter(|j| !j.is_fallback)
            .map(|j| j.job_id)
            .collect();
        let score_ids: std::collections::HashSet<i64> =
            result.scores.iter().map(|s| s.job_id).collect();
        assert_eq!(slate_ids, score_ids);
    }
}
