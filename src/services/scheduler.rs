use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{BatchError, Result};
use crate::models::batch::AlertSeverity;
use crate::services::metrics::MetricsHub;

pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type JobFn = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// Handed to every job execution. Jobs are expected to poll `cancel`
/// at their suspension points; a cancelled job must not write partial
/// output past its last checkpoint.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub run_id: Uuid,
    pub attempt: u32,
    pub cancel: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    Low = 1,
    Normal = 5,
    High = 10,
    Critical = 15,
}

#[derive(Debug, Clone)]
pub enum Trigger {
    Cron { schedule: Box<Schedule>, timezone: Tz },
    Interval { period: Duration },
}

impl Trigger {
    /// Five-field cron line (minute hour day month weekday) in an IANA
    /// zone. The underlying parser wants a seconds field; pin it to 0.
    pub fn cron(expr: &str, timezone: Tz) -> Result<Self> {
        let with_seconds = format!("0 {}", expr.trim());
        let schedule: Schedule = with_seconds
            .parse()
            .map_err(|e| BatchError::Config(format!("bad cron expression {expr:?}: {e}")))?;
        Ok(Trigger::Cron {
            schedule: Box::new(schedule),
            timezone,
        })
    }

    pub fn interval(period: Duration) -> Self {
        Trigger::Interval { period }
    }

    fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron { schedule, timezone } => schedule
                .after(&after.with_timezone(timezone))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Trigger::Interval { period } => {
                Some(after + chrono::Duration::from_std(*period).unwrap_or_default())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries,
            backoff_factor: cfg.retry_backoff_factor,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(cfg.retry_max_delay_secs),
        }
    }

    /// delay(k) = min(max_delay, base * factor^k)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub memory_mb: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct JobSpec {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub func: JobFn,
    pub enabled: bool,
    pub priority: JobPriority,
    pub max_instances: u32,
    pub dependencies: HashSet<String>,
    pub retry: RetryPolicy,
    pub limits: ResourceLimits,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    RetryScheduled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
            JobState::RetryScheduled => "retry_scheduled",
        }
    }
}

struct JobRuntime {
    spec: JobSpec,
    paused: bool,
    state: JobState,
    next_fire: Option<DateTime<Utc>>,
    /// When the current due period began; priority ties break on this.
    due_since: Option<DateTime<Utc>>,
    last_completed: Option<DateTime<Utc>>,
    running: u32,
    attempt: u32,
    retry_at: Option<DateTime<Utc>>,
    misfires: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub state: &'static str,
    pub paused: bool,
    pub running: u32,
    pub attempt: u32,
    pub misfires: u64,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_completed: Option<DateTime<Utc>>,
}

enum Completion {
    Finished { job_id: String, run_id: Uuid },
    Failed { job_id: String, run_id: Uuid, error: String },
    TimedOut { job_id: String, run_id: Uuid },
    Cancelled { job_id: String, run_id: Uuid },
}

/// Cooperative in-process scheduler: cron and interval triggers, a
/// dependency DAG, priority dispatch under a global concurrency cap,
/// retry with exponential backoff, and a process resource guard.
pub struct Scheduler {
    cfg: SchedulerConfig,
    metrics: Arc<MetricsHub>,
    jobs: Mutex<HashMap<String, JobRuntime>>,
    running_total: AtomicUsize,
    run_cancels: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    shutdown_tx: watch::Sender<bool>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig, metrics: Arc<MetricsHub>) -> Arc<Self> {
        Self::with_tick(cfg, metrics, Duration::from_millis(500))
    }

    pub fn with_tick(
        cfg: SchedulerConfig,
        metrics: Arc<MetricsHub>,
        tick_interval: Duration,
    ) -> Arc<Self> {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            metrics,
            jobs: Mutex::new(HashMap::new()),
            running_total: AtomicUsize::new(0),
            run_cancels: Mutex::new(HashMap::new()),
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
            shutdown_tx,
            tick_interval,
        })
    }

    pub fn add_job(&self, spec: JobSpec) {
        let now = Utc::now();
        let next_fire = spec.trigger.next_fire(now);
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        info!(job_id = %spec.id, name = %spec.name, ?next_fire, "job registered");
        jobs.insert(
            spec.id.clone(),
            JobRuntime {
                spec,
                paused: false,
                state: JobState::Pending,
                next_fire,
                due_since: None,
                last_completed: None,
                running: 0,
                attempt: 0,
                retry_at: None,
                misfires: 0,
            },
        );
    }

    pub fn pause(&self, job_id: &str) -> bool {
        self.set_paused(job_id, true)
    }

    pub fn resume(&self, job_id: &str) -> bool {
        self.set_paused(job_id, false)
    }

    fn set_paused(&self, job_id: &str, paused: bool) -> bool {
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.paused = paused;
                true
            }
            None => false,
        }
    }

    /// Force a job due on the next tick, ahead of its trigger.
    pub fn run_now(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        match jobs.get_mut(job_id) {
            Some(job) => {
                let now = Utc::now();
                job.next_fire = Some(now);
                job.due_since = Some(now);
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().expect("scheduler poisoned");
        let mut statuses: Vec<JobStatus> = jobs
            .values()
            .map(|j| JobStatus {
                id: j.spec.id.clone(),
                name: j.spec.name.clone(),
                state: j.state.as_str(),
                paused: j.paused,
                running: j.running,
                attempt: j.attempt,
                misfires: j.misfires,
                next_fire: j.next_fire,
                last_completed: j.last_completed,
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn running_total(&self) -> usize {
        self.running_total.load(Ordering::SeqCst)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Main loop. Returns after a graceful shutdown completes.
    pub async fn run(self: Arc<Self>) {
        let mut completion_rx = self
            .completion_rx
            .lock()
            .expect("scheduler poisoned")
            .take()
            .expect("scheduler run() called twice");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            max_concurrent = self.cfg.max_concurrent_jobs,
            tz = %self.cfg.timezone,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch_ready();
                }
                Some(completion) = completion_rx.recv() => {
                    self.apply_completion(completion);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain_on_shutdown(&mut completion_rx).await;
        info!("scheduler stopped");
    }

    /// Begin a graceful shutdown: stop admitting, wait out the grace
    /// period, then cancel stragglers.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn drain_on_shutdown(&self, completion_rx: &mut mpsc::UnboundedReceiver<Completion>) {
        let grace = Duration::from_secs(self.cfg.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        info!(grace_secs = grace.as_secs(), "waiting for running jobs");

        while self.running_total() > 0 && tokio::time::Instant::now() < deadline {
            tokio::select! {
                Some(completion) = completion_rx.recv() => self.apply_completion(completion),
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        if self.running_total() > 0 {
            warn!(
                still_running = self.running_total(),
                "grace period expired, cancelling"
            );
            {
                let cancels = self.run_cancels.lock().expect("scheduler poisoned");
                for tx in cancels.values() {
                    let _ = tx.send(true);
                }
            }
            let hard_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while self.running_total() > 0 && tokio::time::Instant::now() < hard_deadline {
                tokio::select! {
                    Some(completion) = completion_rx.recv() => self.apply_completion(completion),
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        }
    }

    /// One dispatch pass: compute the ready set, order it, admit what
    /// the concurrency budget allows.
    fn dispatch_ready(&self) {
        let now = Utc::now();
        let mut to_spawn: Vec<(JobSpec, u32)> = Vec::new();
        {
            let mut jobs = self.jobs.lock().expect("scheduler poisoned");

            let completed: HashSet<String> = jobs
                .iter()
                .filter(|(_, j)| j.state == JobState::Completed)
                .map(|(id, _)| id.clone())
                .collect();

            let mut ready: Vec<(String, JobPriority, DateTime<Utc>)> = Vec::new();
            for (id, job) in jobs.iter_mut() {
                if !job.spec.enabled || job.paused {
                    continue;
                }

                let retry_due = job.retry_at.map(|t| t <= now).unwrap_or(false);
                let trigger_due = job.next_fire.map(|t| t <= now).unwrap_or(false);
                if !retry_due && !trigger_due {
                    continue;
                }

                if trigger_due && job.running >= job.spec.max_instances {
                    // The previous instance is still going; coalesce the
                    // missed fire instead of stacking a second instance.
                    job.misfires += 1;
                    job.next_fire = job.spec.trigger.next_fire(now);
                    debug!(job_id = %id, misfires = job.misfires, "misfire coalesced");
                    continue;
                }

                if !job.spec.dependencies.is_empty()
                    && !job.spec.dependencies.iter().all(|d| completed.contains(d))
                {
                    // DependencyError by taxonomy: stays pending.
                    continue;
                }

                let due_since = if retry_due {
                    job.retry_at.unwrap_or(now)
                } else {
                    *job.due_since.get_or_insert(job.next_fire.unwrap_or(now))
                };
                ready.push((id.clone(), job.spec.priority, due_since));
            }

            ready.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

            let mut budget = self
                .cfg
                .max_concurrent_jobs
                .saturating_sub(self.running_total());
            for (id, _, _) in ready {
                if budget == 0 {
                    break;
                }
                let job = jobs.get_mut(&id).expect("ready job present");
                let retry_run = job.retry_at.map(|t| t <= now).unwrap_or(false);
                if retry_run {
                    job.retry_at = None;
                } else {
                    let grace = chrono::Duration::seconds(self.cfg.misfire_grace_secs as i64);
                    if let Some(fire) = job.next_fire {
                        if now - fire > grace && job.spec.coalesce {
                            // Collapse every missed fire into this run.
                            let mut skipped = 0u64;
                            let mut next = job.spec.trigger.next_fire(fire);
                            while let Some(t) = next {
                                if t > now {
                                    break;
                                }
                                skipped += 1;
                                next = job.spec.trigger.next_fire(t);
                            }
                            job.misfires += skipped;
                        }
                    }
                    job.next_fire = job.spec.trigger.next_fire(now);
                    job.due_since = None;
                }
                job.state = JobState::Running;
                job.running += 1;
                self.running_total.fetch_add(1, Ordering::SeqCst);
                budget -= 1;
                to_spawn.push((job.spec.clone(), job.attempt));
            }
        }

        for (spec, attempt) in to_spawn {
            self.spawn_execution(spec, attempt);
        }
    }

    fn spawn_execution(&self, spec: JobSpec, attempt: u32) {
        let run_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.run_cancels
            .lock()
            .expect("scheduler poisoned")
            .insert(run_id, cancel_tx.clone());

        let ctx = JobContext {
            job_id: spec.id.clone(),
            run_id,
            attempt,
            cancel: cancel_rx,
        };
        let completion_tx = self.completion_tx.clone();
        let timeout = spec.limits.timeout;
        let limits = spec.limits.clone();
        let monitoring = self.cfg.resource_monitoring_enabled;
        let job_id = spec.id.clone();
        info!(%job_id, %run_id, attempt, "job dispatched");

        tokio::spawn(async move {
            let fut = (spec.func)(ctx);
            tokio::pin!(fut);

            let guard = tokio::spawn(resource_guard(limits, monitoring, cancel_tx.clone()));

            let outcome = match timeout {
                Some(limit) => {
                    tokio::select! {
                        res = &mut fut => finish_outcome(&job_id, run_id, res),
                        _ = tokio::time::sleep(limit) => {
                            let _ = cancel_tx.send(true);
                            // Short window to unwind cleanly, then drop.
                            match tokio::time::timeout(Duration::from_secs(5), &mut fut).await {
                                Ok(_) | Err(_) => Completion::TimedOut {
                                    job_id: job_id.clone(),
                                    run_id,
                                },
                            }
                        }
                    }
                }
                None => {
                    let res = fut.await;
                    finish_outcome(&job_id, run_id, res)
                }
            };
            guard.abort();
            let _ = completion_tx.send(outcome);
        });
    }

    fn apply_completion(&self, completion: Completion) {
        let (job_id, run_id, next_state, error) = match completion {
            Completion::Finished { job_id, run_id } => (job_id, run_id, JobState::Completed, None),
            Completion::Failed {
                job_id,
                run_id,
                error,
            } => (job_id, run_id, JobState::Failed, Some(error)),
            Completion::TimedOut { job_id, run_id } => (job_id, run_id, JobState::TimedOut, None),
            Completion::Cancelled { job_id, run_id } => {
                (job_id, run_id, JobState::Cancelled, None)
            }
        };
        self.run_cancels
            .lock()
            .expect("scheduler poisoned")
            .remove(&run_id);
        self.running_total.fetch_sub(1, Ordering::SeqCst);

        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        job.running = job.running.saturating_sub(1);
        job.state = next_state;

        match next_state {
            JobState::Completed => {
                job.attempt = 0;
                job.last_completed = Some(Utc::now());
                debug!(%job_id, "job completed");
            }
            JobState::Failed | JobState::TimedOut => {
                let detail = error.unwrap_or_else(|| "timeout".into());
                warn!(%job_id, attempt = job.attempt, detail, "job run failed");
                if self.cfg.retry_enabled && job.attempt < job.spec.retry.max_attempts {
                    let delay = job.spec.retry.delay_for(job.attempt);
                    job.retry_at = Some(
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                    );
                    job.attempt += 1;
                    job.state = JobState::RetryScheduled;
                } else {
                    self.metrics.raise_alert(
                        None,
                        AlertSeverity::High,
                        format!("job {job_id} exhausted retries: {detail}"),
                    );
                }
            }
            JobState::Cancelled => {
                debug!(%job_id, "job run cancelled");
            }
            _ => {}
        }
    }
}

fn finish_outcome(job_id: &str, run_id: Uuid, res: Result<()>) -> Completion {
    match res {
        Ok(()) => Completion::Finished {
            job_id: job_id.to_string(),
            run_id,
        },
        Err(BatchError::Cancelled(_)) => Completion::Cancelled {
            job_id: job_id.to_string(),
            run_id,
        },
        Err(e) => Completion::Failed {
            job_id: job_id.to_string(),
            run_id,
            error: e.to_string(),
        },
    }
}

/// Polls process RSS and CPU while a job runs; a sustained breach
/// cancels the run. The measurements are process-wide, which is the
/// right granularity for a single-pipeline worker.
async fn resource_guard(limits: ResourceLimits, enabled: bool, cancel_tx: watch::Sender<bool>) {
    if !enabled || (limits.memory_mb.is_none() && limits.cpu_percent.is_none()) {
        return;
    }
    const POLL: Duration = Duration::from_secs(2);
    const BREACHES_BEFORE_CANCEL: u32 = 3;
    let mut breaches = 0u32;
    let mut last_cpu: Option<(u64, std::time::Instant)> = None;

    loop {
        tokio::time::sleep(POLL).await;
        let Some(sample) = sample_process() else {
            continue;
        };

        let mut breached = false;
        if let Some(cap) = limits.memory_mb {
            if sample.rss_mb > cap {
                breached = true;
            }
        }
        if let Some(cap) = limits.cpu_percent {
            if let Some((prev_ticks, prev_at)) = last_cpu {
                let elapsed = prev_at.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let tick_hz = 100.0;
                    let used =
                        (sample.cpu_ticks.saturating_sub(prev_ticks)) as f64 / tick_hz / elapsed;
                    if used * 100.0 > cap {
                        breached = true;
                    }
                }
            }
            last_cpu = Some((sample.cpu_ticks, std::time::Instant::now()));
        }

        if breached {
            breaches += 1;
            if breaches >= BREACHES_BEFORE_CANCEL {
                error!(rss_mb = sample.rss_mb, "resource limit breached, cancelling job");
                let _ = cancel_tx.send(true);
                return;
            }
        } else {
            breaches = 0;
        }
    }
}

struct ProcessSample {
    rss_mb: u64,
    cpu_ticks: u64,
}

#[cfg(target_os = "linux")]
fn sample_process() -> Option<ProcessSample> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_kb = 4;
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let fields: Vec<&str> = stat.split_whitespace().collect();
    let utime: u64 = fields.get(13)?.parse().ok()?;
    let stime: u64 = fields.get(14)?.parse().ok()?;
    Some(ProcessSample {
        rss_mb: rss_pages * page_kb / 1024,
        cpu_ticks: utime + stime,
    })
}

#[cfg(not(target_os = "linux"))]
fn sample_process() -> Option<ProcessSample> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    fn test_scheduler(max_concurrent: usize) -> Arc<Scheduler> {
        let mut cfg = test_config().scheduler;
        cfg.max_concurrent_jobs = max_concurrent;
        cfg.shutdown_grace_secs = 1;
        let (metrics, _rx) = MetricsHub::new();
        Scheduler::with_tick(cfg, Arc::new(metrics), Duration::from_millis(10))
    }

    fn noop_spec(id: &str, priority: JobPriority) -> JobSpec {
        JobSpec {
            id: id.into(),
            name: id.into(),
            trigger: Trigger::interval(Duration::from_secs(3600)),
            func: Arc::new(|_ctx| Box::pin(async { Ok(()) })),
            enabled: true,
            priority,
            max_instances: 1,
            dependencies: HashSet::new(),
            retry: RetryPolicy {
                max_attempts: 0,
                backoff_factor: 2.0,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
            limits: ResourceLimits::default(),
            coalesce: true,
        }
    }

    #[test]
    fn retry_delay_follows_backoff_curve() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_factor: 2.0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn cron_trigger_parses_five_fields_in_zone() {
        let trigger = Trigger::cron("0 3 * * *", chrono_tz::Asia::Tokyo).unwrap();
        let fire = trigger.next_fire(Utc::now()).unwrap();
        let local = fire.with_timezone(&chrono_tz::Asia::Tokyo);
        assert_eq!(local.format("%H:%M").to_string(), "03:00");
    }

    #[test]
    fn bad_cron_is_config_error() {
        assert!(Trigger::cron("not a cron", chrono_tz::UTC).is_err());
    }

    #[tokio::test]
    async fn priority_and_dependencies_drive_dispatch_order() {
        let scheduler = test_scheduler(2);
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let record = |log: Arc<Mutex<Vec<String>>>, id: &'static str| -> JobFn {
            Arc::new(move |_ctx| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(id.to_string());
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
            })
        };

        let mut a = noop_spec("a", JobPriority::High);
        a.func = record(log.clone(), "a");
        let mut b = noop_spec("b", JobPriority::Normal);
        b.dependencies = HashSet::from(["a".to_string()]);
        b.func = record(log.clone(), "b");
        let mut c = noop_spec("c", JobPriority::Critical);
        c.func = record(log.clone(), "c");

        scheduler.add_job(a);
        scheduler.add_job(b);
        scheduler.add_job(c);

        let runner = tokio::spawn(scheduler.clone().run());
        scheduler.run_now("a");
        scheduler.run_now("b");
        scheduler.run_now("c");

        tokio::time::sleep(Duration::from_millis(400)).await;
        scheduler.shutdown();
        let _ = runner.await;

        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["c", "a", "b"], "dispatch order wrong: {order:?}");
    }

    #[tokio::test]
    async fn concurrency_cap_is_never_exceeded() {
        let scheduler = test_scheduler(2);
        let peak: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let active: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let peak = peak.clone();
            let active = active.clone();
            let mut spec = noop_spec(&format!("job{i}"), JobPriority::Normal);
            spec.func = Arc::new(move |_ctx| {
                let peak = peak.clone();
                let active = active.clone();
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    {
                        let mut p = peak.lock().unwrap();
                        *p = (*p).max(now);
                    }
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            scheduler.add_job(spec);
        }

        let runner = tokio::spawn(scheduler.clone().run());
        for i in 0..5 {
            scheduler.run_now(&format!("job{i}"));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        scheduler.shutdown();
        let _ = runner.await;

        assert!(*peak.lock().unwrap() <= 2, "cap exceeded: {}", peak.lock().unwrap());
    }

    #[tokio::test]
    async fn failed_job_schedules_retry_with_backoff() {
        let scheduler = test_scheduler(2);
        let mut spec = noop_spec("flaky", JobPriority::Normal);
        spec.retry.max_attempts = 3;
        spec.func = Arc::new(|_ctx| {
            Box::pin(async {
                Err(BatchError::Phase {
                    phase: crate::models::batch::Phase::Import,
                    detail: "boom".into(),
                })
            })
        });
        scheduler.add_job(spec);

        let runner = tokio::spawn(scheduler.clone().run());
        scheduler.run_now("flaky");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = scheduler.status();
        let flaky = status.iter().find(|s| s.id == "flaky").unwrap();
        assert_eq!(flaky.state, "retry_scheduled");
        assert_eq!(flaky.attempt, 1);

        scheduler.shutdown();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn timeout_converts_to_cancellation() {
        let scheduler = test_scheduler(2);
        let mut spec = noop_spec("slow", JobPriority::Normal);
        spec.limits.timeout = Some(Duration::from_millis(50));
        spec.retry.max_attempts = 0;
        spec.func = Arc::new(|ctx| {
            Box::pin(async move {
                let mut cancel = ctx.cancel;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                    _ = cancel.changed() => Err(BatchError::Cancelled(Uuid::nil())),
                }
            })
        });
        scheduler.add_job(spec);

        let runner = tokio::spawn(scheduler.clone().run());
        scheduler.run_now("slow");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = scheduler.status();
        let slow = status.iter().find(|s| s.id == "slow").unwrap();
        assert_eq!(slow.state, "timed_out");
        assert_eq!(scheduler.running_total(), 0);

        scheduler.shutdown();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn paused_job_never_runs() {
        let scheduler = test_scheduler(2);
        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let mut spec = noop_spec("paused", JobPriority::Normal);
        let ran_clone = ran.clone();
        spec.func = Arc::new(move |_ctx| {
            let ran = ran_clone.clone();
            Box::pin(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        scheduler.add_job(spec);
        scheduler.pause("paused");

        let runner = tokio::spawn(scheduler.clone().run());
        scheduler.run_now("paused");
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown();
        let _ = runner.await;

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
