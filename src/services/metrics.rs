use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::PerformanceTargets;
use crate::models::batch::{Alert, AlertSeverity, BatchRun};

/// In-process metrics fabric. Counters are relaxed atomics so the hot
/// paths never contend; maps serialize through short-held mutexes.
/// Alerts go out on a channel that the batch binary drains to storage.
pub struct MetricsHub {
    started: Instant,
    pairs_scored: AtomicU64,
    users_processed: AtomicU64,
    users_failed: AtomicU64,
    emails_queued: AtomicU64,
    emails_sent: AtomicU64,
    fallbacks_generated: AtomicU64,
    jobs_imported: AtomicU64,
    rows_rejected: AtomicU64,
    queue_depth: AtomicUsize,
    queue_capacity: AtomicUsize,
    scoring_ms: AtomicU64,
    error_histogram: Mutex<HashMap<String, u64>>,
    phase_durations_ms: Mutex<HashMap<String, i64>>,
    cache_hit_rate: Mutex<f64>,
    alert_tx: mpsc::UnboundedSender<Alert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub pairs_scored: u64,
    pub pairs_per_second: f64,
    pub users_processed: u64,
    pub users_failed: u64,
    pub emails_queued: u64,
    pub emails_sent: u64,
    pub fallbacks_generated: u64,
    pub jobs_imported: u64,
    pub rows_rejected: u64,
    pub queue_depth: usize,
    pub queue_utilization: f64,
    pub cache_hit_rate: f64,
    pub phase_durations_ms: HashMap<String, i64>,
    pub error_histogram: HashMap<String, u64>,
}

impl MetricsHub {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        (
            Self {
                started: Instant::now(),
                pairs_scored: AtomicU64::new(0),
                users_processed: AtomicU64::new(0),
                users_failed: AtomicU64::new(0),
                emails_queued: AtomicU64::new(0),
                emails_sent: AtomicU64::new(0),
                fallbacks_generated: AtomicU64::new(0),
                jobs_imported: AtomicU64::new(0),
                rows_rejected: AtomicU64::new(0),
                queue_depth: AtomicUsize::new(0),
                queue_capacity: AtomicUsize::new(0),
                scoring_ms: AtomicU64::new(0),
                error_histogram: Mutex::new(HashMap::new()),
                phase_durations_ms: Mutex::new(HashMap::new()),
                cache_hit_rate: Mutex::new(0.0),
                alert_tx,
            },
            alert_rx,
        )
    }

    pub fn mint_correlation_id() -> Uuid {
        Uuid::new_v4()
    }

    pub fn add_pairs_scored(&self, pairs: u64, elapsed_ms: u64) {
        self.pairs_scored.fetch_add(pairs, Ordering::Relaxed);
        self.scoring_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn user_processed(&self) {
        self.users_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn user_failed(&self) {
        self.users_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn emails_queued(&self, n: u64) {
        self.emails_queued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn email_sent(&self) {
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallbacks_generated(&self, n: u64) {
        self.fallbacks_generated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn jobs_imported(&self, n: u64) {
        self.jobs_imported.fetch_add(n, Ordering::Relaxed);
    }

    pub fn rows_rejected(&self, n: u64) {
        self.rows_rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_queue_gauge(&self, depth: usize, capacity: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.queue_capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn set_cache_hit_rate(&self, rate: f64) {
        *self.cache_hit_rate.lock().expect("metrics poisoned") = rate;
    }

    pub fn record_error(&self, kind: &str) {
        let mut histogram = self.error_histogram.lock().expect("metrics poisoned");
        *histogram.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_phase_duration(&self, phase: &str, ms: i64) {
        let mut durations = self.phase_durations_ms.lock().expect("metrics poisoned");
        durations.insert(phase.to_string(), ms);
    }

    /// Emit a typed alert. Logging happens here; persistence happens in
    /// whoever drains the channel.
    pub fn raise_alert(&self, batch_id: Option<Uuid>, severity: AlertSeverity, message: String) {
        match severity {
            AlertSeverity::High | AlertSeverity::Critical => {
                error!(severity = %severity, %message, "alert raised")
            }
            _ => warn!(severity = %severity, %message, "alert raised"),
        }
        let alert = Alert {
            batch_id,
            severity,
            message,
            timestamp: Utc::now(),
        };
        // Receiver gone means the process is shutting down; nothing to do.
        let _ = self.alert_tx.send(alert);
    }

    /// Threshold checks run at the end of every batch.
    pub fn check_run_thresholds(&self, run: &BatchRun, targets: &PerformanceTargets) {
        if let Some(ended) = run.ended_at {
            let runtime = (ended - run.started_at).num_seconds();
            if runtime > targets.total_runtime_secs as i64 {
                self.raise_alert(
                    Some(run.batch_id),
                    AlertSeverity::High,
                    format!(
                        "batch runtime {runtime}s exceeded target {}s",
                        targets.total_runtime_secs
                    ),
                );
            }
        }
        if run.counters.processed > 0 {
            let error_rate = run.counters.errors as f64 / run.counters.processed as f64;
            if error_rate > 0.10 {
                self.raise_alert(
                    Some(run.batch_id),
                    AlertSeverity::Critical,
                    format!("error rate {:.1}% exceeded 10%", error_rate * 100.0),
                );
            }
        }
        let hit_rate = *self.cache_hit_rate.lock().expect("metrics poisoned");
        if hit_rate > 0.0 && hit_rate < 0.90 {
            self.raise_alert(
                Some(run.batch_id),
                AlertSeverity::Medium,
                format!("cache hit rate {:.1}% below 90% goal", hit_rate * 100.0),
            );
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let pairs = self.pairs_scored.load(Ordering::Relaxed);
        let scoring_ms = self.scoring_ms.load(Ordering::Relaxed);
        let pairs_per_second = if scoring_ms > 0 {
            pairs as f64 / (scoring_ms as f64 / 1000.0)
        } else {
            0.0
        };
        let depth = self.queue_depth.load(Ordering::Relaxed);
        let capacity = self.queue_capacity.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            pairs_scored: pairs,
            pairs_per_second,
            users_processed: self.users_processed.load(Ordering::Relaxed),
            users_failed: self.users_failed.load(Ordering::Relaxed),
            emails_queued: self.emails_queued.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            fallbacks_generated: self.fallbacks_generated.load(Ordering::Relaxed),
            jobs_imported: self.jobs_imported.load(Ordering::Relaxed),
            rows_rejected: self.rows_rejected.load(Ordering::Relaxed),
            queue_depth: depth,
            queue_utilization: if capacity > 0 {
                depth as f64 / capacity as f64
            } else {
                0.0
            },
            cache_hit_rate: *self.cache_hit_rate.lock().expect("metrics poisoned"),
            phase_durations_ms: self
                .phase_durations_ms
                .lock()
                .expect("metrics poisoned")
                .clone(),
            error_histogram: self.error_histogram.lock().expect("metrics poisoned").clone(),
        }
    }
}
