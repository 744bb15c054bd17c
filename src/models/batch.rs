use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline phases, executed strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Import,
    Matching,
    EmailQueue,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Init,
        Phase::Import,
        Phase::Matching,
        Phase::EmailQueue,
        Phase::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Import => "import",
            Phase::Matching => "matching",
            Phase::EmailQueue => "email_queue",
            Phase::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "running" => Some(BatchStatus::Running),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: u64,
    pub errors: u64,
}

/// One end-to-end nightly execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub phase_times: HashMap<String, PhaseTiming>,
    pub counters: RunCounters,
    pub error_summary: HashMap<String, u64>,
}

impl BatchRun {
    pub fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            started_at: Utc::now(),
            ended_at: None,
            status: BatchStatus::Pending,
            phase_times: HashMap::new(),
            counters: RunCounters::default(),
            error_summary: HashMap::new(),
        }
    }

    pub fn start_phase(&mut self, phase: Phase) {
        self.phase_times.insert(
            phase.as_str().to_string(),
            PhaseTiming {
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: None,
            },
        );
    }

    pub fn end_phase(&mut self, phase: Phase) {
        if let Some(t) = self.phase_times.get_mut(phase.as_str()) {
            let ended = Utc::now();
            t.duration_ms = Some((ended - t.started_at).num_milliseconds());
            t.ended_at = Some(ended);
        }
    }

    pub fn record_error(&mut self, kind: &str) {
        *self.error_summary.entry(kind.to_string()).or_insert(0) += 1;
        self.counters.errors += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.counters.processed == 0 {
            return 1.0;
        }
        1.0 - self.counters.errors as f64 / self.counters.processed as f64
    }
}

/// Durable restart marker. The payload is small on purpose: restoring a
/// run must be a constant-time read, not a replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: Uuid,
    pub phase: Phase,
    pub at: DateTime<Utc>,
    pub payload: CheckpointPayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// Highest user_id whose results are durably persisted. Resume
    /// starts strictly after this id.
    pub frontier_user_id: Option<i64>,
    pub processed: u64,
    pub failed: u64,
    pub emails_queued: u64,
    /// Set by the end-of-phase checkpoint; a restart skips phases that
    /// carry this marker.
    #[serde(default)]
    pub phase_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operational alert record handed to external notifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub batch_id: Option<Uuid>,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
