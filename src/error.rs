use thiserror::Error;
use uuid::Uuid;

use crate::models::batch::Phase;

/// Top-level error for the batch engine. Components surface only the
/// variants they can produce; anything unrecoverable bubbles up to the
/// phase runner, which decides retry-from-checkpoint, skip, or fail.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("validation error ({field}): {detail}")]
    Validation { field: String, detail: String },

    #[error("scoring failed for user {user_id} job {job_id}: {detail}")]
    Scoring {
        user_id: i64,
        job_id: i64,
        detail: String,
    },

    #[error("section invariant violated for user {user_id}: {detail}")]
    Section { user_id: i64, detail: String },

    #[error("phase {phase} timed out after {elapsed_s}s")]
    Timeout { phase: Phase, elapsed_s: u64 },

    #[error("dependency not satisfied: {0}")]
    Dependency(String),

    #[error("batch {0} cancelled")]
    Cancelled(Uuid),

    #[error("phase {phase} failed: {detail}")]
    Phase { phase: Phase, detail: String },

    #[error("batch {batch_id} ended {detail}")]
    BatchFailed { batch_id: Uuid, detail: String },
}

/// Repository failures, split by whether a retry can help.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("transient repository error: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("permanent repository error{}: {detail}", row_hint(.row_id))]
    Permanent {
        detail: String,
        row_id: Option<i64>,
    },
}

fn row_hint(row_id: &Option<i64>) -> String {
    match row_id {
        Some(id) => format!(" (row {id})"),
        None => String::new(),
    }
}

impl RepoError {
    /// Classify a driver error. Constraint and data errors will not be
    /// fixed by retrying; everything else is assumed transient.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                // 23xxx = integrity constraint violation, 22xxx = data exception
                if code.starts_with("23") || code.starts_with("22") {
                    RepoError::Permanent {
                        detail: db.message().to_string(),
                        row_id: None,
                    }
                } else {
                    RepoError::Transient(err)
                }
            }
            sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) => RepoError::Permanent {
                detail: err.to_string(),
                row_id: None,
            },
            _ => RepoError::Transient(err),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Transient(_))
    }
}

impl BatchError {
    /// Whether the phase runner may retry the surrounding unit of work.
    pub fn retryable(&self) -> bool {
        match self {
            BatchError::Repo(e) => e.is_transient(),
            BatchError::Timeout { .. } | BatchError::BatchFailed { .. } => true,
            BatchError::Config(_)
            | BatchError::Validation { .. }
            | BatchError::Section { .. }
            | BatchError::Scoring { .. }
            | BatchError::Dependency(_)
            | BatchError::Cancelled(_)
            | BatchError::Phase { .. } => false,
        }
    }

    /// Bucket key for the per-run error histogram.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::Config(_) => "config",
            BatchError::Repo(RepoError::Transient(_)) => "repo_transient",
            BatchError::Repo(RepoError::Permanent { .. }) => "repo_permanent",
            BatchError::Validation { .. } => "validation",
            BatchError::Scoring { .. } => "scoring",
            BatchError::Section { .. } => "section",
            BatchError::Timeout { .. } => "timeout",
            BatchError::Dependency(_) => "dependency",
            BatchError::Cancelled(_) => "cancelled",
            BatchError::Phase { .. } => "phase",
            BatchError::BatchFailed { .. } => "batch",
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
