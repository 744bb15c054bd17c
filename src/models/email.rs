use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Queued => "queued",
            EmailStatus::Sending => "sending",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EmailStatus::Queued),
            "sending" => Some(EmailStatus::Sending),
            "sent" => Some(EmailStatus::Sent),
            "failed" => Some(EmailStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One outbound digest email. Upserted on `(batch_id, user_id)` so a
/// retried queueing phase can never produce a second email for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    pub batch_id: Uuid,
    pub user_id: i64,
    pub email: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: EmailStatus,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}
