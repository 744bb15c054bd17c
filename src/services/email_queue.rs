use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::repository::Repository;
use crate::error::{BatchError, Result};
use crate::models::batch::{Checkpoint, CheckpointPayload, Phase};
use crate::models::email::{EmailRecord, EmailStatus};
use crate::models::matching::SectionSlate;
use crate::models::user::User;
use crate::services::copywriter::Copywriter;
use crate::services::email_renderer::EmailRenderer;
use crate::services::matching::SlateStore;
use crate::services::metrics::MetricsHub;
use crate::services::sections::SectionSelector;
use crate::services::supplement::Supplementer;

/// Minimum lead time, in minutes, before the first delivery attempt.
const SEND_DELAY_MINUTES: i64 = 60;

#[derive(Debug, Default)]
pub struct EmailQueueOutcome {
    pub queued: u64,
    pub skipped_no_results: u64,
    pub frontier: Option<i64>,
}

/// Turns per-user slates into queued digest emails. Idempotent by
/// construction: rows upsert on `(batch_id, user_id)`, and the phase
/// walks users in id order from a checkpointed frontier, so a retry or
/// restart can only re-write identical rows, never add a second email
/// for a user.
pub struct EmailQueueService {
    repo: Arc<dyn Repository>,
    renderer: Arc<EmailRenderer>,
    copywriter: Arc<Copywriter>,
    selector: Arc<SectionSelector>,
    supplementer: Arc<Supplementer>,
    metrics: Arc<MetricsHub>,
    batch_size: usize,
    checkpoint_interval: usize,
}

impl EmailQueueService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        renderer: Arc<EmailRenderer>,
        copywriter: Arc<Copywriter>,
        selector: Arc<SectionSelector>,
        supplementer: Arc<Supplementer>,
        metrics: Arc<MetricsHub>,
        batch_size: usize,
        checkpoint_interval: usize,
    ) -> Self {
        Self {
            repo,
            renderer,
            copywriter,
            selector,
            supplementer,
            metrics,
            batch_size: batch_size.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    pub async fn run(
        &self,
        batch_id: Uuid,
        correlation_id: Uuid,
        slates: SlateStore,
        resume_after: Option<i64>,
        cancel: watch::Receiver<bool>,
    ) -> Result<EmailQueueOutcome> {
        let mut outcome = EmailQueueOutcome {
            frontier: resume_after,
            ..Default::default()
        };
        if let Some(frontier) = resume_after {
            info!(%batch_id, frontier, "resuming email queueing after frontier");
        }
        let scheduled_for = Utc::now() + Duration::minutes(SEND_DELAY_MINUTES);
        let mut since_checkpoint = 0usize;

        loop {
            if *cancel.borrow() || self.repo.is_cancel_requested(batch_id).await? {
                return Err(BatchError::Cancelled(batch_id));
            }
            let after = outcome.frontier.unwrap_or(0);
            let users = self
                .repo
                .load_active_users(after, self.batch_size as i64)
                .await?;
            if users.is_empty() {
                break;
            }
            outcome.frontier = users.last().map(|u| u.user_id);

            let user_slates = self.resolve_slates(batch_id, &users, &slates).await?;
            let mut records = Vec::with_capacity(user_slates.len());
            for (user, slate) in &user_slates {
                let subject = self.copywriter.subject_for(user, slate).await;
                let (body_text, body_html) =
                    self.renderer.render(user, slate, correlation_id)?;
                records.push(EmailRecord {
                    batch_id,
                    user_id: user.user_id,
                    email: user.email.clone(),
                    subject,
                    body_text,
                    body_html,
                    scheduled_for,
                    status: EmailStatus::Queued,
                    correlation_id,
                    created_at: Utc::now(),
                });
            }
            outcome.skipped_no_results += (users.len() - user_slates.len()) as u64;

            if !records.is_empty() {
                let written = self.repo.write_email_queue(&records).await?;
                outcome.queued += records.len() as u64;
                self.metrics.emails_queued(records.len() as u64);
                debug!(%batch_id, written, "email chunk queued");
            }

            since_checkpoint += users.len();
            if since_checkpoint >= self.checkpoint_interval {
                self.write_checkpoint(batch_id, &outcome).await?;
                since_checkpoint = 0;
            }
            tokio::task::yield_now().await;
        }

        self.write_checkpoint(batch_id, &outcome).await?;
        Ok(outcome)
    }

    /// Prefer the in-memory slates from this process's matching pass;
    /// after a restart, rebuild deterministically from persisted scores.
    async fn resolve_slates(
        &self,
        batch_id: Uuid,
        users: &[User],
        slates: &SlateStore,
    ) -> Result<Vec<(User, SectionSlate)>> {
        let mut resolved = Vec::with_capacity(users.len());
        let mut missing: Vec<&User> = Vec::new();
        {
            let store = slates.lock().expect("slate store poisoned");
            for user in users {
                match store.get(&user.user_id) {
                    Some(slate) => resolved.push((user.clone(), slate.clone())),
                    None => missing.push(user),
                }
            }
        }
        if missing.is_empty() {
            return Ok(resolved);
        }

        let missing_ids: Vec<i64> = missing.iter().map(|u| u.user_id).collect();
        let mut persisted = self.repo.load_scored_jobs(batch_id, &missing_ids).await?;
        let now = Utc::now();
        for user in missing {
            let Some(candidates) = persisted.remove(&user.user_id) else {
                // Never matched in this batch (failed or filtered); no email.
                continue;
            };
            match self.selector.select(&candidates, user, now) {
                Ok(mut slate) => {
                    self.supplementer
                        .fill(&mut slate, user, &[], &HashMap::new());
                    resolved.push((user.clone(), slate));
                }
                Err(e) => {
                    warn!(user_id = user.user_id, error = %e, "slate rebuild failed, skipping user");
                }
            }
        }
        resolved.sort_by_key(|(user, _)| user.user_id);
        Ok(resolved)
    }

    async fn write_checkpoint(&self, batch_id: Uuid, outcome: &EmailQueueOutcome) -> Result<()> {
        self.repo
            .write_checkpoint(&Checkpoint {
                batch_id,
                phase: Phase::EmailQueue,
                at: Utc::now(),
                payload: CheckpointPayload {
                    frontier_user_id: outcome.frontier,
                    processed: outcome.queued,
                    emails_queued: outcome.queued,
                    ..Default::default()
                },
            })
            .await
    }
}
