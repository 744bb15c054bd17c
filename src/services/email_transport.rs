use std::sync::Arc;

use chrono::Utc;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use crate::config::EmailConfig;
use crate::db::repository::Repository;
use crate::error::{BatchError, Result};
use crate::models::email::{EmailRecord, EmailStatus};
use crate::services::metrics::MetricsHub;

/// SMTP when configured, log-only otherwise (local and staging runs).
pub enum MailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    LogOnly,
}

impl MailTransport {
    pub fn from_config(cfg: &EmailConfig) -> Result<Self> {
        let Some(host) = &cfg.smtp_host else {
            return Ok(MailTransport::LogOnly);
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| BatchError::Config(format!("bad SMTP relay {host}: {e}")))?
            .port(cfg.smtp_port);
        if let (Some(user), Some(pass)) = (&cfg.smtp_username, &cfg.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(MailTransport::Smtp(builder.build()))
    }
}

#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub claimed: usize,
    pub sent: u64,
    pub failed: u64,
}

/// Drains due rows from the email queue and hands them to SMTP. Runs as
/// its own scheduler job, decoupled from the nightly pipeline.
pub struct EmailDeliveryService {
    repo: Arc<dyn Repository>,
    transport: MailTransport,
    metrics: Arc<MetricsHub>,
    from: Mailbox,
    batch_size: i64,
}

impl EmailDeliveryService {
    pub fn new(
        repo: Arc<dyn Repository>,
        transport: MailTransport,
        metrics: Arc<MetricsHub>,
        cfg: &EmailConfig,
    ) -> Result<Self> {
        let from: Mailbox = format!("{} <{}>", cfg.from_name, cfg.from_email)
            .parse()
            .map_err(|e| BatchError::Config(format!("bad FROM address: {e}")))?;
        Ok(Self {
            repo,
            transport,
            metrics,
            from,
            batch_size: cfg.send_batch_size as i64,
        })
    }

    pub async fn deliver_due(&self) -> Result<DeliveryReport> {
        let due = self.repo.claim_due_emails(Utc::now(), self.batch_size).await?;
        let mut report = DeliveryReport {
            claimed: due.len(),
            ..Default::default()
        };

        // SMTP round trips dominate here; a few in flight at once keeps
        // the drain pass short without hammering the relay.
        let results = futures_util::future::join_all(due.iter().map(|r| self.send_one(r))).await;
        for (record, result) in due.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.repo
                        .mark_email_status(
                            record.batch_id,
                            record.user_id,
                            EmailStatus::Sent,
                            None,
                        )
                        .await?;
                    self.metrics.email_sent();
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(
                        user_id = record.user_id,
                        correlation_id = %record.correlation_id,
                        error = %e,
                        "digest delivery failed"
                    );
                    self.repo
                        .mark_email_status(
                            record.batch_id,
                            record.user_id,
                            EmailStatus::Failed,
                            Some(&e),
                        )
                        .await?;
                    report.failed += 1;
                }
            }
        }
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                "delivery pass complete"
            );
        }
        Ok(report)
    }

    async fn send_one(&self, record: &EmailRecord) -> std::result::Result<(), String> {
        let to: Mailbox = record
            .email
            .parse()
            .map_err(|e| format!("bad recipient address: {e}"))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&record.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(record.body_text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(record.body_html.clone()),
                    ),
            )
            .map_err(|e| format!("message build failed: {e}"))?;

        match &self.transport {
            MailTransport::Smtp(transport) => {
                transport
                    .send(message)
                    .await
                    .map_err(|e| format!("smtp send failed: {e}"))?;
            }
            MailTransport::LogOnly => {
                info!(
                    user_id = record.user_id,
                    email = %record.email,
                    subject = %record.subject,
                    "log-only transport, digest not sent"
                );
            }
        }
        Ok(())
    }
}
