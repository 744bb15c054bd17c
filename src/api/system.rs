use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/system")
            .route("/metrics", web::get().to(get_metrics))
            .route("/alerts", web::get().to(get_alerts)),
    );
}

#[derive(Debug, Serialize)]
struct SystemMetrics {
    last_batch: Option<LastBatch>,
    email_queue: QueueDepths,
    alerts_24h: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct LastBatch {
    batch_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    processed: i64,
    errors: i64,
}

#[derive(Debug, Default, Serialize)]
struct QueueDepths {
    queued: i64,
    sending: i64,
    sent: i64,
    failed: i64,
}

async fn get_metrics(pool: web::Data<PgPool>) -> impl Responder {
    let last_batch = sqlx::query_as::<_, LastBatch>(
        r#"
        SELECT batch_id, status, started_at, ended_at, processed, errors
        FROM batch_executions
        ORDER BY started_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool.get_ref())
    .await;

    let depths = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM email_queue GROUP BY status",
    )
    .fetch_all(pool.get_ref())
    .await;

    let alerts: Result<i64, _> = sqlx::query_scalar(
        "SELECT COUNT(*) FROM alerts WHERE created_at > NOW() - INTERVAL '24 hours'",
    )
    .fetch_one(pool.get_ref())
    .await;

    match (last_batch, depths, alerts) {
        (Ok(last_batch), Ok(depths), Ok(alerts_24h)) => {
            let mut queue = QueueDepths::default();
            for (status, count) in depths {
                match status.as_str() {
                    "queued" => queue.queued = count,
                    "sending" => queue.sending = count,
                    "sent" => queue.sent = count,
                    "failed" => queue.failed = count,
                    _ => {}
                }
            }
            HttpResponse::Ok().json(SystemMetrics {
                last_batch,
                email_queue: queue,
                alerts_24h,
            })
        }
        _ => HttpResponse::InternalServerError()
            .json(serde_json::json!({"error": "metrics query failed"})),
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct AlertRow {
    batch_id: Option<Uuid>,
    severity: String,
    message: String,
    created_at: DateTime<Utc>,
}

async fn get_alerts(pool: web::Data<PgPool>) -> impl Responder {
    let rows = sqlx::query_as::<_, AlertRow>(
        r#"
        SELECT batch_id, severity, message, created_at
        FROM alerts
        ORDER BY created_at DESC
        LIMIT 100
        "#,
    )
    .fetch_all(pool.get_ref())
    .await;

    match rows {
        Ok(alerts) => HttpResponse::Ok().json(alerts),
        Err(e) => {
            HttpResponse::InternalServerError().json(serde_json::json!({"error": e.to_string()}))
        }
    }
}
