use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/batches")
            .route("", web::get().to(list_batches))
            .route("/run", web::post().to(request_run))
            .route("/{batch_id}", web::get().to(get_batch))
            .route("/{batch_id}/cancel", web::post().to(cancel_batch)),
    );
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct BatchSummary {
    batch_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: String,
    processed: i64,
    errors: i64,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_batches(pool: web::Data<PgPool>, query: web::Query<ListQuery>) -> impl Responder {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let rows = sqlx::query_as::<_, BatchSummary>(
        r#"
        SELECT batch_id, started_at, ended_at, status, processed, errors
        FROM batch_executions
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY started_at DESC
        LIMIT $2
        "#,
    )
    .bind(&query.status)
    .bind(limit)
    .fetch_all(pool.get_ref())
    .await;

    match rows {
        Ok(batches) => HttpResponse::Ok().json(batches),
        Err(e) => {
            HttpResponse::InternalServerError().json(serde_json::json!({"error": e.to_string()}))
        }
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct BatchDetail {
    batch_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: String,
    phase_times: serde_json::Value,
    processed: i64,
    errors: i64,
    error_summary: serde_json::Value,
    cancel_requested: bool,
}

async fn get_batch(pool: web::Data<PgPool>, path: web::Path<Uuid>) -> impl Responder {
    let batch_id = path.into_inner();
    let row = sqlx::query_as::<_, BatchDetail>(
        r#"
        SELECT batch_id, started_at, ended_at, status, phase_times, processed, errors,
               error_summary, cancel_requested
        FROM batch_executions
        WHERE batch_id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool.get_ref())
    .await;

    match row {
        Ok(Some(batch)) => HttpResponse::Ok().json(batch),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({"error": "batch not found"})),
        Err(e) => {
            HttpResponse::InternalServerError().json(serde_json::json!({"error": e.to_string()}))
        }
    }
}

/// Queue a manual run. The batch worker polls for pending rows and
/// hands them to the pipeline on its next tick.
async fn request_run(pool: web::Data<PgPool>) -> impl Responder {
    let pending: Result<Option<Uuid>, sqlx::Error> = sqlx::query_scalar(
        "SELECT batch_id FROM batch_executions WHERE status IN ('pending', 'running') LIMIT 1",
    )
    .fetch_optional(pool.get_ref())
    .await;

    match pending {
        Ok(Some(existing)) => HttpResponse::Conflict().json(serde_json::json!({
            "error": "a batch is already pending or running",
            "batch_id": existing,
        })),
        Ok(None) => {
            let batch_id = Uuid::new_v4();
            let result = sqlx::query(
                r#"
                INSERT INTO batch_executions (batch_id, started_at, status, phase_times,
                                              processed, errors, error_summary, cancel_requested)
                VALUES ($1, $2, 'pending', '{}'::jsonb, 0, 0, '{}'::jsonb, FALSE)
                "#,
            )
            .bind(batch_id)
            .bind(Utc::now())
            .execute(pool.get_ref())
            .await;
            match result {
                Ok(_) => HttpResponse::Accepted().json(serde_json::json!({"batch_id": batch_id})),
                Err(e) => HttpResponse::InternalServerError()
                    .json(serde_json::json!({"error": e.to_string()})),
            }
        }
        Err(e) => {
            HttpResponse::InternalServerError().json(serde_json::json!({"error": e.to_string()}))
        }
    }
}

async fn cancel_batch(pool: web::Data<PgPool>, path: web::Path<Uuid>) -> impl Responder {
    let batch_id = path.into_inner();
    let result = sqlx::query(
        r#"
        UPDATE batch_executions SET cancel_requested = TRUE
        WHERE batch_id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(batch_id)
    .execute(pool.get_ref())
    .await;

    match result {
        Ok(done) if done.rows_affected() > 0 => {
            HttpResponse::Accepted().json(serde_json::json!({"batch_id": batch_id, "cancelling": true}))
        }
        Ok(_) => HttpResponse::NotFound()
            .json(serde_json::json!({"error": "no cancellable batch with that id"})),
        Err(e) => {
            HttpResponse::InternalServerError().json(serde_json::json!({"error": e.to_string()}))
        }
    }
}
