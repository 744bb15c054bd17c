use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::{RepoError, Result};
use crate::models::batch::{Alert, BatchRun, BatchStatus, Checkpoint, CheckpointPayload, Phase};
use crate::models::email::{EmailRecord, EmailStatus};
use crate::models::job::{FeatureBits, Job, SalaryType};
use crate::models::matching::MatchScore;
use crate::models::user::{AgeGroup, Application, User, UserProfile};
use crate::services::cache::CompanyPopularity;

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(60);

/// Narrow persistence contract the pipeline depends on. Everything is
/// bulk-shaped; nothing here is called per (user, job) pair.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_active_users(&self, after_user_id: i64, limit: i64) -> Result<Vec<User>>;
    async fn load_users_bulk(&self, user_ids: &[i64]) -> Result<HashMap<i64, User>>;
    async fn load_user_profiles(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserProfile>>;
    async fn load_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>>;
    async fn load_jobs_bulk(&self, job_ids: &[i64]) -> Result<HashMap<i64, Job>>;
    async fn load_user_history(&self, user_ids: &[i64]) -> Result<HashMap<i64, Vec<Application>>>;
    async fn load_company_popularity(
        &self,
        company_codes: &[String],
    ) -> Result<HashMap<String, CompanyPopularity>>;
    async fn load_prefecture_adjacency(&self) -> Result<Vec<(String, Vec<String>)>>;
    async fn load_occupation_hierarchy(&self) -> Result<Vec<(i32, i32)>>;

    async fn upsert_jobs(&self, jobs: &[Job]) -> Result<u64>;
    async fn write_scores_bulk(&self, batch_id: Uuid, scores: &[MatchScore]) -> Result<u64>;
    /// Slate rows persisted by a previous matching pass, joined with job
    /// metadata. Used to rebuild digests after a restart.
    async fn load_scored_jobs(
        &self,
        batch_id: Uuid,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<crate::models::matching::ScoredJob>>>;
    async fn write_email_queue(&self, records: &[EmailRecord]) -> Result<u64>;
    async fn claim_due_emails(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailRecord>>;
    async fn mark_email_status(
        &self,
        batch_id: Uuid,
        user_id: i64,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn create_batch_run(&self, run: &BatchRun) -> Result<()>;
    async fn update_batch_run(&self, run: &BatchRun) -> Result<()>;
    async fn load_batch_run(&self, batch_id: Uuid) -> Result<Option<BatchRun>>;
    async fn list_batch_runs(
        &self,
        status: Option<BatchStatus>,
        limit: i64,
    ) -> Result<Vec<BatchRun>>;
    async fn request_cancel(&self, batch_id: Uuid) -> Result<bool>;
    async fn is_cancel_requested(&self, batch_id: Uuid) -> Result<bool>;

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn read_checkpoint(&self, batch_id: Uuid, phase: Phase) -> Result<Option<Checkpoint>>;

    async fn write_alert(&self, alert: &Alert) -> Result<()>;
    async fn cleanup_expired(&self, retention_days: i64) -> Result<u64>;
}

/// PostgreSQL implementation. Transient driver errors retry internally
/// with exponential backoff and jitter; constraint violations surface
/// immediately as permanent.
pub struct PgRepository {
    pool: PgPool,
    batch_insert_size: usize,
}

impl PgRepository {
    pub fn new(pool: PgPool, batch_insert_size: usize) -> Self {
        Self {
            pool,
            batch_insert_size: batch_insert_size.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let classified = RepoError::from_sqlx(err);
                    attempt += 1;
                    if !classified.is_transient() || attempt >= RETRY_ATTEMPTS {
                        return Err(classified.into());
                    }
                    let backoff = RETRY_BASE
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                        .min(RETRY_CAP);
                    let jitter = rand::thread_rng().gen_range(0..250);
                    warn!(
                        op,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64 + jitter,
                        "transient repository error, retrying"
                    );
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                }
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: i64,
    email: String,
    prefecture_code: Option<String>,
    city_code: Option<String>,
    age_group: Option<String>,
    gender: Option<String>,
    preferred_categories: Vec<i32>,
    preferred_salary_min: Option<i32>,
    preferred_work_styles: Vec<String>,
    experience_level: Option<i16>,
    email_enabled: bool,
    is_active: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            user_id: row.user_id,
            email: row.email,
            prefecture_code: row.prefecture_code,
            city_code: row.city_code,
            age_group: row.age_group.as_deref().and_then(AgeGroup::parse),
            gender: row.gender,
            preferred_categories: row.preferred_categories,
            preferred_salary_min: row.preferred_salary_min,
            preferred_work_styles: row.preferred_work_styles,
            experience_level: row.experience_level,
            email_enabled: row.email_enabled,
            is_active: row.is_active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: i64,
    company_code: String,
    title: String,
    required_skills: Vec<String>,
    preferred_skills: Vec<String>,
    category_code: i32,
    prefecture_code: String,
    city_code: Option<String>,
    station_name: Option<String>,
    address: Option<String>,
    salary_type: String,
    min_salary: Option<i32>,
    max_salary: Option<i32>,
    fee: i32,
    features: i32,
    posted_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            job_id: row.job_id,
            company_code: row.company_code,
            title: row.title,
            required_skills: row.required_skills,
            preferred_skills: row.preferred_skills,
            category_code: row.category_code,
            prefecture_code: row.prefecture_code,
            city_code: row.city_code,
            station_name: row.station_name,
            address: row.address,
            salary_type: SalaryType::parse(&row.salary_type).unwrap_or(SalaryType::Hourly),
            min_salary: row.min_salary,
            max_salary: row.max_salary,
            fee: row.fee,
            features: FeatureBits(row.features as u16),
            posted_at: row.posted_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    batch_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: String,
    phase_times: serde_json::Value,
    processed: i64,
    errors: i64,
    error_summary: serde_json::Value,
}

impl From<BatchRow> for BatchRun {
    fn from(row: BatchRow) -> Self {
        BatchRun {
            batch_id: row.batch_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            status: BatchStatus::parse(&row.status).unwrap_or(BatchStatus::Failed),
            phase_times: serde_json::from_value(row.phase_times).unwrap_or_default(),
            counters: crate::models::batch::RunCounters {
                processed: row.processed.max(0) as u64,
                errors: row.errors.max(0) as u64,
            },
            error_summary: serde_json::from_value(row.error_summary).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EmailRow {
    batch_id: Uuid,
    user_id: i64,
    email: String,
    subject: String,
    body_text: String,
    body_html: String,
    scheduled_for: DateTime<Utc>,
    status: String,
    correlation_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<EmailRow> for EmailRecord {
    fn from(row: EmailRow) -> Self {
        EmailRecord {
            batch_id: row.batch_id,
            user_id: row.user_id,
            email: row.email,
            subject: row.subject,
            body_text: row.body_text,
            body_html: row.body_html,
            scheduled_for: row.scheduled_for,
            status: EmailStatus::parse(&row.status).unwrap_or(EmailStatus::Queued),
            correlation_id: row.correlation_id,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn load_active_users(&self, after_user_id: i64, limit: i64) -> Result<Vec<User>> {
        let rows = self
            .retrying("load_active_users", || async {
                sqlx::query_as::<_, UserRow>(
                    r#"
                    SELECT user_id, email, prefecture_code, city_code, age_group, gender,
                           preferred_categories, preferred_salary_min, preferred_work_styles,
                           experience_level, email_enabled, is_active
                    FROM users
                    WHERE is_active AND email_enabled AND user_id > $1
                    ORDER BY user_id
                    LIMIT $2
                    "#,
                )
                .bind(after_user_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn load_users_bulk(&self, user_ids: &[i64]) -> Result<HashMap<i64, User>> {
        let rows = self
            .retrying("load_users_bulk", || async {
                sqlx::query_as::<_, UserRow>(
                    r#"
                    SELECT user_id, email, prefecture_code, city_code, age_group, gender,
                           preferred_categories, preferred_salary_min, preferred_work_styles,
                           experience_level, email_enabled, is_active
                    FROM users
                    WHERE user_id = ANY($1)
                    "#,
                )
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.user_id, User::from(row)))
            .collect())
    }

    async fn load_user_profiles(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserProfile>> {
        #[derive(sqlx::FromRow)]
        struct ProfileRow {
            user_id: i64,
            profile: serde_json::Value,
            updated_at: DateTime<Utc>,
        }
        let rows = self
            .retrying("load_user_profiles", || async {
                sqlx::query_as::<_, ProfileRow>(
                    "SELECT user_id, profile, updated_at FROM user_profiles WHERE user_id = ANY($1)",
                )
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        let mut profiles = HashMap::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<UserProfile>(row.profile) {
                Ok(mut profile) => {
                    profile.user_id = row.user_id;
                    profile.updated_at = row.updated_at;
                    profiles.insert(row.user_id, profile);
                }
                Err(e) => {
                    // A bad profile is a hint we can live without.
                    warn!(user_id = row.user_id, error = %e, "unparseable user profile, skipping");
                }
            }
        }
        Ok(profiles)
    }

    async fn load_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = self
            .retrying("load_jobs_since", || async {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT job_id, company_code, title, required_skills, preferred_skills,
                           category_code, prefecture_code, city_code, station_name, address,
                           salary_type, min_salary, max_salary, fee, features, posted_at, created_at
                    FROM jobs
                    WHERE posted_at >= $1
                    ORDER BY job_id
                    "#,
                )
                .bind(since)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn load_jobs_bulk(&self, job_ids: &[i64]) -> Result<HashMap<i64, Job>> {
        let rows = self
            .retrying("load_jobs_bulk", || async {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT job_id, company_code, title, required_skills, preferred_skills,
                           category_code, prefecture_code, city_code, station_name, address,
                           salary_type, min_salary, max_salary, fee, features, posted_at, created_at
                    FROM jobs
                    WHERE job_id = ANY($1)
                    "#,
                )
                .bind(job_ids)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.job_id, Job::from(row)))
            .collect())
    }

    async fn load_user_history(&self, user_ids: &[i64]) -> Result<HashMap<i64, Vec<Application>>> {
        #[derive(sqlx::FromRow)]
        struct AppRow {
            user_id: i64,
            company_code: String,
            applied_at: Option<DateTime<Utc>>,
            category_code: Option<i32>,
            salary: Option<i32>,
            prefecture_code: Option<String>,
        }
        let rows = self
            .retrying("load_user_history", || async {
                sqlx::query_as::<_, AppRow>(
                    r#"
                    SELECT user_id, company_code, applied_at, category_code, salary, prefecture_code
                    FROM applications
                    WHERE user_id = ANY($1)
                      AND (applied_at IS NULL OR applied_at >= NOW() - INTERVAL '90 days')
                    "#,
                )
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        let mut histories: HashMap<i64, Vec<Application>> = HashMap::new();
        for row in rows {
            histories.entry(row.user_id).or_default().push(Application {
                user_id: row.user_id,
                company_code: row.company_code,
                applied_at: row.applied_at,
                category_code: row.category_code,
                salary: row.salary,
                prefecture_code: row.prefecture_code,
            });
        }
        Ok(histories)
    }

    async fn load_company_popularity(
        &self,
        company_codes: &[String],
    ) -> Result<HashMap<String, CompanyPopularity>> {
        #[derive(sqlx::FromRow)]
        struct PopRow {
            company_code: String,
            application_rate: f64,
            applications_7d: i32,
            popularity_score: f64,
        }
        let rows = self
            .retrying("load_company_popularity", || async {
                sqlx::query_as::<_, PopRow>(
                    r#"
                    SELECT company_code, application_rate, applications_7d, popularity_score
                    FROM company_popularity
                    WHERE company_code = ANY($1)
                    "#,
                )
                .bind(company_codes)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.company_code,
                    CompanyPopularity {
                        application_rate: row.application_rate as f32,
                        applications_7d: row.applications_7d,
                        popularity_score: row.popularity_score as f32,
                    },
                )
            })
            .collect())
    }

    async fn load_prefecture_adjacency(&self) -> Result<Vec<(String, Vec<String>)>> {
        let rows = self
            .retrying("load_prefecture_adjacency", || async {
                sqlx::query_as::<_, (String, Vec<String>)>(
                    "SELECT pref_code, adjacent_prefectures FROM prefecture_adjacency",
                )
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows)
    }

    async fn load_occupation_hierarchy(&self) -> Result<Vec<(i32, i32)>> {
        let rows = self
            .retrying("load_occupation_hierarchy", || async {
                sqlx::query_as::<_, (i32, i32)>(
                    "SELECT code, major_category_code FROM occupation_master",
                )
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows)
    }

    async fn upsert_jobs(&self, jobs: &[Job]) -> Result<u64> {
        let mut written = 0u64;
        for chunk in jobs.chunks(self.batch_insert_size) {
            let mut job_ids = Vec::with_capacity(chunk.len());
            let mut company_codes = Vec::with_capacity(chunk.len());
            let mut titles = Vec::with_capacity(chunk.len());
            let mut required = Vec::with_capacity(chunk.len());
            let mut preferred = Vec::with_capacity(chunk.len());
            let mut categories = Vec::with_capacity(chunk.len());
            let mut prefectures = Vec::with_capacity(chunk.len());
            let mut cities = Vec::with_capacity(chunk.len());
            let mut stations = Vec::with_capacity(chunk.len());
            let mut addresses = Vec::with_capacity(chunk.len());
            let mut salary_types = Vec::with_capacity(chunk.len());
            let mut min_salaries = Vec::with_capacity(chunk.len());
            let mut max_salaries = Vec::with_capacity(chunk.len());
            let mut fees = Vec::with_capacity(chunk.len());
            let mut features = Vec::with_capacity(chunk.len());
            let mut posted = Vec::with_capacity(chunk.len());
            for job in chunk {
                job_ids.push(job.job_id);
                company_codes.push(job.company_code.clone());
                titles.push(job.title.clone());
                required.push(serde_json::to_value(&job.required_skills).unwrap_or_default());
                preferred.push(serde_json::to_value(&job.preferred_skills).unwrap_or_default());
                categories.push(job.category_code);
                prefectures.push(job.prefecture_code.clone());
                cities.push(job.city_code.clone());
                stations.push(job.station_name.clone());
                addresses.push(job.address.clone());
                salary_types.push(job.salary_type.as_str().to_string());
                min_salaries.push(job.min_salary);
                max_salaries.push(job.max_salary);
                fees.push(job.fee);
                features.push(job.features.0 as i32);
                posted.push(job.posted_at);
            }

            let result = self
                .retrying("upsert_jobs", || async {
                    sqlx::query(
                        r#"
                        INSERT INTO jobs (job_id, company_code, title, required_skills,
                                          preferred_skills, category_code, prefecture_code,
                                          city_code, station_name, address, salary_type,
                                          min_salary, max_salary, fee, features, posted_at,
                                          created_at)
                        SELECT u.job_id, u.company_code, u.title,
                               ARRAY(SELECT jsonb_array_elements_text(u.required_skills)),
                               ARRAY(SELECT jsonb_array_elements_text(u.preferred_skills)),
                               u.category_code, u.prefecture_code, u.city_code, u.station_name,
                               u.address, u.salary_type, u.min_salary, u.max_salary, u.fee,
                               u.features, u.posted_at, NOW()
                        FROM UNNEST($1::bigint[], $2::text[], $3::text[], $4::jsonb[],
                                    $5::jsonb[], $6::int[], $7::text[], $8::text[], $9::text[],
                                    $10::text[], $11::text[], $12::int[], $13::int[], $14::int[],
                                    $15::int[], $16::timestamptz[])
                             AS u(job_id, company_code, title, required_skills, preferred_skills,
                                  category_code, prefecture_code, city_code, station_name,
                                  address, salary_type, min_salary, max_salary, fee, features,
                                  posted_at)
                        ON CONFLICT (job_id) DO UPDATE SET
                            company_code = EXCLUDED.company_code,
                            title = EXCLUDED.title,
                            required_skills = EXCLUDED.required_skills,
                            preferred_skills = EXCLUDED.preferred_skills,
                            category_code = EXCLUDED.category_code,
                            prefecture_code = EXCLUDED.prefecture_code,
                            city_code = EXCLUDED.city_code,
                            station_name = EXCLUDED.station_name,
                            address = EXCLUDED.address,
                            salary_type = EXCLUDED.salary_type,
                            min_salary = EXCLUDED.min_salary,
                            max_salary = EXCLUDED.max_salary,
                            fee = EXCLUDED.fee,
                            features = EXCLUDED.features,
                            posted_at = EXCLUDED.posted_at
                        "#,
                    )
                    .bind(&job_ids)
                    .bind(&company_codes)
                    .bind(&titles)
                    .bind(&required)
                    .bind(&preferred)
                    .bind(&categories)
                    .bind(&prefectures)
                    .bind(&cities)
                    .bind(&stations)
                    .bind(&addresses)
                    .bind(&salary_types)
                    .bind(&min_salaries)
                    .bind(&max_salaries)
                    .bind(&fees)
                    .bind(&features)
                    .bind(&posted)
                    .execute(&self.pool)
                    .await
                })
                .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn write_scores_bulk(&self, batch_id: Uuid, scores: &[MatchScore]) -> Result<u64> {
        let mut written = 0u64;
        for chunk in scores.chunks(self.batch_insert_size) {
            let mut user_ids = Vec::with_capacity(chunk.len());
            let mut job_ids = Vec::with_capacity(chunk.len());
            let mut bases = Vec::with_capacity(chunk.len());
            let mut seos = Vec::with_capacity(chunk.len());
            let mut personals = Vec::with_capacity(chunk.len());
            let mut composites = Vec::with_capacity(chunk.len());
            let mut components = Vec::with_capacity(chunk.len());
            let mut bonuses = Vec::with_capacity(chunk.len());
            let mut penalties = Vec::with_capacity(chunk.len());
            for score in chunk {
                user_ids.push(score.user_id);
                job_ids.push(score.job_id);
                bases.push(score.base as f64);
                seos.push(score.seo as f64);
                personals.push(score.personal as f64);
                composites.push(score.composite as f64);
                components.push(serde_json::to_value(&score.components).unwrap_or_default());
                bonuses.push(serde_json::to_value(&score.bonuses).unwrap_or_default());
                penalties.push(serde_json::to_value(&score.penalties).unwrap_or_default());
            }

            let result = self
                .retrying("write_scores_bulk", || async {
                    sqlx::query(
                        r#"
                        INSERT INTO match_scores (batch_id, user_id, job_id, base_score,
                                                  seo_score, personal_score, composite_score,
                                                  components, bonuses, penalties, created_at)
                        SELECT $1, u.user_id, u.job_id, u.base_score, u.seo_score,
                               u.personal_score, u.composite_score, u.components, u.bonuses,
                               u.penalties, NOW()
                        FROM UNNEST($2::bigint[], $3::bigint[], $4::float8[], $5::float8[],
                                    $6::float8[], $7::float8[], $8::jsonb[], $9::jsonb[],
                                    $10::jsonb[])
                             AS u(user_id, job_id, base_score, seo_score, personal_score,
                                  composite_score, components, bonuses, penalties)
                        ON CONFLICT (batch_id, user_id, job_id) DO UPDATE SET
                            base_score = EXCLUDED.base_score,
                            seo_score = EXCLUDED.seo_score,
                            personal_score = EXCLUDED.personal_score,
                            composite_score = EXCLUDED.composite_score,
                            components = EXCLUDED.components,
                            bonuses = EXCLUDED.bonuses,
                            penalties = EXCLUDED.penalties
                        "#,
                    )
                    .bind(batch_id)
                    .bind(&user_ids)
                    .bind(&job_ids)
                    .bind(&bases)
                    .bind(&seos)
                    .bind(&personals)
                    .bind(&composites)
                    .bind(&components)
                    .bind(&bonuses)
                    .bind(&penalties)
                    .execute(&self.pool)
                    .await
                })
                .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn load_scored_jobs(
        &self,
        batch_id: Uuid,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<crate::models::matching::ScoredJob>>> {
        #[derive(sqlx::FromRow)]
        struct ScoredRow {
            user_id: i64,
            job_id: i64,
            composite_score: f64,
            components: serde_json::Value,
            company_code: String,
            title: String,
            category_code: i32,
            min_salary: Option<i32>,
            max_salary: Option<i32>,
            salary_type: String,
            features: i32,
            posted_at: DateTime<Utc>,
        }
        let rows = self
            .retrying("load_scored_jobs", || async {
                sqlx::query_as::<_, ScoredRow>(
                    r#"
                    SELECT ms.user_id, ms.job_id, ms.composite_score, ms.components,
                           j.company_code, j.title, j.category_code, j.min_salary,
                           j.max_salary, j.salary_type, j.features, j.posted_at
                    FROM match_scores ms
                    JOIN jobs j ON j.job_id = ms.job_id
                    WHERE ms.batch_id = $1 AND ms.user_id = ANY($2)
                    ORDER BY ms.user_id, ms.composite_score DESC, ms.job_id
                    "#,
                )
                .bind(batch_id)
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        let now = Utc::now();
        let mut by_user: HashMap<i64, Vec<crate::models::matching::ScoredJob>> = HashMap::new();
        for row in rows {
            let salary_type = SalaryType::parse(&row.salary_type).unwrap_or(SalaryType::Hourly);
            let salary = row.max_salary.or(row.min_salary).unwrap_or(0);
            let features = FeatureBits(row.features as u16);
            let location = row
                .components
                .get("location")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0) as f32;
            by_user
                .entry(row.user_id)
                .or_default()
                .push(crate::models::matching::ScoredJob {
                    job_id: row.job_id,
                    company_code: row.company_code,
                    title: row.title,
                    category_code: row.category_code,
                    composite: row.composite_score as f32,
                    hourly_equivalent: salary as f32 / salary_type.hourly_divisor(),
                    location_subscore: location,
                    age_hours: ((now - row.posted_at).num_minutes() as f32 / 60.0).max(0.0),
                    weekend_ok: features.has(FeatureBits::WEEKEND_OK),
                    short_time: features.has(FeatureBits::SHORT_TIME),
                    category_label: row.category_code.to_string(),
                    min_salary: row.min_salary,
                    is_fallback: false,
                });
        }
        Ok(by_user)
    }

    async fn write_email_queue(&self, records: &[EmailRecord]) -> Result<u64> {
        let mut written = 0u64;
        for chunk in records.chunks(self.batch_insert_size) {
            let mut user_ids = Vec::with_capacity(chunk.len());
            let mut emails = Vec::with_capacity(chunk.len());
            let mut subjects = Vec::with_capacity(chunk.len());
            let mut texts = Vec::with_capacity(chunk.len());
            let mut htmls = Vec::with_capacity(chunk.len());
            let mut schedules = Vec::with_capacity(chunk.len());
            let mut correlations = Vec::with_capacity(chunk.len());
            let batch_id = match chunk.first() {
                Some(r) => r.batch_id,
                None => continue,
            };
            for record in chunk {
                user_ids.push(record.user_id);
                emails.push(record.email.clone());
                subjects.push(record.subject.clone());
                texts.push(record.body_text.clone());
                htmls.push(record.body_html.clone());
                schedules.push(record.scheduled_for);
                correlations.push(record.correlation_id);
            }

            let result = self
                .retrying("write_email_queue", || async {
                    sqlx::query(
                        r#"
                        INSERT INTO email_queue (batch_id, user_id, email, subject, body_text,
                                                 body_html, scheduled_for, status,
                                                 correlation_id, created_at)
                        SELECT $1, u.user_id, u.email, u.subject, u.body_text, u.body_html,
                               u.scheduled_for, 'queued', u.correlation_id, NOW()
                        FROM UNNEST($2::bigint[], $3::text[], $4::text[], $5::text[],
                                    $6::text[], $7::timestamptz[], $8::uuid[])
                             AS u(user_id, email, subject, body_text, body_html, scheduled_for,
                                  correlation_id)
                        ON CONFLICT (batch_id, user_id) DO UPDATE SET
                            subject = EXCLUDED.subject,
                            body_text = EXCLUDED.body_text,
                            body_html = EXCLUDED.body_html,
                            scheduled_for = EXCLUDED.scheduled_for
                        "#,
                    )
                    .bind(batch_id)
                    .bind(&user_ids)
                    .bind(&emails)
                    .bind(&subjects)
                    .bind(&texts)
                    .bind(&htmls)
                    .bind(&schedules)
                    .bind(&correlations)
                    .execute(&self.pool)
                    .await
                })
                .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn claim_due_emails(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailRecord>> {
        let rows = self
            .retrying("claim_due_emails", || async {
                sqlx::query_as::<_, EmailRow>(
                    r#"
                    UPDATE email_queue eq
                    SET status = 'sending'
                    FROM (
                        SELECT batch_id, user_id FROM email_queue
                        WHERE status = 'queued' AND scheduled_for <= $1
                        ORDER BY scheduled_for
                        LIMIT $2
                        FOR UPDATE SKIP LOCKED
                    ) due
                    WHERE eq.batch_id = due.batch_id AND eq.user_id = due.user_id
                    RETURNING eq.batch_id, eq.user_id, eq.email, eq.subject, eq.body_text,
                              eq.body_html, eq.scheduled_for, eq.status, eq.correlation_id,
                              eq.created_at
                    "#,
                )
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows.into_iter().map(EmailRecord::from).collect())
    }

    async fn mark_email_status(
        &self,
        batch_id: Uuid,
        user_id: i64,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.retrying("mark_email_status", || async {
            sqlx::query(
                r#"
                UPDATE email_queue
                SET status = $3,
                    error = $4,
                    sent_at = CASE WHEN $3 = 'sent' THEN NOW() ELSE sent_at END
                WHERE batch_id = $1 AND user_id = $2
                "#,
            )
            .bind(batch_id)
            .bind(user_id)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn create_batch_run(&self, run: &BatchRun) -> Result<()> {
        self.retrying("create_batch_run", || async {
            sqlx::query(
                r#"
                INSERT INTO batch_executions (batch_id, started_at, status, phase_times,
                                              processed, errors, error_summary, cancel_requested)
                VALUES ($1, $2, $3, $4, 0, 0, '{}'::jsonb, FALSE)
                ON CONFLICT (batch_id) DO NOTHING
                "#,
            )
            .bind(run.batch_id)
            .bind(run.started_at)
            .bind(run.status.as_str())
            .bind(serde_json::to_value(&run.phase_times).unwrap_or_default())
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn update_batch_run(&self, run: &BatchRun) -> Result<()> {
        self.retrying("update_batch_run", || async {
            sqlx::query(
                r#"
                UPDATE batch_executions
                SET ended_at = $2, status = $3, phase_times = $4, processed = $5,
                    errors = $6, error_summary = $7
                WHERE batch_id = $1
                "#,
            )
            .bind(run.batch_id)
            .bind(run.ended_at)
            .bind(run.status.as_str())
            .bind(serde_json::to_value(&run.phase_times).unwrap_or_default())
            .bind(run.counters.processed as i64)
            .bind(run.counters.errors as i64)
            .bind(serde_json::to_value(&run.error_summary).unwrap_or_default())
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn load_batch_run(&self, batch_id: Uuid) -> Result<Option<BatchRun>> {
        let row = self
            .retrying("load_batch_run", || async {
                sqlx::query_as::<_, BatchRow>(
                    r#"
                    SELECT batch_id, started_at, ended_at, status, phase_times, processed,
                           errors, error_summary
                    FROM batch_executions WHERE batch_id = $1
                    "#,
                )
                .bind(batch_id)
                .fetch_optional(&self.pool)
                .await
            })
            .await?;
        Ok(row.map(BatchRun::from))
    }

    async fn list_batch_runs(
        &self,
        status: Option<BatchStatus>,
        limit: i64,
    ) -> Result<Vec<BatchRun>> {
        let rows = self
            .retrying("list_batch_runs", || async {
                sqlx::query_as::<_, BatchRow>(
                    r#"
                    SELECT batch_id, started_at, ended_at, status, phase_times, processed,
                           errors, error_summary
                    FROM batch_executions
                    WHERE ($1::text IS NULL OR status = $1)
                    ORDER BY started_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(status.map(|s| s.as_str().to_string()))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        Ok(rows.into_iter().map(BatchRun::from).collect())
    }

    async fn request_cancel(&self, batch_id: Uuid) -> Result<bool> {
        let result = self
            .retrying("request_cancel", || async {
                sqlx::query(
                    r#"
                    UPDATE batch_executions SET cancel_requested = TRUE
                    WHERE batch_id = $1 AND status IN ('pending', 'running')
                    "#,
                )
                .bind(batch_id)
                .execute(&self.pool)
                .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, batch_id: Uuid) -> Result<bool> {
        let flagged: Option<bool> = self
            .retrying("is_cancel_requested", || async {
                sqlx::query_scalar(
                    "SELECT cancel_requested FROM batch_executions WHERE batch_id = $1",
                )
                .bind(batch_id)
                .fetch_optional(&self.pool)
                .await
            })
            .await?;
        Ok(flagged.unwrap_or(false))
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.retrying("write_checkpoint", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (batch_id, phase, at, payload)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (batch_id, phase) DO UPDATE SET
                    at = EXCLUDED.at,
                    payload = EXCLUDED.payload
                "#,
            )
            .bind(checkpoint.batch_id)
            .bind(checkpoint.phase.as_str())
            .bind(checkpoint.at)
            .bind(serde_json::to_value(&checkpoint.payload).unwrap_or_default())
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn read_checkpoint(&self, batch_id: Uuid, phase: Phase) -> Result<Option<Checkpoint>> {
        #[derive(sqlx::FromRow)]
        struct CheckpointRow {
            at: DateTime<Utc>,
            payload: serde_json::Value,
        }
        let row = self
            .retrying("read_checkpoint", || async {
                sqlx::query_as::<_, CheckpointRow>(
                    "SELECT at, payload FROM checkpoints WHERE batch_id = $1 AND phase = $2",
                )
                .bind(batch_id)
                .bind(phase.as_str())
                .fetch_optional(&self.pool)
                .await
            })
            .await?;
        Ok(row.map(|r| Checkpoint {
            batch_id,
            phase,
            at: r.at,
            payload: serde_json::from_value::<CheckpointPayload>(r.payload).unwrap_or_default(),
        }))
    }

    async fn write_alert(&self, alert: &Alert) -> Result<()> {
        self.retrying("write_alert", || async {
            sqlx::query(
                "INSERT INTO alerts (batch_id, severity, message, created_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(alert.batch_id)
            .bind(alert.severity.as_str())
            .bind(&alert.message)
            .bind(alert.timestamp)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn cleanup_expired(&self, retention_days: i64) -> Result<u64> {
        let mut removed = 0u64;
        for (table, column) in [
            ("match_scores", "created_at"),
            ("email_queue", "created_at"),
            ("checkpoints", "at"),
            ("alerts", "created_at"),
            ("batch_executions", "started_at"),
        ] {
            let sql = format!(
                "DELETE FROM {table} WHERE {column} < NOW() - make_interval(days => $1)"
            );
            let result = self
                .retrying("cleanup_expired", || {
                    let sql = sql.clone();
                    async move {
                        sqlx::query(&sql)
                            .bind(retention_days as i32)
                            .execute(&self.pool)
                            .await
                    }
                })
                .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }
}
