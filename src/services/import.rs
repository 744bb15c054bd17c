use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use crate::db::repository::Repository;
use crate::error::{BatchError, Result};
use crate::models::job::{FeatureBits, Job, SalaryType};
use crate::services::metrics::MetricsHub;

/// One normalized row from the external importer. CSV tokenizing happens
/// upstream; this is the framing contract the core accepts.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ImportedJobRow {
    #[validate(length(min = 1))]
    pub external_id: String,
    #[validate(length(min = 1))]
    pub title: String,
    #[validate(length(min = 1))]
    pub company_name: String,
    pub company_code: Option<String>,
    #[validate(length(min = 2))]
    pub location: String,
    pub city_code: Option<String>,
    pub station_name: Option<String>,
    pub address: Option<String>,
    pub employment_type: String,
    pub category_code: Option<i32>,
    pub salary_min: Option<i32>,
    pub salary_max: Option<i32>,
    pub fee: Option<i32>,
    pub features: Option<Vec<String>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub description: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportReport {
    pub received: usize,
    pub imported: u64,
    pub duplicates_dropped: usize,
    pub rejected: usize,
    pub reject_reasons: HashMap<String, u64>,
}

/// Source of importer rows. The nightly feed is a file drop; tests hand
/// rows in directly.
#[async_trait]
pub trait ImportSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ImportedJobRow>>;
}

/// Newline-delimited JSON drop from the upstream CSV normalizer.
pub struct FileImportSource {
    path: PathBuf,
}

impl FileImportSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ImportSource for FileImportSource {
    async fn fetch(&self) -> Result<Vec<ImportedJobRow>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            BatchError::Validation {
                field: "import_feed".into(),
                detail: format!("cannot read {}: {e}", self.path.display()),
            }
        })?;
        let mut rows = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ImportedJobRow>(line) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "unparseable import row, skipping");
                }
            }
        }
        Ok(rows)
    }
}

/// Validates importer rows, deduplicates on `external_id` (last
/// occurrence wins), derives the packed scoring fields, and upserts.
pub struct JobImporter {
    prefecture_re: Regex,
    city_re: Regex,
}

impl Default for JobImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl JobImporter {
    pub fn new() -> Self {
        Self {
            prefecture_re: Regex::new(r"^\d{2}$").expect("static regex"),
            city_re: Regex::new(r"^\d{5}$").expect("static regex"),
        }
    }

    pub async fn run(
        &self,
        repo: &Arc<dyn Repository>,
        metrics: &MetricsHub,
        rows: Vec<ImportedJobRow>,
        now: DateTime<Utc>,
    ) -> Result<ImportReport> {
        let mut report = ImportReport {
            received: rows.len(),
            ..Default::default()
        };

        // Last occurrence wins: the feed re-emits corrected rows at the
        // end of the file.
        let mut by_external_id: HashMap<String, ImportedJobRow> = HashMap::new();
        for row in rows {
            if by_external_id.insert(row.external_id.clone(), row).is_some() {
                report.duplicates_dropped += 1;
            }
        }

        let mut jobs = Vec::with_capacity(by_external_id.len());
        for (_, row) in by_external_id {
            match self.convert(row, now) {
                Ok(job) => jobs.push(job),
                Err(reason) => {
                    report.rejected += 1;
                    *report.reject_reasons.entry(reason).or_insert(0) += 1;
                }
            }
        }
        jobs.sort_by_key(|j| j.job_id);

        report.imported = repo.upsert_jobs(&jobs).await?;
        metrics.jobs_imported(report.imported);
        metrics.rows_rejected(report.rejected as u64);
        info!(
            received = report.received,
            imported = report.imported,
            duplicates = report.duplicates_dropped,
            rejected = report.rejected,
            "job import finished"
        );
        Ok(report)
    }

    /// Row-level validation. A bad row is counted and skipped, never
    /// fatal to the phase.
    fn convert(&self, row: ImportedJobRow, now: DateTime<Utc>) -> std::result::Result<Job, String> {
        if let Err(e) = row.validate() {
            return Err(format!("schema: {e}"));
        }
        let job_id: i64 = row
            .external_id
            .parse()
            .map_err(|_| "external_id_not_numeric".to_string())?;
        if job_id <= 0 {
            return Err("external_id_not_positive".into());
        }
        if !self.prefecture_re.is_match(&row.location) {
            return Err("bad_prefecture_code".into());
        }
        if let Some(city) = &row.city_code {
            if !self.city_re.is_match(city) {
                return Err("bad_city_code".into());
            }
        }
        if let (Some(min), Some(max)) = (row.salary_min, row.salary_max) {
            if min > max {
                return Err("salary_range_inverted".into());
            }
        }
        if row.salary_min.unwrap_or(0) < 0 || row.fee.unwrap_or(0) < 0 {
            return Err("negative_amount".into());
        }

        let salary_type = match row.employment_type.as_str() {
            "hourly" | "part_time" | "arbeit" => SalaryType::Hourly,
            "daily" | "day" => SalaryType::Daily,
            "monthly" | "full_time" | "contract" => SalaryType::Monthly,
            other => {
                SalaryType::parse(other).ok_or_else(|| "unknown_employment_type".to_string())?
            }
        };

        let mut features = FeatureBits::default();
        for feature in row.features.unwrap_or_default() {
            match feature.as_str() {
                "daily_payment" => features.set(FeatureBits::DAILY_PAYMENT),
                "no_experience" => features.set(FeatureBits::NO_EXPERIENCE),
                "student_welcome" => features.set(FeatureBits::STUDENT_WELCOME),
                "transportation" => features.set(FeatureBits::TRANSPORTATION),
                "remote_work" => features.set(FeatureBits::REMOTE_WORK),
                "weekend_ok" => features.set(FeatureBits::WEEKEND_OK),
                "short_time" => features.set(FeatureBits::SHORT_TIME),
                other => {
                    warn!(feature = other, "unknown feature flag, ignoring");
                }
            }
        }

        let company_code = row
            .company_code
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| row.company_name.trim().to_uppercase());

        Ok(Job {
            job_id,
            company_code,
            title: row.title,
            required_skills: Vec::new(),
            preferred_skills: Vec::new(),
            category_code: row.category_code.unwrap_or(0),
            prefecture_code: row.location,
            city_code: row.city_code,
            station_name: row.station_name,
            address: row.address,
            salary_type,
            min_salary: row.salary_min,
            max_salary: row.salary_max,
            fee: row.fee.unwrap_or(0).max(0),
            features,
            posted_at: row.posted_at.unwrap_or(now),
            created_at: now,
        })
    }
}
