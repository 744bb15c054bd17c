use std::env;

use crate::error::{BatchError, Result};

/// Process-wide configuration, assembled from the environment once at
/// startup. Invalid values are fatal; every knob has the documented default.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub matching: MatchingConfig,
    pub scoring: ScoringConfig,
    pub sections: SectionConfig,
    pub targets: PerformanceTargets,
    pub email: EmailConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub timezone: String,
    pub max_concurrent_jobs: usize,
    pub coalesce: bool,
    pub max_instances: u32,
    pub misfire_grace_secs: u64,
    pub retry_enabled: bool,
    pub max_retries: u32,
    pub retry_backoff_factor: f64,
    pub retry_max_delay_secs: u64,
    pub health_check_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub resource_monitoring_enabled: bool,
    pub job_history_retention_days: i64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub batch_size: usize,
    pub max_parallel_workers: usize,
    pub queue_size_limit: usize,
    pub strategy: MatchStrategy,
    pub user_failure_rate_threshold: f64,
    pub checkpoint_interval: usize,
    pub candidate_pool_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    Sequential,
    Parallel,
    Adaptive,
}

impl MatchStrategy {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Some(MatchStrategy::Sequential),
            "parallel" | "par" => Some(MatchStrategy::Parallel),
            "adaptive" | "adapt" => Some(MatchStrategy::Adaptive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub weight_base: f64,
    pub weight_seo: f64,
    pub weight_personal: f64,
    pub high_income_hourly: i32,
    pub dedup_window_days: i64,
    /// Window for the recent-application penalty. Independent of the
    /// dedup exclusion window: shrinking the hard filter must not
    /// silently shrink the penalty too.
    pub recent_penalty_days: i64,
    pub batch_insert_size: usize,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct SectionConfig {
    pub total: usize,
    pub min_per_section: usize,
    pub max_per_section: usize,
    pub max_jobs_per_category: usize,
}

#[derive(Debug, Clone)]
pub struct PerformanceTargets {
    pub total_runtime_secs: u64,
    pub import_secs: u64,
    pub matching_secs: u64,
    pub email_secs: u64,
    pub per_user_budget_ms: u64,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_email: String,
    pub from_name: String,
    pub base_url: String,
    pub copywriter_endpoint: Option<String>,
    pub copywriter_api_key: Option<String>,
    pub send_batch_size: usize,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| BatchError::Config("DATABASE_URL must be set".into()))?;

        let strategy_raw = env::var("MATCH_STRATEGY").unwrap_or_else(|_| "adaptive".into());
        let strategy = MatchStrategy::parse(&strategy_raw)
            .ok_or_else(|| BatchError::Config(format!("unknown MATCH_STRATEGY: {strategy_raw}")))?;

        let config = Self {
            database_url,
            scheduler: SchedulerConfig {
                timezone: env::var("SCHEDULER_TZ").unwrap_or_else(|_| "Asia/Tokyo".into()),
                max_concurrent_jobs: env_parsed("MAX_CONCURRENT_JOBS", 10),
                coalesce: env_parsed("JOB_COALESCE", true),
                max_instances: env_parsed("JOB_MAX_INSTANCES", 1),
                misfire_grace_secs: env_parsed("MISFIRE_GRACE_SECS", 300),
                retry_enabled: env_parsed("RETRY_ENABLED", true),
                max_retries: env_parsed("MAX_RETRIES", 5),
                retry_backoff_factor: env_parsed("RETRY_BACKOFF_FACTOR", 2.0),
                retry_max_delay_secs: env_parsed("RETRY_MAX_DELAY_SECS", 3600),
                health_check_interval_secs: env_parsed("HEALTH_CHECK_INTERVAL_SECS", 30),
                metrics_interval_secs: env_parsed("METRICS_INTERVAL_SECS", 15),
                resource_monitoring_enabled: env_parsed("RESOURCE_MONITORING", true),
                job_history_retention_days: env_parsed("JOB_HISTORY_RETENTION_DAYS", 30),
                shutdown_grace_secs: env_parsed("SHUTDOWN_GRACE_SECS", 30),
            },
            matching: MatchingConfig {
                batch_size: env_parsed("MATCH_BATCH_SIZE", 100),
                max_parallel_workers: env_parsed("MAX_PARALLEL_WORKERS", 10),
                queue_size_limit: env_parsed("QUEUE_SIZE_LIMIT", 1000),
                strategy,
                user_failure_rate_threshold: env_parsed("USER_FAILURE_RATE_THRESHOLD", 0.10),
                checkpoint_interval: env_parsed("CHECKPOINT_INTERVAL", 1000),
                candidate_pool_size: env_parsed("CANDIDATE_POOL_SIZE", 200),
            },
            scoring: ScoringConfig {
                weight_base: env_parsed("SCORE_WEIGHT_BASE", 0.40),
                weight_seo: env_parsed("SCORE_WEIGHT_SEO", 0.30),
                weight_personal: env_parsed("SCORE_WEIGHT_PERSONAL", 0.30),
                high_income_hourly: env_parsed("HIGH_INCOME_HOURLY", 1500),
                dedup_window_days: env_parsed("DEDUP_WINDOW_DAYS", 14i64).clamp(1, 90),
                recent_penalty_days: env_parsed("RECENT_PENALTY_DAYS", 14i64).clamp(1, 90),
                batch_insert_size: env_parsed("BATCH_INSERT_SIZE", 1000),
                chunk_size: env_parsed("SCORING_CHUNK_SIZE", 1000),
            },
            sections: SectionConfig {
                total: env_parsed("SECTION_TOTAL", 40),
                min_per_section: env_parsed("SECTION_MIN", 3),
                max_per_section: env_parsed("SECTION_MAX", 10),
                max_jobs_per_category: env_parsed("MAX_JOBS_PER_CATEGORY", 15),
            },
            targets: PerformanceTargets {
                total_runtime_secs: env_parsed("TARGET_TOTAL_RUNTIME_SECS", 1800),
                import_secs: env_parsed("TARGET_IMPORT_SECS", 300),
                matching_secs: env_parsed("TARGET_MATCHING_SECS", 1200),
                email_secs: env_parsed("TARGET_EMAIL_SECS", 300),
                per_user_budget_ms: env_parsed("PER_USER_BUDGET_MS", 180),
            },
            email: EmailConfig {
                smtp_host: env::var("SMTP_HOST").ok(),
                smtp_port: env_parsed("SMTP_PORT", 587),
                smtp_username: env::var("SMTP_USERNAME").ok(),
                smtp_password: env::var("SMTP_PASSWORD").ok(),
                from_email: env::var("FROM_EMAIL")
                    .unwrap_or_else(|_| "jobs@matchmail.example".into()),
                from_name: env::var("FROM_NAME").unwrap_or_else(|_| "MatchMail".into()),
                base_url: env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into()),
                copywriter_endpoint: env::var("COPYWRITER_ENDPOINT").ok(),
                copywriter_api_key: env::var("COPYWRITER_API_KEY").ok(),
                send_batch_size: env_parsed("EMAIL_SEND_BATCH_SIZE", 50),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Weight drift beyond 1e-2 is a configuration
    /// mistake, not something to renormalize silently.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        let weight_sum = s.weight_base + s.weight_seo + s.weight_personal;
        if (weight_sum - 1.0).abs() > 1e-2 {
            return Err(BatchError::Config(format!(
                "score weights must sum to 1.0 (got {weight_sum:.4})"
            )));
        }
        for (name, w) in [
            ("base", s.weight_base),
            ("seo", s.weight_seo),
            ("personal", s.weight_personal),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(BatchError::Config(format!("weight {name} out of [0,1]: {w}")));
            }
        }
        if self.sections.total == 0 || self.sections.min_per_section * 6 > self.sections.total {
            return Err(BatchError::Config(format!(
                "section totals inconsistent: total={} min_per_section={}",
                self.sections.total, self.sections.min_per_section
            )));
        }
        if self.matching.max_parallel_workers == 0 || self.scheduler.max_concurrent_jobs == 0 {
            return Err(BatchError::Config("worker counts must be positive".into()));
        }
        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(BatchError::Config(format!(
                "SCHEDULER_TZ is not a valid IANA zone: {}",
                self.scheduler.timezone
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/matchmail".into(),
            scheduler: SchedulerConfig {
                timezone: "Asia/Tokyo".into(),
                max_concurrent_jobs: 10,
                coalesce: true,
                max_instances: 1,
                misfire_grace_secs: 300,
                retry_enabled: true,
                max_retries: 5,
                retry_backoff_factor: 2.0,
                retry_max_delay_secs: 3600,
                health_check_interval_secs: 30,
                metrics_interval_secs: 15,
                resource_monitoring_enabled: true,
                job_history_retention_days: 30,
                shutdown_grace_secs: 30,
            },
            matching: MatchingConfig {
                batch_size: 100,
                max_parallel_workers: 10,
                queue_size_limit: 1000,
                strategy: MatchStrategy::Adaptive,
                user_failure_rate_threshold: 0.10,
                checkpoint_interval: 1000,
                candidate_pool_size: 200,
            },
            scoring: ScoringConfig {
                weight_base: 0.40,
                weight_seo: 0.30,
                weight_personal: 0.30,
                high_income_hourly: 1500,
                dedup_window_days: 14,
                recent_penalty_days: 14,
                batch_insert_size: 1000,
                chunk_size: 1000,
            },
            sections: SectionConfig {
                total: 40,
                min_per_section: 3,
                max_per_section: 10,
                max_jobs_per_category: 15,
            },
            targets: PerformanceTargets {
                total_runtime_secs: 1800,
                import_secs: 300,
                matching_secs: 1200,
                email_secs: 300,
                per_user_budget_ms: 180,
            },
            email: EmailConfig {
                smtp_host: None,
                smtp_port: 587,
                smtp_username: None,
                smtp_password: None,
                from_email: "jobs@matchmail.example".into(),
                from_name: "MatchMail".into(),
                base_url: "http://localhost:8080".into(),
                copywriter_endpoint: None,
                copywriter_api_key: None,
                send_batch_size: 50,
            },
        }
    }

    #[test]
    fn valid_defaults_pass() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn weight_drift_is_fatal() {
        let mut cfg = test_config();
        cfg.scoring.weight_base = 0.55;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn weight_within_tolerance_passes() {
        let mut cfg = test_config();
        cfg.scoring.weight_base = 0.405;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_timezone_is_fatal() {
        let mut cfg = test_config();
        cfg.scheduler.timezone = "Mars/Olympus".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dedup_window_is_clamped() {
        std::env::set_var("DEDUP_WINDOW_DAYS", "400");
        std::env::set_var("DATABASE_URL", "postgres://localhost/matchmail");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.scoring.dedup_window_days, 90);
        std::env::remove_var("DEDUP_WINDOW_DAYS");
    }
}
