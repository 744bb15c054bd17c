use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SalaryType {
    Hourly,
    Daily,
    Monthly,
}

impl SalaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SalaryType::Hourly => "hourly",
            SalaryType::Daily => "daily",
            SalaryType::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(SalaryType::Hourly),
            "daily" => Some(SalaryType::Daily),
            "monthly" => Some(SalaryType::Monthly),
            _ => None,
        }
    }

    /// Divisor that converts this salary type to an hourly figure.
    /// Daily assumes an 8h shift, monthly 160 working hours.
    pub fn hourly_divisor(&self) -> f32 {
        match self {
            SalaryType::Hourly => 1.0,
            SalaryType::Daily => 8.0,
            SalaryType::Monthly => 160.0,
        }
    }
}

impl std::fmt::Display for SalaryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job feature flags packed into one word so the scoring loop can test
/// them with a single mask operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBits(pub u16);

impl FeatureBits {
    pub const DAILY_PAYMENT: u16 = 1 << 0;
    pub const NO_EXPERIENCE: u16 = 1 << 1;
    pub const STUDENT_WELCOME: u16 = 1 << 2;
    pub const TRANSPORTATION: u16 = 1 << 3;
    pub const REMOTE_WORK: u16 = 1 << 4;
    pub const WEEKEND_OK: u16 = 1 << 5;
    pub const SHORT_TIME: u16 = 1 << 6;

    pub fn has(self, mask: u16) -> bool {
        self.0 & mask != 0
    }

    pub fn set(&mut self, mask: u16) {
        self.0 |= mask;
    }

    /// Count of features shared between job and user preference masks.
    pub fn overlap(self, other: FeatureBits) -> u32 {
        (self.0 & other.0).count_ones()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: i64,
    /// Deduplication identity: one prior application to this company
    /// suppresses all of its jobs within the dedup window.
    pub company_code: String,
    pub title: String,
    pub required_skills: Vec<String>,
    pub preferred_skills: Vec<String>,
    pub category_code: i32,
    pub prefecture_code: String,
    pub city_code: Option<String>,
    pub station_name: Option<String>,
    pub address: Option<String>,
    pub salary_type: SalaryType,
    pub min_salary: Option<i32>,
    pub max_salary: Option<i32>,
    pub fee: i32,
    pub features: FeatureBits,
    pub posted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Hourly wage equivalent used for salary attractiveness and the
    /// high-salary section cut. Prefers the max of the advertised range.
    pub fn hourly_equivalent(&self) -> f32 {
        let salary = self.max_salary.or(self.min_salary).unwrap_or(0);
        salary as f32 / self.salary_type.hourly_divisor()
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f32 {
        ((now - self.posted_at).num_minutes() as f32 / 60.0).max(0.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn hourly_equivalent_normalizes_by_salary_type() {
        let mut job = test_job(1);
        job.salary_type = SalaryType::Monthly;
        job.max_salary = Some(256_000);
        assert_eq!(job.hourly_equivalent(), 1600.0);

        job.salary_type = SalaryType::Daily;
        job.max_salary = Some(12_000);
        assert_eq!(job.hourly_equivalent(), 1500.0);
    }

    #[test]
    fn feature_overlap_counts_shared_bits() {
        let mut a = FeatureBits::default();
        a.set(FeatureBits::DAILY_PAYMENT);
        a.set(FeatureBits::WEEKEND_OK);
        let mut b = FeatureBits::default();
        b.set(FeatureBits::WEEKEND_OK);
        b.set(FeatureBits::SHORT_TIME);
        assert_eq!(a.overlap(b), 1);
    }

    pub(crate) fn test_job(job_id: i64) -> Job {
        Job {
            job_id,
            company_code: format!("C{job_id}"),
            title: format!("Job {job_id}"),
            required_skills: vec![],
            preferred_skills: vec![],
            category_code: 100,
            prefecture_code: "13".into(),
            city_code: None,
            station_name: None,
            address: None,
            salary_type: SalaryType::Hourly,
            min_salary: Some(1000),
            max_salary: Some(1200),
            fee: 2000,
            features: FeatureBits::default(),
            posted_at: Utc::now(),
            created_at: Utc::now(),
        }
    }
}
