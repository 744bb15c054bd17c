use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeGroup {
    Teens,
    TwentiesEarly,
    TwentiesLate,
    Thirties,
    Forties,
    FiftiesPlus,
}

impl AgeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Teens => "10s",
            AgeGroup::TwentiesEarly => "20s-early",
            AgeGroup::TwentiesLate => "20s-late",
            AgeGroup::Thirties => "30s",
            AgeGroup::Forties => "40s",
            AgeGroup::FiftiesPlus => "50s+",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "10s" => Some(AgeGroup::Teens),
            "20s-early" => Some(AgeGroup::TwentiesEarly),
            "20s-late" => Some(AgeGroup::TwentiesLate),
            "30s" => Some(AgeGroup::Thirties),
            "40s" => Some(AgeGroup::Forties),
            "50s+" => Some(AgeGroup::FiftiesPlus),
            _ => None,
        }
    }

    /// Bands eligible for the student-friendly bonus.
    pub fn is_student_band(&self) -> bool {
        matches!(self, AgeGroup::Teens | AgeGroup::TwentiesEarly)
    }
}

impl std::fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub email: String,
    pub prefecture_code: Option<String>,
    pub city_code: Option<String>,
    pub age_group: Option<AgeGroup>,
    pub gender: Option<String>,
    pub preferred_categories: Vec<i32>,
    pub preferred_salary_min: Option<i32>,
    pub preferred_work_styles: Vec<String>,
    pub experience_level: Option<i16>,
    pub email_enabled: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorStats {
    pub applications: i32,
    pub clicks: i32,
    pub views: i32,
    pub avg_salary: Option<i32>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Pre-computed behavioral profile. A hint only: scoring must degrade
/// gracefully when it is missing or stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: i64,
    pub behavior: BehaviorStats,
    pub preference_scores: HashMap<String, f32>,
    pub category_interest: HashMap<i32, f32>,
    pub latent_factors: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

/// One row of application history, consumed by the deduplicator and the
/// personal score. `applied_at` stays optional: malformed rows are kept
/// long enough to be counted as warnings, then ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub user_id: i64,
    pub company_code: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub category_code: Option<i32>,
    pub salary: Option<i32>,
    pub prefecture_code: Option<String>,
}
