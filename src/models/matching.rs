use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The six digest sections, declared in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionKind {
    EditorialPicks,
    HighSalary,
    ExperienceMatch,
    LocationConvenient,
    WeekendShort,
    Other,
}

impl SectionKind {
    /// All sections, highest priority first.
    pub const ALL: [SectionKind; 6] = [
        SectionKind::EditorialPicks,
        SectionKind::HighSalary,
        SectionKind::ExperienceMatch,
        SectionKind::LocationConvenient,
        SectionKind::WeekendShort,
        SectionKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::EditorialPicks => "editorial_picks",
            SectionKind::HighSalary => "high_salary",
            SectionKind::ExperienceMatch => "experience_match",
            SectionKind::LocationConvenient => "location_convenient",
            SectionKind::WeekendShort => "weekend_short",
            SectionKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// 1-based dispatch priority (1 = allocated first).
    pub fn priority(&self) -> u8 {
        match self {
            SectionKind::EditorialPicks => 1,
            SectionKind::HighSalary => 2,
            SectionKind::ExperienceMatch => 3,
            SectionKind::LocationConvenient => 4,
            SectionKind::WeekendShort => 5,
            SectionKind::Other => 6,
        }
    }

    /// Per-section target size under no contention.
    pub fn target(&self) -> usize {
        match self {
            SectionKind::EditorialPicks => 8,
            SectionKind::HighSalary => 7,
            SectionKind::ExperienceMatch => 7,
            SectionKind::LocationConvenient | SectionKind::WeekendShort | SectionKind::Other => 6,
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            SectionKind::EditorialPicks => "Today's Picks",
            SectionKind::HighSalary => "High Salary",
            SectionKind::ExperienceMatch => "Matches Your Experience",
            SectionKind::LocationConvenient => "Close to You",
            SectionKind::WeekendShort => "Weekends & Short Shifts",
            SectionKind::Other => "More Recommendations",
        }
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A candidate job after scoring, carrying exactly the fields the section
/// selector and renderer need. Kept flat and copy-cheap; the full `Job`
/// stays behind in the row set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredJob {
    pub job_id: i64,
    pub company_code: String,
    pub title: String,
    pub category_code: i32,
    pub composite: f32,
    pub hourly_equivalent: f32,
    pub location_subscore: f32,
    pub age_hours: f32,
    pub weekend_ok: bool,
    pub short_time: bool,
    pub category_label: String,
    pub min_salary: Option<i32>,
    pub is_fallback: bool,
}

/// Full score breakdown for one (user, job) pair, persisted for the
/// slate items so a digest can be explained after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchScore {
    pub user_id: i64,
    pub job_id: i64,
    pub base: f32,
    pub seo: f32,
    pub personal: f32,
    pub composite: f32,
    pub components: HashMap<String, f32>,
    pub bonuses: HashMap<String, f32>,
    pub penalties: HashMap<String, f32>,
}

/// The six-section shortlist delivered to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSlate {
    pub user_id: i64,
    pub sections: Vec<(SectionKind, Vec<ScoredJob>)>,
    pub generated_at: DateTime<Utc>,
}

impl SectionSlate {
    pub fn total(&self) -> usize {
        self.sections.iter().map(|(_, jobs)| jobs.len()).sum()
    }

    pub fn iter_jobs(&self) -> impl Iterator<Item = &ScoredJob> {
        self.sections.iter().flat_map(|(_, jobs)| jobs.iter())
    }

    pub fn fallback_count(&self) -> usize {
        self.iter_jobs().filter(|j| j.is_fallback).count()
    }

    pub fn section(&self, kind: SectionKind) -> Option<&[ScoredJob]> {
        self.sections
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, jobs)| jobs.as_slice())
    }
}
