use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::SectionConfig;
use crate::error::{BatchError, Result};
use crate::models::matching::{ScoredJob, SectionKind, SectionSlate};
use crate::models::user::User;

/// Distributes a score-sorted candidate pool into the six digest
/// sections. Selection is deterministic: the pool is ordered by
/// descending composite with `job_id` as the tiebreak before any
/// section sees it.
pub struct SectionSelector {
    cfg: SectionConfig,
}

impl SectionSelector {
    pub fn new(cfg: SectionConfig) -> Self {
        Self { cfg }
    }

    pub fn select(
        &self,
        pool: &[ScoredJob],
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<SectionSlate> {
        let mut ordered: Vec<ScoredJob> = pool.to_vec();
        ordered.sort_by(|a, b| {
            b.composite
                .partial_cmp(&a.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.job_id.cmp(&b.job_id))
        });

        let median_hourly = median(&ordered.iter().map(|j| j.hourly_equivalent).collect::<Vec<_>>());

        // First pass: allocate in priority order, removing picks from the
        // pool so a job lands in exactly one section.
        let mut remaining = ordered;
        let mut sections: Vec<(SectionKind, Vec<ScoredJob>)> = Vec::with_capacity(6);
        for kind in SectionKind::ALL {
            let target = kind.target().min(self.cfg.max_per_section);
            let mut picked = Vec::with_capacity(target);
            let mut rest = Vec::with_capacity(remaining.len());
            for job in remaining {
                if picked.len() < target && self.admits(kind, &job, user, median_hourly) {
                    picked.push(job);
                } else {
                    rest.push(job);
                }
            }
            remaining = rest;
            sections.push((kind, picked));
        }

        self.rebalance_minimums(&mut sections);
        self.trim_to_total(&mut sections);
        self.enforce_category_cap(&mut sections);
        self.enforce_company_cap(&mut sections);

        let slate = SectionSlate {
            user_id: user.user_id,
            sections,
            generated_at: now,
        };
        self.validate(&slate)?;
        Ok(slate)
    }

    fn admits(
        &self,
        kind: SectionKind,
        job: &ScoredJob,
        user: &User,
        median_hourly: f32,
    ) -> bool {
        let score = job.composite;
        match kind {
            SectionKind::EditorialPicks => score >= 80.0 && job.age_hours <= 24.0,
            SectionKind::HighSalary => score >= 70.0 && job.hourly_equivalent > median_hourly,
            SectionKind::ExperienceMatch => {
                score >= 60.0 && user.preferred_categories.contains(&job.category_code)
            }
            SectionKind::LocationConvenient => score >= 60.0 && job.location_subscore >= 80.0,
            SectionKind::WeekendShort => score >= 55.0 && (job.weekend_ok || job.short_time),
            SectionKind::Other => score >= 50.0,
        }
    }

    /// Pull the tail of the largest sections into any section below
    /// `min_per_section`, keeping every receiving section score-sorted.
    fn rebalance_minimums(&self, sections: &mut [(SectionKind, Vec<ScoredJob>)]) {
        let min = self.cfg.min_per_section;
        for receiver_idx in 0..sections.len() {
            while sections[receiver_idx].1.len() < min {
                let donor_idx = sections
                    .iter()
                    .enumerate()
                    .filter(|(i, (_, jobs))| *i != receiver_idx && jobs.len() > min)
                    .max_by_key(|(_, (_, jobs))| jobs.len())
                    .map(|(i, _)| i);
                let Some(donor_idx) = donor_idx else {
                    break;
                };
                let moved = sections[donor_idx].1.pop().expect("donor checked non-empty");
                insert_sorted(&mut sections[receiver_idx].1, moved);
            }
        }
    }

    /// Drop the lowest-ranked items of the lowest-priority sections until
    /// the grand total fits, keeping sections at min size where possible.
    fn trim_to_total(&self, sections: &mut [(SectionKind, Vec<ScoredJob>)]) {
        let min = self.cfg.min_per_section;
        let mut total: usize = sections.iter().map(|(_, j)| j.len()).sum();
        if total <= self.cfg.total {
            return;
        }
        for idx in (0..sections.len()).rev() {
            while total > self.cfg.total && sections[idx].1.len() > min {
                sections[idx].1.pop();
                total -= 1;
            }
        }
        // All sections at min and still over: take from the bottom anyway.
        for idx in (0..sections.len()).rev() {
            while total > self.cfg.total && !sections[idx].1.is_empty() {
                sections[idx].1.pop();
                total -= 1;
            }
        }
    }

    /// Cap per-category presence in the themed sections; excess demotes
    /// to OTHER while it has room, then drops.
    fn enforce_category_cap(&self, sections: &mut [(SectionKind, Vec<ScoredJob>)]) {
        let cap = self.cfg.max_jobs_per_category;
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for (kind, jobs) in sections.iter() {
            if *kind == SectionKind::Other {
                continue;
            }
            for job in jobs {
                *counts.entry(job.category_code).or_insert(0) += 1;
            }
        }
        let over: Vec<i32> = counts
            .iter()
            .filter(|(_, c)| **c > cap)
            .map(|(cat, _)| *cat)
            .collect();
        if over.is_empty() {
            return;
        }

        let mut demoted: Vec<ScoredJob> = Vec::new();
        for cat in over {
            let mut excess = counts[&cat] - cap;
            // Walk themed sections from lowest priority, dropping the
            // weakest entries of the over-represented category.
            for idx in (0..sections.len()).rev() {
                if sections[idx].0 == SectionKind::Other {
                    continue;
                }
                while excess > 0 {
                    let pos = sections[idx]
                        .1
                        .iter()
                        .rposition(|j| j.category_code == cat);
                    match pos {
                        Some(p) => {
                            demoted.push(sections[idx].1.remove(p));
                            excess -= 1;
                        }
                        None => break,
                    }
                }
                if excess == 0 {
                    break;
                }
            }
        }

        if let Some((_, other)) = sections
            .iter_mut()
            .find(|(kind, _)| *kind == SectionKind::Other)
        {
            for job in demoted {
                if other.len() >= self.cfg.max_per_section {
                    break;
                }
                insert_sorted(other, job);
            }
        }
    }

    /// Slate-wide company cap. Excess entries are dropped outright, the
    /// weakest and lowest-priority first.
    fn enforce_company_cap(&self, sections: &mut [(SectionKind, Vec<ScoredJob>)]) {
        let cap = self.cfg.max_jobs_per_category;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for (_, jobs) in sections.iter() {
            for job in jobs {
                *counts.entry(job.company_code.clone()).or_insert(0) += 1;
            }
        }
        for (company, count) in counts {
            let mut excess = count.saturating_sub(cap);
            for idx in (0..sections.len()).rev() {
                while excess > 0 {
                    let pos = sections[idx]
                        .1
                        .iter()
                        .rposition(|j| j.company_code == company);
                    match pos {
                        Some(p) => {
                            sections[idx].1.remove(p);
                            excess -= 1;
                        }
                        None => break,
                    }
                }
                if excess == 0 {
                    break;
                }
            }
        }
    }

    fn validate(&self, slate: &SectionSlate) -> Result<()> {
        let mut seen = HashSet::new();
        for job in slate.iter_jobs() {
            if !seen.insert(job.job_id) {
                return Err(BatchError::Section {
                    user_id: slate.user_id,
                    detail: format!("job {} appears in more than one section", job.job_id),
                });
            }
        }
        let mut companies: HashMap<&str, usize> = HashMap::new();
        for job in slate.iter_jobs() {
            *companies.entry(job.company_code.as_str()).or_insert(0) += 1;
        }
        if let Some((company, count)) = companies
            .iter()
            .find(|(_, c)| **c > self.cfg.max_jobs_per_category)
        {
            return Err(BatchError::Section {
                user_id: slate.user_id,
                detail: format!("company {company} appears {count} times"),
            });
        }
        if slate.total() > self.cfg.total {
            return Err(BatchError::Section {
                user_id: slate.user_id,
                detail: format!("slate holds {} items, cap {}", slate.total(), self.cfg.total),
            });
        }
        Ok(())
    }
}

fn insert_sorted(jobs: &mut Vec<ScoredJob>, job: ScoredJob) {
    let pos = jobs
        .iter()
        .position(|j| {
            j.composite < job.composite
                || (j.composite == job.composite && j.job_id > job.job_id)
        })
        .unwrap_or(jobs.len());
    jobs.insert(pos, job);
}

fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::models::user::AgeGroup;

    pub(crate) fn scored(job_id: i64, composite: f32) -> ScoredJob {
        ScoredJob {
            job_id,
            company_code: format!("C{job_id}"),
            title: format!("Job {job_id}"),
            category_code: 100 + (job_id % 7) as i32,
            composite,
            hourly_equivalent: 1000.0 + (job_id % 10) as f32 * 100.0,
            location_subscore: if job_id % 2 == 0 { 100.0 } else { 20.0 },
            age_hours: (job_id % 48) as f32,
            weekend_ok: job_id % 3 == 0,
            short_time: job_id % 5 == 0,
            category_label: "Retail".into(),
            min_salary: Some(1000),
            is_fallback: false,
        }
    }

    pub(crate) fn digest_user(user_id: i64) -> User {
        User {
            user_id,
            email: format!("u{user_id}@example.com"),
            prefecture_code: Some("13".into()),
            city_code: None,
            age_group: Some(AgeGroup::TwentiesEarly),
            gender: None,
            preferred_categories: vec![101, 102],
            preferred_salary_min: None,
            preferred_work_styles: vec![],
            experience_level: None,
            email_enabled: true,
            is_active: true,
        }
    }

    fn selector() -> SectionSelector {
        SectionSelector::new(test_config().sections)
    }

    #[test]
    fn rich_pool_fills_every_target_to_forty() {
        // Every admission predicate is satisfiable by plenty of jobs, so
        // the first pass alone reaches the full 40.
        let mut pool = Vec::new();
        for i in 1..=100i64 {
            let mut j = scored(i, 80.0 + (i % 20) as f32);
            j.age_hours = (i % 20) as f32;
            j.hourly_equivalent = if i % 2 == 0 { 1800.0 } else { 900.0 };
            j.category_code = if i % 2 == 0 { 101 } else { 102 };
            j.location_subscore = 100.0;
            j.weekend_ok = i % 3 == 0;
            j.short_time = i % 5 == 0;
            pool.push(j);
        }
        let slate = selector()
            .select(&pool, &digest_user(1), Utc::now())
            .unwrap();
        assert_eq!(slate.total(), 40);
        for (kind, jobs) in &slate.sections {
            assert_eq!(jobs.len(), kind.target(), "section {kind} off target");
        }
    }

    #[test]
    fn sparse_pool_keeps_sections_at_minimum() {
        let pool: Vec<ScoredJob> = (1..=200).map(|i| scored(i, 50.0 + (i % 50) as f32)).collect();
        let slate = selector()
            .select(&pool, &digest_user(1), Utc::now())
            .unwrap();
        assert!(slate.total() <= 40);
        for (_, jobs) in &slate.sections {
            assert!(jobs.len() >= 3, "section below minimum: {}", jobs.len());
        }
    }

    #[test]
    fn no_job_lands_in_two_sections() {
        let pool: Vec<ScoredJob> = (1..=120).map(|i| scored(i, 55.0 + (i % 45) as f32)).collect();
        let slate = selector()
            .select(&pool, &digest_user(1), Utc::now())
            .unwrap();
        let mut seen = HashSet::new();
        for job in slate.iter_jobs() {
            assert!(seen.insert(job.job_id), "job {} duplicated", job.job_id);
        }
    }

    #[test]
    fn small_pool_yields_small_slate() {
        let pool: Vec<ScoredJob> = (1..=10).map(|i| scored(i, 85.0)).collect();
        let slate = selector()
            .select(&pool, &digest_user(1), Utc::now())
            .unwrap();
        assert_eq!(slate.total(), 10);
    }

    #[test]
    fn editorial_picks_require_fresh_high_scores() {
        let mut stale = scored(1, 95.0);
        stale.age_hours = 30.0;
        let mut fresh = scored(2, 95.0);
        fresh.age_hours = 2.0;
        let mut weak = scored(3, 60.0);
        weak.age_hours = 1.0;
        let slate = selector()
            .select(&[stale, fresh, weak], &digest_user(1), Utc::now())
            .unwrap();
        let picks = slate.section(SectionKind::EditorialPicks).unwrap();
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].job_id, 2);
    }

    #[test]
    fn high_salary_requires_above_median() {
        let mut pool = Vec::new();
        for i in 1..=10 {
            let mut j = scored(i, 75.0);
            j.age_hours = 40.0; // keep out of editorial picks
            j.hourly_equivalent = if i <= 5 { 900.0 } else { 1800.0 };
            pool.push(j);
        }
        let slate = selector()
            .select(&pool, &digest_user(1), Utc::now())
            .unwrap();
        for job in slate.section(SectionKind::HighSalary).unwrap() {
            assert!(job.hourly_equivalent > 1350.0);
        }
    }

    #[test]
    fn company_cap_is_enforced() {
        let mut pool = Vec::new();
        for i in 1..=60 {
            let mut j = scored(i, 50.0 + (i % 40) as f32);
            j.company_code = if i <= 40 { "MEGA".into() } else { format!("C{i}") };
            pool.push(j);
        }
        let slate = selector()
            .select(&pool, &digest_user(1), Utc::now())
            .unwrap();
        let mega = slate
            .iter_jobs()
            .filter(|j| j.company_code == "MEGA")
            .count();
        assert!(mega <= 15, "company cap exceeded: {mega}");
    }

    #[test]
    fn selection_is_deterministic() {
        let pool: Vec<ScoredJob> = (1..=100).map(|i| scored(i, 50.0 + (i % 40) as f32)).collect();
        let now = Utc::now();
        let a = selector().select(&pool, &digest_user(1), now).unwrap();
        let b = selector().select(&pool, &digest_user(1), now).unwrap();
        let ids = |s: &SectionSlate| -> Vec<(SectionKind, Vec<i64>)> {
            s.sections
                .iter()
                .map(|(k, jobs)| (*k, jobs.iter().map(|j| j.job_id).collect()))
                .collect()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn sections_are_score_ordered() {
        let pool: Vec<ScoredJob> = (1..=80).map(|i| scored(i, 50.0 + (i % 45) as f32)).collect();
        let slate = selector()
            .select(&pool, &digest_user(1), Utc::now())
            .unwrap();
        for (_, jobs) in &slate.sections {
            for pair in jobs.windows(2) {
                assert!(pair[0].composite >= pair[1].composite);
            }
        }
    }
}
