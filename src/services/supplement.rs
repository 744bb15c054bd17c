use std::collections::{HashMap, HashSet};

use crate::models::matching::{ScoredJob, SectionKind, SectionSlate};
use crate::models::user::User;

/// Score assigned to synthesized fallback items.
const FALLBACK_SCORE: f32 = 25.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct SupplementOutcome {
    /// Real leftover candidates appended after widening.
    pub widened: usize,
    /// Synthetic fallback records appended.
    pub synthetic: usize,
}

/// Tops a short slate up to the configured total. Widening passes pull
/// real scored candidates the selector left behind (first keeping the
/// user's category preference, then anything), ordered by score with
/// company popularity as the tiebreak. Whatever is still missing becomes
/// clearly-flagged synthetic items.
pub struct Supplementer {
    total: usize,
    max_jobs_per_company: usize,
}

impl Supplementer {
    pub fn new(total: usize, max_jobs_per_company: usize) -> Self {
        Self {
            total,
            max_jobs_per_company,
        }
    }

    pub fn fill(
        &self,
        slate: &mut SectionSlate,
        user: &User,
        leftovers: &[ScoredJob],
        popularity: &HashMap<String, f32>,
    ) -> SupplementOutcome {
        let mut outcome = SupplementOutcome::default();
        if slate.total() >= self.total {
            return outcome;
        }

        let mut used_ids: HashSet<i64> = slate.iter_jobs().map(|j| j.job_id).collect();
        let mut company_counts: HashMap<String, usize> = HashMap::new();
        for job in slate.iter_jobs() {
            *company_counts.entry(job.company_code.clone()).or_insert(0) += 1;
        }

        let mut ranked: Vec<&ScoredJob> = leftovers
            .iter()
            .filter(|j| !used_ids.contains(&j.job_id))
            .collect();
        ranked.sort_by(|a, b| {
            b.composite
                .partial_cmp(&a.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let pa = popularity.get(&a.company_code).copied().unwrap_or(0.0);
                    let pb = popularity.get(&b.company_code).copied().unwrap_or(0.0);
                    pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then(a.job_id.cmp(&b.job_id))
        });

        // Pass 1: location dropped, category preference kept.
        // Pass 2: everything.
        let passes: [&dyn Fn(&ScoredJob) -> bool; 2] = [
            &|j: &ScoredJob| {
                user.preferred_categories.is_empty()
                    || user.preferred_categories.contains(&j.category_code)
            },
            &|_: &ScoredJob| true,
        ];

        for pass in passes {
            if slate.total() >= self.total {
                break;
            }
            for job in &ranked {
                if slate.total() >= self.total {
                    break;
                }
                if used_ids.contains(&job.job_id) || !pass(job) {
                    continue;
                }
                let count = company_counts.entry(job.company_code.clone()).or_insert(0);
                if *count >= self.max_jobs_per_company {
                    continue;
                }
                *count += 1;
                used_ids.insert(job.job_id);
                push_other(slate, (*job).clone());
                outcome.widened += 1;
            }
        }

        // Synthetic fallbacks for whatever is still missing.
        let missing = self.total.saturating_sub(slate.total());
        for n in 0..missing {
            push_other(slate, synthetic_item(user, n));
            outcome.synthetic += 1;
        }
        outcome
    }
}

fn push_other(slate: &mut SectionSlate, job: ScoredJob) {
    if let Some((_, other)) = slate
        .sections
        .iter_mut()
        .find(|(kind, _)| *kind == SectionKind::Other)
    {
        other.push(job);
    } else {
        slate.sections.push((SectionKind::Other, vec![job]));
    }
}

/// Placeholder record for an empty shortfall slot. Negative job ids keep
/// these out of the persisted score rows; the renderer shows them with
/// the generic category.
fn synthetic_item(user: &User, n: usize) -> ScoredJob {
    ScoredJob {
        job_id: -(n as i64 + 1),
        company_code: String::new(),
        title: "More jobs picked for you".into(),
        category_code: 0,
        composite: FALLBACK_SCORE,
        hourly_equivalent: user.preferred_salary_min.unwrap_or(0) as f32,
        location_subscore: 0.0,
        age_hours: 0.0,
        weekend_ok: false,
        short_time: false,
        category_label: "General".into(),
        min_salary: user.preferred_salary_min,
        is_fallback: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sections::tests::{digest_user, scored};
    use chrono::Utc;

    fn empty_slate(user_id: i64) -> SectionSlate {
        SectionSlate {
            user_id,
            sections: SectionKind::ALL.iter().map(|k| (*k, Vec::new())).collect(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn shortfall_is_filled_to_exactly_forty() {
        let user = digest_user(1);
        let mut slate = empty_slate(1);
        for i in 1..=12 {
            push_other(&mut slate, scored(i, 70.0));
        }
        let outcome = Supplementer::new(40, 15).fill(&mut slate, &user, &[], &HashMap::new());
        assert_eq!(slate.total(), 40);
        assert_eq!(outcome.synthetic, 28);
        assert_eq!(slate.fallback_count(), 28);
        assert!(slate
            .iter_jobs()
            .filter(|j| j.is_fallback)
            .all(|j| j.category_label == "General" && j.composite == 25.0));
    }

    #[test]
    fn widening_prefers_real_candidates() {
        let user = digest_user(1);
        let mut slate = empty_slate(1);
        for i in 1..=35 {
            push_other(&mut slate, scored(i, 70.0));
        }
        let leftovers: Vec<_> = (100..=120).map(|i| scored(i, 52.0)).collect();
        let outcome =
            Supplementer::new(40, 15).fill(&mut slate, &user, &leftovers, &HashMap::new());
        assert_eq!(slate.total(), 40);
        assert_eq!(outcome.synthetic, 0);
        assert_eq!(outcome.widened, 5);
    }

    #[test]
    fn category_preference_ordering_in_widening() {
        let mut user = digest_user(1);
        user.preferred_categories = vec![101];
        let mut slate = empty_slate(1);
        for i in 1..=38 {
            push_other(&mut slate, scored(i * 1000, 70.0));
        }
        // Two leftovers with equal score: one preferred category, one not.
        let mut preferred = scored(300, 52.0);
        preferred.category_code = 101;
        let mut other_cat = scored(200, 52.0);
        other_cat.category_code = 999;
        let outcome = Supplementer::new(40, 15).fill(
            &mut slate,
            &user,
            &[other_cat, preferred],
            &HashMap::new(),
        );
        assert_eq!(outcome.widened, 2);
        let others = slate.section(SectionKind::Other).unwrap();
        let appended: Vec<i64> = others.iter().rev().take(2).map(|j| j.job_id).collect();
        // Preferred category was admitted in pass 1, the other in pass 2.
        assert_eq!(appended, vec![200, 300]);
    }

    #[test]
    fn popularity_breaks_score_ties() {
        let user = digest_user(1);
        let mut slate = empty_slate(1);
        for i in 1..=39 {
            push_other(&mut slate, scored(i * 1000, 70.0));
        }
        let a = scored(11, 52.0);
        let b = scored(12, 52.0);
        let popularity = HashMap::from([("C12".to_string(), 90.0f32), ("C11".to_string(), 10.0)]);
        Supplementer::new(40, 15).fill(&mut slate, &user, &[a, b], &popularity);
        let last = slate.section(SectionKind::Other).unwrap().last().unwrap();
        assert_eq!(last.job_id, 12, "more popular company should win the slot");
    }

    #[test]
    fn full_slate_is_untouched() {
        let user = digest_user(1);
        let mut slate = empty_slate(1);
        for i in 1..=40 {
            push_other(&mut slate, scored(i, 70.0));
        }
        let outcome = Supplementer::new(40, 15).fill(&mut slate, &user, &[], &HashMap::new());
        assert_eq!(outcome.widened + outcome.synthetic, 0);
        assert_eq!(slate.total(), 40);
    }
}
