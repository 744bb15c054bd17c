use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::models::user::Application;
use crate::services::scoring::JobRowSet;

/// Result of building one user's exclusion set.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Interned company indices to skip during scoring.
    pub excluded_companies: HashSet<u32>,
    /// Application rows dropped for a missing or unparseable timestamp.
    pub malformed_rows: usize,
}

/// Filters candidates from companies the user applied to recently.
/// Stateless: one hash set per user, O(|applications|) to build and
/// O(1) per candidate to test.
pub struct Deduplicator {
    window_days: i64,
}

impl Deduplicator {
    pub fn new(window_days: i64) -> Self {
        Self {
            window_days: window_days.clamp(1, 90),
        }
    }

    pub fn window_days(&self) -> i64 {
        self.window_days
    }

    pub fn exclusion_set(
        &self,
        user_id: i64,
        applications: &[Application],
        rows: &JobRowSet,
        now: DateTime<Utc>,
    ) -> DedupOutcome {
        let cutoff = now - Duration::days(self.window_days);
        let mut outcome = DedupOutcome::default();

        for app in applications {
            let applied_at = match app.applied_at {
                Some(t) => t,
                None => {
                    outcome.malformed_rows += 1;
                    warn!(
                        user_id,
                        company_code = %app.company_code,
                        "application row without applied_at, ignoring"
                    );
                    continue;
                }
            };
            if applied_at < cutoff {
                continue;
            }
            // Companies with no job in today's candidate set have no
            // interned index and nothing to exclude.
            if let Some(idx) = rows.intern_company(&app.company_code) {
                outcome.excluded_companies.insert(idx);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::tests::test_job;
    use crate::services::cache::AdjacencyCache;

    fn app(company: &str, days_ago: i64) -> Application {
        Application {
            user_id: 1,
            company_code: company.into(),
            applied_at: Some(Utc::now() - Duration::days(days_ago)),
            category_code: None,
            salary: None,
            prefecture_code: None,
        }
    }

    fn rows() -> JobRowSet {
        let jobs: Vec<_> = (1..=5).map(test_job).collect();
        JobRowSet::build(&jobs, &AdjacencyCache::default(), Utc::now())
    }

    #[test]
    fn recent_application_excludes_company() {
        let rows = rows();
        let dedup = Deduplicator::new(14);
        let outcome = dedup.exclusion_set(1, &[app("C3", 3)], &rows, Utc::now());
        assert_eq!(outcome.excluded_companies.len(), 1);
        assert!(outcome
            .excluded_companies
            .contains(&rows.intern_company("C3").unwrap()));
    }

    #[test]
    fn old_application_is_ignored() {
        let rows = rows();
        let dedup = Deduplicator::new(14);
        let outcome = dedup.exclusion_set(1, &[app("C3", 15)], &rows, Utc::now());
        assert!(outcome.excluded_companies.is_empty());
    }

    #[test]
    fn malformed_rows_are_counted_not_fatal() {
        let rows = rows();
        let dedup = Deduplicator::new(14);
        let malformed = Application {
            user_id: 1,
            company_code: "C1".into(),
            applied_at: None,
            category_code: None,
            salary: None,
            prefecture_code: None,
        };
        let outcome = dedup.exclusion_set(1, &[malformed, app("C2", 1)], &rows, Utc::now());
        assert_eq!(outcome.malformed_rows, 1);
        assert_eq!(outcome.excluded_companies.len(), 1);
    }

    #[test]
    fn window_is_clamped() {
        assert_eq!(Deduplicator::new(0).window_days(), 1);
        assert_eq!(Deduplicator::new(400).window_days(), 90);
    }

    #[test]
    fn unknown_company_is_noop() {
        let rows = rows();
        let dedup = Deduplicator::new(14);
        let outcome = dedup.exclusion_set(1, &[app("ZZZ", 1)], &rows, Utc::now());
        assert!(outcome.excluded_companies.is_empty());
    }
}
