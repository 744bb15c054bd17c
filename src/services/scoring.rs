use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::ScoringConfig;
use crate::models::job::{FeatureBits, Job};
use crate::models::matching::MatchScore;
use crate::models::user::{Application, User, UserProfile};
use crate::services::cache::AdjacencyCache;

const SCORE_MAX: f32 = 100.0;
/// Penalty recorded when a single pair fails to score.
const ERROR_PENALTY: f32 = -100.0;

/// Packed, column-oriented view of the candidate jobs, built once per run.
/// The scoring inner loop walks these arrays with no allocation and no
/// string comparison; anything derivable from the job alone (including the
/// user-independent base score) is computed here.
pub struct JobRowSet {
    pub job_ids: Vec<i64>,
    pub company_idx: Vec<u32>,
    pub categories: Vec<i32>,
    pub major_categories: Vec<i32>,
    pub prefectures: Vec<u8>,
    pub cities: Vec<u32>,
    pub hourly: Vec<f32>,
    pub min_salaries: Vec<i32>,
    pub feature_bits: Vec<u16>,
    pub age_days: Vec<f32>,
    pub base_scores: Vec<f32>,
    companies: Vec<String>,
    company_lookup: HashMap<String, u32>,
}

impl JobRowSet {
    pub fn build(jobs: &[Job], adjacency: &AdjacencyCache, now: DateTime<Utc>) -> Self {
        let n = jobs.len();
        let mut set = Self {
            job_ids: Vec::with_capacity(n),
            company_idx: Vec::with_capacity(n),
            categories: Vec::with_capacity(n),
            major_categories: Vec::with_capacity(n),
            prefectures: Vec::with_capacity(n),
            cities: Vec::with_capacity(n),
            hourly: Vec::with_capacity(n),
            min_salaries: Vec::with_capacity(n),
            feature_bits: Vec::with_capacity(n),
            age_days: Vec::with_capacity(n),
            base_scores: Vec::with_capacity(n),
            companies: Vec::new(),
            company_lookup: HashMap::new(),
        };

        for job in jobs {
            let company = match set.company_lookup.get(&job.company_code) {
                Some(idx) => *idx,
                None => {
                    let idx = set.companies.len() as u32;
                    set.companies.push(job.company_code.clone());
                    set.company_lookup.insert(job.company_code.clone(), idx);
                    idx
                }
            };
            set.job_ids.push(job.job_id);
            set.company_idx.push(company);
            set.categories.push(job.category_code);
            set.major_categories.push(adjacency.major_of(job.category_code));
            set.prefectures.push(parse_prefecture(&job.prefecture_code));
            set.cities.push(parse_city(job.city_code.as_deref()));
            set.hourly.push(job.hourly_equivalent());
            set.min_salaries.push(job.min_salary.unwrap_or(0));
            set.feature_bits.push(job.features.0);
            let age = ((now - job.posted_at).num_minutes() as f32 / 1440.0).max(0.0);
            set.age_days.push(age);
            set.base_scores.push(base_score(job, age));
        }
        set
    }

    pub fn len(&self) -> usize {
        self.job_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }

    pub fn company_code(&self, idx: usize) -> &str {
        &self.companies[self.company_idx[idx] as usize]
    }

    /// Interned index for a company code, if any job in the set uses it.
    pub fn intern_company(&self, code: &str) -> Option<u32> {
        self.company_lookup.get(code).copied()
    }
}

// JIS X 0401 codes run 01..47; anything else maps to the unknown slot.
fn parse_prefecture(code: &str) -> u8 {
    code.parse::<u8>().ok().filter(|p| (1..=47).contains(p)).unwrap_or(0)
}

fn parse_city(code: Option<&str>) -> u32 {
    code.and_then(|c| c.parse::<u32>().ok()).unwrap_or(0)
}

/// Base score per job: fee, salary attractiveness, access, recency.
/// User-independent, so computed once per run at row set build.
fn base_score(job: &Job, age_days: f32) -> f32 {
    let fee_score = (job.fee as f32 / 5000.0 * 50.0).clamp(0.0, 50.0);

    let h = job.hourly_equivalent();
    let salary_score = if h >= 1500.0 {
        30.0
    } else if h >= 1200.0 {
        20.0
    } else if h >= 1000.0 {
        10.0
    } else {
        5.0
    };

    let mut access_score: f32 = 5.0;
    if job.station_name.is_some() {
        access_score += 15.0;
    }
    if job.address.is_some() {
        access_score += 5.0;
    }
    let access_score = access_score.min(20.0);

    let recency_bonus = if age_days <= 3.0 {
        5.0
    } else if age_days <= 7.0 {
        3.0
    } else if age_days <= 14.0 {
        1.0
    } else {
        0.0
    };

    (fee_score + salary_score + access_score + recency_bonus).clamp(0.0, SCORE_MAX)
}

/// Everything about one user the inner loop needs, precomputed so the
/// per-job work is integer compares and float math only.
pub struct UserContext {
    pub user_id: i64,
    pub prefecture: u8,
    pub city: u32,
    pub preferred_categories: Vec<i32>,
    pub preferred_majors: Vec<i32>,
    pub preferred_salary_min: Option<i32>,
    pub work_style_bits: u16,
    pub strong_feature_bits: u16,
    pub student_band: bool,
    pub daily_payment_pref: f32,
    pub latent: Vec<f32>,
    pub category_interest: HashMap<i32, f32>,
    // 90-day application aggregates
    pub applied_categories: Vec<i32>,
    pub applied_salary_bands: Vec<(f32, f32)>,
    pub applied_prefectures: Vec<u8>,
    /// Companies applied to within the penalty window.
    pub recent_companies: HashSet<u32>,
    /// adjacency[p] = user's prefecture is adjacent to prefecture p.
    pub adjacent_mask: [bool; 48],
}

fn work_style_bit(style: &str) -> u16 {
    match style {
        "remote" | "remote_work" => FeatureBits::REMOTE_WORK,
        "weekend" | "weekend_ok" => FeatureBits::WEEKEND_OK,
        "short_time" | "short" => FeatureBits::SHORT_TIME,
        "daily_payment" => FeatureBits::DAILY_PAYMENT,
        "no_experience" => FeatureBits::NO_EXPERIENCE,
        "student_welcome" => FeatureBits::STUDENT_WELCOME,
        "transportation" => FeatureBits::TRANSPORTATION,
        _ => 0,
    }
}

impl UserContext {
    pub fn build(
        user: &User,
        profile: Option<&UserProfile>,
        history: &[Application],
        rows: &JobRowSet,
        adjacency: &AdjacencyCache,
        penalty_window_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let prefecture = user
            .prefecture_code
            .as_deref()
            .map(parse_prefecture)
            .unwrap_or(0);
        let city = parse_city(user.city_code.as_deref());

        let mut preferred_majors: Vec<i32> = user
            .preferred_categories
            .iter()
            .map(|c| adjacency.major_of(*c))
            .collect();
        preferred_majors.sort_unstable();
        preferred_majors.dedup();

        let mut work_style_bits = 0u16;
        for style in &user.preferred_work_styles {
            work_style_bits |= work_style_bit(style);
        }

        let mut strong_feature_bits = 0u16;
        let mut daily_payment_pref = 0.0f32;
        let mut category_interest = HashMap::new();
        let mut latent = Vec::new();
        if let Some(p) = profile {
            for (key, score) in &p.preference_scores {
                if *score >= 0.5 {
                    strong_feature_bits |= work_style_bit(key);
                }
            }
            daily_payment_pref = p
                .preference_scores
                .get("daily_payment")
                .copied()
                .unwrap_or(0.0);
            category_interest = p.category_interest.clone();
            latent = p.latent_factors.clone();
        }

        let history_cutoff = now - chrono::Duration::days(90);
        let penalty_cutoff = now - chrono::Duration::days(penalty_window_days);
        let mut applied_categories = Vec::new();
        let mut applied_salary_bands = Vec::new();
        let mut applied_prefectures = Vec::new();
        let mut recent_companies = HashSet::new();
        for app in history {
            let applied_at = match app.applied_at {
                Some(t) => t,
                None => continue,
            };
            if applied_at < history_cutoff {
                continue;
            }
            if let Some(cat) = app.category_code {
                applied_categories.push(cat);
            }
            if let Some(salary) = app.salary {
                let s = salary as f32;
                applied_salary_bands.push((s * 0.8, s * 1.2));
            }
            if let Some(pref) = &app.prefecture_code {
                applied_prefectures.push(parse_prefecture(pref));
            }
            if applied_at >= penalty_cutoff {
                if let Some(idx) = rows.intern_company(&app.company_code) {
                    recent_companies.insert(idx);
                }
            }
        }
        applied_categories.sort_unstable();
        applied_categories.dedup();
        applied_prefectures.sort_unstable();
        applied_prefectures.dedup();

        let mut adjacent_mask = [false; 48];
        if prefecture != 0 {
            if let Some(neighbors) = adjacency.neighbors(&format!("{prefecture:02}")) {
                for n in neighbors {
                    let p = parse_prefecture(n);
                    if (p as usize) < adjacent_mask.len() {
                        adjacent_mask[p as usize] = true;
                    }
                }
            }
        }

        Self {
            user_id: user.user_id,
            prefecture,
            city,
            preferred_categories: user.preferred_categories.clone(),
            preferred_majors,
            preferred_salary_min: user.preferred_salary_min,
            work_style_bits,
            strong_feature_bits,
            student_band: user.age_group.map(|g| g.is_student_band()).unwrap_or(false),
            daily_payment_pref,
            latent,
            category_interest,
            applied_categories,
            applied_salary_bands,
            applied_prefectures,
            recent_companies,
            adjacent_mask,
        }
    }
}

/// Compact per-pair result. Component maps are materialized only for the
/// handful of rows that end up persisted (see [`ScoringEngine::explain`]).
#[derive(Debug, Clone, Copy)]
pub struct PairScore {
    pub job_idx: u32,
    pub base: f32,
    pub seo: f32,
    pub personal: f32,
    pub composite: f32,
}

/// Reusable scratch owned by each worker so scoring allocates nothing
/// per user after warmup.
#[derive(Default)]
pub struct ScoreBuffers {
    pub out: Vec<PairScore>,
    job_vec: Vec<f32>,
}

/// One bonus or penalty: a named predicate and its delta, evaluated in
/// registration order after the weighted sum.
pub struct ScoreRule {
    pub label: String,
    pub delta: f32,
    pub predicate: Box<dyn Fn(&UserContext, &JobRowSet, usize) -> bool + Send + Sync>,
}

impl ScoreRule {
    pub fn new(
        label: &str,
        delta: f32,
        predicate: impl Fn(&UserContext, &JobRowSet, usize) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.to_string(),
            delta,
            predicate: Box::new(predicate),
        }
    }
}

pub struct ScoringEngine {
    weight_base: f32,
    weight_seo: f32,
    weight_personal: f32,
    recent_penalty_days: i64,
    rules: Vec<ScoreRule>,
}

impl ScoringEngine {
    pub fn new(cfg: &ScoringConfig) -> Self {
        Self::with_rules(cfg, default_rules(cfg))
    }

    pub fn with_rules(cfg: &ScoringConfig, rules: Vec<ScoreRule>) -> Self {
        Self {
            weight_base: cfg.weight_base as f32,
            weight_seo: cfg.weight_seo as f32,
            weight_personal: cfg.weight_personal as f32,
            recent_penalty_days: cfg.recent_penalty_days,
            rules,
        }
    }

    /// Window the `recent_application` penalty looks at. Callers build
    /// `UserContext` with this, not with the dedup exclusion window.
    pub fn recent_penalty_days(&self) -> i64 {
        self.recent_penalty_days
    }

    /// Score every candidate for one user into `buffers.out`, skipping
    /// indices in `excluded` (the deduplicator's company filter).
    ///
    /// Returns the number of pairs that failed and were zero-scored.
    pub fn score_user(
        &self,
        user: &UserContext,
        rows: &JobRowSet,
        excluded: &HashSet<u32>,
        buffers: &mut ScoreBuffers,
    ) -> usize {
        buffers.out.clear();
        buffers.out.reserve(rows.len());
        let mut error_pairs = 0usize;

        for idx in 0..rows.len() {
            if excluded.contains(&rows.company_idx[idx]) {
                continue;
            }

            let base = rows.base_scores[idx];
            let seo = self.seo_score(user, rows, idx);
            let personal = self.personal_score(user, rows, idx, &mut buffers.job_vec);

            let mut composite = self.weight_base * base
                + self.weight_seo * seo
                + self.weight_personal * personal;
            for rule in &self.rules {
                if (rule.predicate)(user, rows, idx) {
                    composite += rule.delta;
                }
            }
            let composite = composite.clamp(0.0, SCORE_MAX);

            if !composite.is_finite() || !seo.is_finite() || !personal.is_finite() {
                error_pairs += 1;
                warn!(
                    user_id = user.user_id,
                    job_id = rows.job_ids[idx],
                    "non-finite score, zeroing pair"
                );
                buffers.out.push(PairScore {
                    job_idx: idx as u32,
                    base: 0.0,
                    seo: 0.0,
                    personal: 0.0,
                    composite: 0.0,
                });
                continue;
            }

            buffers.out.push(PairScore {
                job_idx: idx as u32,
                base,
                seo,
                personal,
                composite,
            });
        }
        error_pairs
    }

    /// Location + category + condition sub-scores, averaged.
    fn seo_score(&self, user: &UserContext, rows: &JobRowSet, idx: usize) -> f32 {
        let location = self.location_subscore(user, rows, idx);

        let category = if user.preferred_categories.is_empty() {
            50.0
        } else if user.preferred_categories.contains(&rows.categories[idx]) {
            100.0
        } else if user.preferred_majors.contains(&rows.major_categories[idx]) {
            60.0
        } else {
            20.0
        };

        let condition = self.condition_subscore(user, rows, idx);

        ((location + category + condition) / 3.0).clamp(0.0, SCORE_MAX)
    }

    pub fn location_subscore(&self, user: &UserContext, rows: &JobRowSet, idx: usize) -> f32 {
        let job_pref = rows.prefectures[idx];
        let remote = rows.feature_bits[idx] & FeatureBits::REMOTE_WORK != 0;
        if user.prefecture != 0 && job_pref == user.prefecture {
            // Same city keeps the same ceiling; the distinction shows up
            // in section admission, not here.
            100.0
        } else if remote {
            80.0
        } else if user.prefecture != 0 && user.adjacent_mask[job_pref as usize] {
            60.0
        } else {
            20.0
        }
    }

    fn condition_subscore(&self, user: &UserContext, rows: &JobRowSet, idx: usize) -> f32 {
        let mut total = 0u32;
        let mut matched = 0u32;

        if let Some(min) = user.preferred_salary_min {
            total += 1;
            if rows.hourly[idx] >= min as f32 {
                matched += 1;
            }
        }
        if user.work_style_bits != 0 {
            total += 1;
            if rows.feature_bits[idx] & user.work_style_bits != 0 {
                matched += 1;
            }
        }
        if user.strong_feature_bits != 0 {
            total += 1;
            if rows.feature_bits[idx] & user.strong_feature_bits != 0 {
                matched += 1;
            }
        }

        if total == 0 {
            50.0
        } else {
            matched as f32 / total as f32 * 100.0
        }
    }

    /// History + click + collaborative, weighted 0.4/0.3/0.3.
    fn personal_score(
        &self,
        user: &UserContext,
        rows: &JobRowSet,
        idx: usize,
        job_vec: &mut Vec<f32>,
    ) -> f32 {
        let history = self.history_subscore(user, rows, idx);
        let click = self.click_subscore(user, rows, idx);
        let collab = self.collaborative_subscore(user, rows, idx, job_vec);
        (0.4 * history + 0.3 * click + 0.3 * collab).clamp(0.0, SCORE_MAX)
    }

    fn history_subscore(&self, user: &UserContext, rows: &JobRowSet, idx: usize) -> f32 {
        let mut score: f32 = 25.0;
        if user.applied_categories.binary_search(&rows.categories[idx]).is_ok() {
            score += 30.0;
        }
        let hourly = rows.hourly[idx];
        if user
            .applied_salary_bands
            .iter()
            .any(|(lo, hi)| hourly >= *lo && hourly <= *hi)
        {
            score += 25.0;
        }
        if user
            .applied_prefectures
            .binary_search(&rows.prefectures[idx])
            .is_ok()
        {
            score += 20.0;
        }
        score.min(SCORE_MAX)
    }

    fn click_subscore(&self, user: &UserContext, rows: &JobRowSet, idx: usize) -> f32 {
        let mut score = 40.0;
        if let Some(interest) = user.category_interest.get(&rows.categories[idx]) {
            score += 20.0 * interest.clamp(0.0, 1.0);
        }
        let bits = rows.feature_bits[idx];
        if bits & FeatureBits::DAILY_PAYMENT != 0 {
            score += 15.0 * user.daily_payment_pref.clamp(0.0, 1.0);
        }
        if bits & FeatureBits::NO_EXPERIENCE != 0 && user.strong_feature_bits & FeatureBits::NO_EXPERIENCE != 0 {
            score += 10.0;
        }
        if bits & FeatureBits::STUDENT_WELCOME != 0 && user.strong_feature_bits & FeatureBits::STUDENT_WELCOME != 0 {
            score += 10.0;
        }
        score.min(SCORE_MAX)
    }

    fn collaborative_subscore(
        &self,
        user: &UserContext,
        rows: &JobRowSet,
        idx: usize,
        job_vec: &mut Vec<f32>,
    ) -> f32 {
        if user.latent.is_empty() {
            return 45.0;
        }
        let k = user.latent.len();
        job_vec.clear();
        job_vec.resize(k, 0.0);

        // Deterministic job feature vector: category, log-salary, then
        // one slot per feature bit, zero-padded to K.
        if k > 0 {
            job_vec[0] = rows.categories[idx] as f32 / 1000.0;
        }
        if k > 1 {
            job_vec[1] = (1.0 + rows.hourly[idx].max(0.0)).ln();
        }
        let bits = rows.feature_bits[idx];
        for bit in 0..7usize {
            let slot = 2 + bit;
            if slot >= k {
                break;
            }
            if bits & (1 << bit) != 0 {
                job_vec[slot] = 1.0;
            }
        }

        let mut dot = 0.0f32;
        let mut norm_u = 0.0f32;
        let mut norm_j = 0.0f32;
        for i in 0..k {
            dot += user.latent[i] * job_vec[i];
            norm_u += user.latent[i] * user.latent[i];
            norm_j += job_vec[i] * job_vec[i];
        }
        if norm_u == 0.0 || norm_j == 0.0 {
            return 45.0;
        }
        let cosine = (dot / (norm_u.sqrt() * norm_j.sqrt())).clamp(-1.0, 1.0);
        (cosine + 1.0) * 50.0
    }

    /// Full breakdown for a pair that is being persisted. Mirrors the
    /// inner loop exactly; only called for slate rows.
    pub fn explain(
        &self,
        user: &UserContext,
        rows: &JobRowSet,
        idx: usize,
        job_vec: &mut Vec<f32>,
    ) -> MatchScore {
        let base = rows.base_scores[idx];
        let seo = self.seo_score(user, rows, idx);
        let personal = self.personal_score(user, rows, idx, job_vec);

        let mut bonuses = HashMap::new();
        let mut penalties = HashMap::new();
        let mut composite =
            self.weight_base * base + self.weight_seo * seo + self.weight_personal * personal;
        for rule in &self.rules {
            if (rule.predicate)(user, rows, idx) {
                composite += rule.delta;
                if rule.delta >= 0.0 {
                    bonuses.insert(rule.label.clone(), rule.delta);
                } else {
                    penalties.insert(rule.label.clone(), rule.delta);
                }
            }
        }
        let composite = composite.clamp(0.0, SCORE_MAX);

        let mut components = HashMap::new();
        components.insert("base".to_string(), base);
        components.insert("seo".to_string(), seo);
        components.insert("personal".to_string(), personal);
        components.insert(
            "location".to_string(),
            self.location_subscore(user, rows, idx),
        );

        if !composite.is_finite() {
            return MatchScore {
                user_id: user.user_id,
                job_id: rows.job_ids[idx],
                base: 0.0,
                seo: 0.0,
                personal: 0.0,
                composite: 0.0,
                components: HashMap::new(),
                bonuses: HashMap::new(),
                penalties: HashMap::from([("error".to_string(), ERROR_PENALTY)]),
            };
        }

        MatchScore {
            user_id: user.user_id,
            job_id: rows.job_ids[idx],
            base,
            seo,
            personal,
            composite,
            components,
            bonuses,
            penalties,
        }
    }
}

/// The default bonus/penalty table. Order matters only for readability;
/// deltas are additive.
pub fn default_rules(cfg: &ScoringConfig) -> Vec<ScoreRule> {
    let high_income = cfg.high_income_hourly as f32;
    vec![
        ScoreRule::new("perfect_category", 15.0, |user, rows, idx| {
            user.preferred_categories.contains(&rows.categories[idx])
                && user.preferred_majors.contains(&rows.major_categories[idx])
        }),
        ScoreRule::new("high_income", 10.0, move |_, rows, idx| {
            rows.hourly[idx] >= high_income
        }),
        ScoreRule::new("daily_payment", 8.0, |user, rows, idx| {
            user.daily_payment_pref >= 0.7
                && rows.feature_bits[idx] & FeatureBits::DAILY_PAYMENT != 0
        }),
        ScoreRule::new("student_friendly", 5.0, |user, rows, idx| {
            user.student_band && rows.feature_bits[idx] & FeatureBits::STUDENT_WELCOME != 0
        }),
        ScoreRule::new("recent_application", -20.0, |user, rows, idx| {
            user.recent_companies.contains(&rows.company_idx[idx])
        }),
        ScoreRule::new("distant_prefecture", -15.0, |user, rows, idx| {
            let p = rows.prefectures[idx];
            user.prefecture != 0 && p != user.prefecture && !user.adjacent_mask[p as usize]
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::models::job::tests::test_job;
    use crate::models::job::SalaryType;
    use crate::models::user::AgeGroup;

    fn engine() -> ScoringEngine {
        ScoringEngine::new(&test_config().scoring)
    }

    fn adjacency() -> AdjacencyCache {
        AdjacencyCache::warm(
            vec![("13".into(), vec!["11".into(), "12".into(), "14".into()])],
            vec![(101, 100), (102, 100)],
        )
    }

    fn test_user(user_id: i64) -> User {
        User {
            user_id,
            email: format!("u{user_id}@example.com"),
            prefecture_code: Some("13".into()),
            city_code: None,
            age_group: Some(AgeGroup::TwentiesLate),
            gender: None,
            preferred_categories: vec![101],
            preferred_salary_min: None,
            preferred_work_styles: vec![],
            experience_level: None,
            email_enabled: true,
            is_active: true,
        }
    }

    fn context_for(user: &User, jobs: &[Job], adjacency: &AdjacencyCache) -> (JobRowSet, UserContext) {
        let now = Utc::now();
        let rows = JobRowSet::build(jobs, adjacency, now);
        let ctx = UserContext::build(user, None, &[], &rows, adjacency, 14, now);
        (rows, ctx)
    }

    #[test]
    fn fee_score_is_monotonic() {
        let adjacency = adjacency();
        let mut cheap = test_job(1);
        cheap.fee = 1000;
        let mut rich = test_job(2);
        rich.fee = 4000;
        let user = test_user(1);
        let (rows, ctx) = context_for(&user, &[cheap, rich], &adjacency);

        let mut buffers = ScoreBuffers::default();
        engine().score_user(&ctx, &rows, &HashSet::new(), &mut buffers);
        assert_eq!(buffers.out.len(), 2);
        assert!(buffers.out[1].base >= buffers.out[0].base);
        assert!(buffers.out[1].composite >= buffers.out[0].composite);
    }

    #[test]
    fn salary_steps_are_monotonic() {
        let adjacency = adjacency();
        let user = test_user(1);
        let mut prev = -1.0f32;
        for (i, hourly) in [900, 1100, 1300, 1600].iter().enumerate() {
            let mut job = test_job(i as i64 + 1);
            job.salary_type = SalaryType::Hourly;
            job.min_salary = Some(*hourly);
            job.max_salary = Some(*hourly);
            let (rows, ctx) = context_for(&user, &[job], &adjacency);
            let mut buffers = ScoreBuffers::default();
            engine().score_user(&ctx, &rows, &HashSet::new(), &mut buffers);
            let base = buffers.out[0].base;
            assert!(base >= prev, "salary step not monotonic: {base} < {prev}");
            prev = base;
        }
    }

    #[test]
    fn all_scores_stay_in_range() {
        let adjacency = adjacency();
        let mut jobs = Vec::new();
        for i in 0..50 {
            let mut job = test_job(i);
            job.fee = (i as i32) * 1000;
            job.category_code = if i % 2 == 0 { 101 } else { 305 };
            job.prefecture_code = if i % 3 == 0 { "13".into() } else { "27".into() };
            if i % 5 == 0 {
                job.features.set(FeatureBits::DAILY_PAYMENT | FeatureBits::STUDENT_WELCOME);
            }
            jobs.push(job);
        }
        let user = test_user(1);
        let (rows, ctx) = context_for(&user, &jobs, &adjacency);
        let mut buffers = ScoreBuffers::default();
        engine().score_user(&ctx, &rows, &HashSet::new(), &mut buffers);
        for pair in &buffers.out {
            assert!((0.0..=100.0).contains(&pair.base));
            assert!((0.0..=100.0).contains(&pair.seo));
            assert!((0.0..=100.0).contains(&pair.personal));
            assert!((0.0..=100.0).contains(&pair.composite));
        }
    }

    #[test]
    fn scoring_is_deterministic() {
        let adjacency = adjacency();
        let jobs: Vec<Job> = (0..20).map(test_job).collect();
        let user = test_user(1);
        let now = Utc::now();
        let rows = JobRowSet::build(&jobs, &adjacency, now);
        let ctx = UserContext::build(&user, None, &[], &rows, &adjacency, 14, now);

        let engine = engine();
        let mut a = ScoreBuffers::default();
        let mut b = ScoreBuffers::default();
        engine.score_user(&ctx, &rows, &HashSet::new(), &mut a);
        engine.score_user(&ctx, &rows, &HashSet::new(), &mut b);
        for (x, y) in a.out.iter().zip(b.out.iter()) {
            assert_eq!(x.composite.to_bits(), y.composite.to_bits());
            assert_eq!(x.seo.to_bits(), y.seo.to_bits());
            assert_eq!(x.personal.to_bits(), y.personal.to_bits());
        }
    }

    #[test]
    fn excluded_companies_are_skipped() {
        let adjacency = adjacency();
        let jobs: Vec<Job> = (0..5).map(test_job).collect();
        let user = test_user(1);
        let (rows, ctx) = context_for(&user, &jobs, &adjacency);

        let mut excluded = HashSet::new();
        excluded.insert(rows.intern_company("C2").unwrap());
        let mut buffers = ScoreBuffers::default();
        engine().score_user(&ctx, &rows, &excluded, &mut buffers);
        assert_eq!(buffers.out.len(), 4);
        assert!(buffers
            .out
            .iter()
            .all(|p| rows.job_ids[p.job_idx as usize] != 2));
    }

    #[test]
    fn collaborative_falls_back_without_latent_factors() {
        let adjacency = adjacency();
        let jobs = vec![test_job(1)];
        let user = test_user(1);
        let (rows, ctx) = context_for(&user, &jobs, &adjacency);
        assert!(ctx.latent.is_empty());
        let engine = engine();
        let mut job_vec = Vec::new();
        let score = engine.collaborative_subscore(&ctx, &rows, 0, &mut job_vec);
        assert_eq!(score, 45.0);
    }

    #[test]
    fn distant_prefecture_penalty_applies() {
        let adjacency = adjacency();
        let mut near = test_job(1);
        near.prefecture_code = "13".into();
        let mut far = test_job(2);
        far.prefecture_code = "40".into();
        let user = test_user(1);
        let (rows, ctx) = context_for(&user, &[near, far], &adjacency);
        let engine = engine();
        let mut job_vec = Vec::new();
        let near_score = engine.explain(&ctx, &rows, 0, &mut job_vec);
        let far_score = engine.explain(&ctx, &rows, 1, &mut job_vec);
        assert!(!near_score.penalties.contains_key("distant_prefecture"));
        assert!(far_score.penalties.contains_key("distant_prefecture"));
    }

    #[test]
    fn recent_application_penalty_fires_on_non_excluded_rows() {
        use crate::models::user::Application;
        use crate::services::dedup::Deduplicator;

        let adjacency = adjacency();
        // Two jobs identical except for the company.
        let clean = test_job(1);
        let mut applied = test_job(2);
        applied.company_code = "RECENT".into();
        let user = test_user(1);

        // Applied 5 days ago: outside a 3-day dedup filter, inside the
        // 14-day penalty window.
        let history = vec![Application {
            user_id: 1,
            company_code: "RECENT".into(),
            applied_at: Some(Utc::now() - chrono::Duration::days(5)),
            category_code: None,
            salary: None,
            prefecture_code: None,
        }];

        let now = Utc::now();
        let rows = JobRowSet::build(&[clean, applied], &adjacency, now);
        let dedup = Deduplicator::new(3);
        let excluded = dedup.exclusion_set(1, &history, &rows, now).excluded_companies;
        assert!(excluded.is_empty(), "5-day-old application must survive a 3-day filter");

        let engine = engine();
        let ctx = UserContext::build(
            &user,
            None,
            &history,
            &rows,
            &adjacency,
            engine.recent_penalty_days(),
            now,
        );
        assert!(ctx
            .recent_companies
            .contains(&rows.intern_company("RECENT").unwrap()));

        let mut buffers = ScoreBuffers::default();
        engine.score_user(&ctx, &rows, &excluded, &mut buffers);
        assert_eq!(buffers.out.len(), 2, "penalized row must still be scored");
        let delta = buffers.out[0].composite - buffers.out[1].composite;
        assert!((delta - 20.0).abs() < 1e-3, "expected -20 penalty, got {delta}");

        let mut job_vec = Vec::new();
        let penalized = engine.explain(&ctx, &rows, 1, &mut job_vec);
        assert_eq!(penalized.penalties.get("recent_application"), Some(&-20.0));
        let clean_score = engine.explain(&ctx, &rows, 0, &mut job_vec);
        assert!(!clean_score.penalties.contains_key("recent_application"));
    }

    #[test]
    fn stale_application_escapes_the_penalty_window() {
        use crate::models::user::Application;

        let adjacency = adjacency();
        let mut applied = test_job(1);
        applied.company_code = "STALE".into();
        let user = test_user(1);
        let history = vec![Application {
            user_id: 1,
            company_code: "STALE".into(),
            applied_at: Some(Utc::now() - chrono::Duration::days(20)),
            category_code: None,
            salary: None,
            prefecture_code: None,
        }];

        let now = Utc::now();
        let rows = JobRowSet::build(&[applied], &adjacency, now);
        let engine = engine();
        let ctx = UserContext::build(
            &user,
            None,
            &history,
            &rows,
            &adjacency,
            engine.recent_penalty_days(),
            now,
        );
        assert!(ctx.recent_companies.is_empty());

        let mut job_vec = Vec::new();
        let explained = engine.explain(&ctx, &rows, 0, &mut job_vec);
        assert!(!explained.penalties.contains_key("recent_application"));
    }

    #[test]
    fn explain_matches_inner_loop() {
        let adjacency = adjacency();
        let jobs: Vec<Job> = (0..10).map(test_job).collect();
        let user = test_user(1);
        let (rows, ctx) = context_for(&user, &jobs, &adjacency);
        let engine = engine();
        let mut buffers = ScoreBuffers::default();
        engine.score_user(&ctx, &rows, &HashSet::new(), &mut buffers);
        let mut job_vec = Vec::new();
        for pair in &buffers.out {
            let explained = engine.explain(&ctx, &rows, pair.job_idx as usize, &mut job_vec);
            assert_eq!(explained.composite.to_bits(), pair.composite.to_bits());
        }
    }
}
