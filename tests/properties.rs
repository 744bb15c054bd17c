//! Randomized invariant checks over the pure selection and scoring
//! components. Seeds are fixed so failures reproduce.

use std::collections::{HashMap, HashSet};

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use matchmail::config::Config;
use matchmail::models::job::{FeatureBits, Job, SalaryType};
use matchmail::models::matching::ScoredJob;
use matchmail::models::user::{AgeGroup, Application, User};
use matchmail::services::cache::AdjacencyCache;
use matchmail::services::dedup::Deduplicator;
use matchmail::services::scoring::{JobRowSet, ScoreBuffers, ScoringEngine, UserContext};
use matchmail::services::sections::SectionSelector;
use matchmail::services::supplement::Supplementer;

fn config() -> Config {
    std::env::set_var("DATABASE_URL", "postgres://unused/test");
    Config::from_env().unwrap()
}

fn adjacency() -> AdjacencyCache {
    AdjacencyCache::warm(
        vec![
            ("13".into(), vec!["11".into(), "12".into(), "14".into()]),
            ("27".into(), vec!["26".into(), "28".into()]),
        ],
        vec![(101, 100), (102, 100), (201, 200), (202, 200)],
    )
}

fn random_job(rng: &mut StdRng, job_id: i64) -> Job {
    let salary_type = match rng.gen_range(0..3) {
        0 => SalaryType::Hourly,
        1 => SalaryType::Daily,
        _ => SalaryType::Monthly,
    };
    let base = match salary_type {
        SalaryType::Hourly => rng.gen_range(850..2500),
        SalaryType::Daily => rng.gen_range(7_000..20_000),
        SalaryType::Monthly => rng.gen_range(150_000..400_000),
    };
    let mut features = FeatureBits::default();
    for bit in 0..7u16 {
        if rng.gen_bool(0.25) {
            features.set(1 << bit);
        }
    }
    Job {
        job_id,
        company_code: format!("COMP{}", rng.gen_range(0..40)),
        title: format!("Job {job_id}"),
        required_skills: vec![],
        preferred_skills: vec![],
        category_code: [101, 102, 201, 202, 305][rng.gen_range(0..5)],
        prefecture_code: format!("{:02}", rng.gen_range(1..=47)),
        city_code: None,
        station_name: rng.gen_bool(0.5).then(|| "Ueno".to_string()),
        address: rng.gen_bool(0.5).then(|| "1-2-3".to_string()),
        salary_type,
        min_salary: Some(base),
        max_salary: Some(base + base / 10),
        fee: rng.gen_range(0..8000),
        features,
        posted_at: Utc::now() - Duration::hours(rng.gen_range(0..24 * 20)),
        created_at: Utc::now(),
    }
}

fn random_user(rng: &mut StdRng, user_id: i64) -> User {
    User {
        user_id,
        email: format!("u{user_id}@example.com"),
        prefecture_code: rng.gen_bool(0.9).then(|| format!("{:02}", rng.gen_range(1..=47))),
        city_code: None,
        age_group: Some(
            [
                AgeGroup::Teens,
                AgeGroup::TwentiesEarly,
                AgeGroup::TwentiesLate,
                AgeGroup::Thirties,
            ][rng.gen_range(0..4)],
        ),
        gender: None,
        preferred_categories: if rng.gen_bool(0.8) {
            vec![[101, 102, 201][rng.gen_range(0..3)]]
        } else {
            vec![]
        },
        preferred_salary_min: rng.gen_bool(0.5).then(|| rng.gen_range(900..1600)),
        preferred_work_styles: if rng.gen_bool(0.4) {
            vec!["weekend_ok".into()]
        } else {
            vec![]
        },
        experience_level: None,
        email_enabled: true,
        is_active: true,
    }
}

fn score_pool(user: &User, jobs: &[Job], adjacency: &AdjacencyCache) -> Vec<ScoredJob> {
    let now = Utc::now();
    let rows = JobRowSet::build(jobs, adjacency, now);
    let ctx = UserContext::build(user, None, &[], &rows, adjacency, 14, now);
    let engine = ScoringEngine::new(&config().scoring);
    let mut buffers = ScoreBuffers::default();
    engine.score_user(&ctx, &rows, &HashSet::new(), &mut buffers);
    buffers
        .out
        .iter()
        .map(|pair| {
            let idx = pair.job_idx as usize;
            let job = &jobs[idx];
            ScoredJob {
                job_id: job.job_id,
                company_code: job.company_code.clone(),
                title: job.title.clone(),
                category_code: job.category_code,
                composite: pair.composite,
                hourly_equivalent: rows.hourly[idx],
                location_subscore: engine.location_subscore(&ctx, &rows, idx),
                age_hours: rows.age_days[idx] * 24.0,
                weekend_ok: rows.feature_bits[idx] & FeatureBits::WEEKEND_OK != 0,
                short_time: rows.feature_bits[idx] & FeatureBits::SHORT_TIME != 0,
                category_label: job.category_code.to_string(),
                min_salary: job.min_salary,
                is_fallback: false,
            }
        })
        .collect()
}

#[test]
fn every_composite_stays_in_bounds_across_random_inputs() {
    let adjacency = adjacency();
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let jobs: Vec<Job> = (1..=150).map(|i| random_job(&mut rng, i)).collect();
        let user = random_user(&mut rng, 1);
        for scored in score_pool(&user, &jobs, &adjacency) {
            assert!(
                (0.0..=100.0).contains(&scored.composite),
                "seed {seed}: composite out of range: {}",
                scored.composite
            );
        }
    }
}

#[test]
fn slate_reaches_forty_whenever_enough_candidates_exist() {
    let cfg = config();
    let adjacency = adjacency();
    let selector = SectionSelector::new(cfg.sections.clone());
    let supplementer = Supplementer::new(cfg.sections.total, cfg.sections.max_jobs_per_category);

    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(1000 + seed);
        let jobs: Vec<Job> = (1..=200).map(|i| random_job(&mut rng, i)).collect();
        let user = random_user(&mut rng, 1);
        let pool = score_pool(&user, &jobs, &adjacency);

        let mut slate = selector.select(&pool, &user, Utc::now()).unwrap();
        let chosen: HashSet<i64> = slate.iter_jobs().map(|j| j.job_id).collect();
        let leftovers: Vec<ScoredJob> = pool
            .iter()
            .filter(|j| !chosen.contains(&j.job_id))
            .cloned()
            .collect();
        supplementer.fill(&mut slate, &user, &leftovers, &HashMap::new());

        assert_eq!(slate.total(), 40, "seed {seed}: slate size {}", slate.total());
    }
}

#[test]
fn no_duplicate_jobs_and_company_cap_holds() {
    let cfg = config();
    let adjacency = adjacency();
    let selector = SectionSelector::new(cfg.sections.clone());
    let supplementer = Supplementer::new(cfg.sections.total, cfg.sections.max_jobs_per_category);

    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(2000 + seed);
        let jobs: Vec<Job> = (1..=180).map(|i| random_job(&mut rng, i)).collect();
        let user = random_user(&mut rng, 1);
        let pool = score_pool(&user, &jobs, &adjacency);

        let mut slate = selector.select(&pool, &user, Utc::now()).unwrap();
        let chosen: HashSet<i64> = slate.iter_jobs().map(|j| j.job_id).collect();
        let leftovers: Vec<ScoredJob> = pool
            .iter()
            .filter(|j| !chosen.contains(&j.job_id))
            .cloned()
            .collect();
        supplementer.fill(&mut slate, &user, &leftovers, &HashMap::new());

        let mut seen = HashSet::new();
        let mut companies: HashMap<&str, usize> = HashMap::new();
        for job in slate.iter_jobs() {
            if !job.is_fallback {
                assert!(seen.insert(job.job_id), "seed {seed}: duplicate {}", job.job_id);
                *companies.entry(job.company_code.as_str()).or_insert(0) += 1;
            }
        }
        for (company, count) in companies {
            assert!(
                count <= cfg.sections.max_jobs_per_category,
                "seed {seed}: company {company} appears {count} times"
            );
        }
    }
}

#[test]
fn dedup_window_always_suppresses_recent_companies() {
    let adjacency = adjacency();
    let dedup = Deduplicator::new(14);
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(3000 + seed);
        let jobs: Vec<Job> = (1..=100).map(|i| random_job(&mut rng, i)).collect();
        let target = jobs[rng.gen_range(0..jobs.len())].company_code.clone();

        let apps = vec![Application {
            user_id: 1,
            company_code: target.clone(),
            applied_at: Some(Utc::now() - Duration::days(rng.gen_range(0..14))),
            category_code: None,
            salary: None,
            prefecture_code: None,
        }];
        let now = Utc::now();
        let rows = JobRowSet::build(&jobs, &adjacency, now);
        let outcome = dedup.exclusion_set(1, &apps, &rows, now);

        let user = random_user(&mut rng, 1);
        let ctx = UserContext::build(&user, None, &apps, &rows, &adjacency, 14, now);
        let engine = ScoringEngine::new(&config().scoring);
        let mut buffers = ScoreBuffers::default();
        engine.score_user(&ctx, &rows, &outcome.excluded_companies, &mut buffers);

        for pair in &buffers.out {
            let company = &jobs[pair.job_idx as usize].company_code;
            assert_ne!(company, &target, "seed {seed}: suppressed company scored");
        }
    }
}

#[test]
fn recent_application_penalty_reaches_rows_the_dedup_filter_passes() {
    let adjacency = adjacency();
    // Hard exclusion covers 3 days; the penalty keeps looking back 14.
    let dedup = Deduplicator::new(3);
    let engine = ScoringEngine::new(&config().scoring);

    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(5000 + seed);
        let jobs: Vec<Job> = (1..=100).map(|i| random_job(&mut rng, i)).collect();
        let target = jobs[rng.gen_range(0..jobs.len())].company_code.clone();

        // Applied after the exclusion cutoff but inside the penalty window.
        let apps = vec![Application {
            user_id: 1,
            company_code: target.clone(),
            applied_at: Some(Utc::now() - Duration::days(rng.gen_range(4..14))),
            category_code: None,
            salary: None,
            prefecture_code: None,
        }];
        let now = Utc::now();
        let rows = JobRowSet::build(&jobs, &adjacency, now);
        let excluded = dedup.exclusion_set(1, &apps, &rows, now).excluded_companies;
        assert!(excluded.is_empty(), "seed {seed}: filter must pass the stale application");

        let user = random_user(&mut rng, 1);
        let ctx = UserContext::build(
            &user,
            None,
            &apps,
            &rows,
            &adjacency,
            engine.recent_penalty_days(),
            now,
        );

        let mut buffers = ScoreBuffers::default();
        engine.score_user(&ctx, &rows, &excluded, &mut buffers);

        let mut job_vec = Vec::new();
        let mut penalized_rows = 0usize;
        for pair in &buffers.out {
            let idx = pair.job_idx as usize;
            let explained = engine.explain(&ctx, &rows, idx, &mut job_vec);
            if jobs[idx].company_code == target {
                penalized_rows += 1;
                assert_eq!(
                    explained.penalties.get("recent_application"),
                    Some(&-20.0),
                    "seed {seed}: applied company scored without the penalty"
                );
            } else {
                assert!(
                    !explained.penalties.contains_key("recent_application"),
                    "seed {seed}: penalty leaked onto an unrelated company"
                );
            }
        }
        assert!(penalized_rows > 0, "seed {seed}: target company never scored");
    }
}

#[test]
fn fee_monotonicity_survives_weight_perturbation() {
    let adjacency = adjacency();
    for perturbation in [-0.01f64, -0.005, 0.0, 0.005, 0.01] {
        let mut cfg = config();
        cfg.scoring.weight_base += perturbation;
        cfg.scoring.weight_seo -= perturbation;
        cfg.validate().unwrap();
        let engine = ScoringEngine::new(&cfg.scoring);

        let template = |job_id: i64, fee: i32| {
            let mut rng = StdRng::seed_from_u64(42);
            let mut job = random_job(&mut rng, job_id);
            job.fee = fee;
            job
        };
        let jobs = vec![template(1, 1000), template(2, 4000)];
        let now = Utc::now();
        let rows = JobRowSet::build(&jobs, &adjacency, now);
        let mut rng = StdRng::seed_from_u64(7);
        let user = random_user(&mut rng, 1);
        let ctx = UserContext::build(&user, None, &[], &rows, &adjacency, 14, now);

        let mut buffers = ScoreBuffers::default();
        engine.score_user(&ctx, &rows, &HashSet::new(), &mut buffers);
        assert!(
            buffers.out[1].composite >= buffers.out[0].composite,
            "perturbation {perturbation}: higher fee scored lower"
        );
    }
}
