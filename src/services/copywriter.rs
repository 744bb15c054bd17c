use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::matching::SectionSlate;
use crate::models::user::User;

const REQUEST_BUDGET: Duration = Duration::from_secs(5);

/// Optional LLM-backed subject line generator. Strictly best-effort:
/// one retry inside a fixed budget, then the deterministic template.
/// The pipeline never waits on it beyond the budget.
pub struct Copywriter {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct CopyRequest<'a> {
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CopyResponse {
    subject: String,
}

impl Copywriter {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_BUDGET)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint,
            api_key,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub async fn subject_for(&self, user: &User, slate: &SectionSlate) -> String {
        let Some(endpoint) = &self.endpoint else {
            return fallback_subject(slate);
        };

        let top_titles: Vec<&str> = slate
            .iter_jobs()
            .filter(|j| !j.is_fallback)
            .take(3)
            .map(|j| j.title.as_str())
            .collect();
        let prompt = format!(
            "Write one short email subject (max 40 chars) for a daily job digest. \
             Top jobs: {}. Recipient age group: {}.",
            top_titles.join("; "),
            user.age_group.map(|g| g.as_str()).unwrap_or("unknown"),
        );

        for attempt in 0..2u8 {
            match self.request(endpoint, &prompt).await {
                Ok(subject) if !subject.trim().is_empty() => {
                    return subject.trim().to_string();
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(user_id = user.user_id, attempt, error = %e, "copywriter call failed");
                }
            }
        }
        fallback_subject(slate)
    }

    async fn request(
        &self,
        endpoint: &str,
        prompt: &str,
    ) -> std::result::Result<String, reqwest::Error> {
        let mut req = self.client.post(endpoint).json(&CopyRequest {
            prompt,
            max_tokens: 48,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await?.error_for_status()?;
        let body: CopyResponse = response.json().await?;
        Ok(body.subject)
    }
}

/// Deterministic subject used whenever the generator is disabled or
/// misbehaves.
pub fn fallback_subject(slate: &SectionSlate) -> String {
    let real = slate.iter_jobs().filter(|j| !j.is_fallback).count();
    match slate.iter_jobs().find(|j| !j.is_fallback) {
        Some(top) if real > 1 => {
            format!("{} and {} more jobs picked for you", truncate(&top.title, 24), real - 1)
        }
        Some(top) => format!("New for you: {}", truncate(&top.title, 32)),
        None => "Today's job picks for you".to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::matching::{ScoredJob, SectionKind};
    use chrono::Utc;

    fn slate_with(titles: &[&str]) -> SectionSlate {
        let jobs: Vec<ScoredJob> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| ScoredJob {
                job_id: i as i64 + 1,
                company_code: format!("C{i}"),
                title: t.to_string(),
                category_code: 101,
                composite: 80.0,
                hourly_equivalent: 1200.0,
                location_subscore: 100.0,
                age_hours: 1.0,
                weekend_ok: false,
                short_time: false,
                category_label: "101".into(),
                min_salary: None,
                is_fallback: false,
            })
            .collect();
        SectionSlate {
            user_id: 1,
            sections: vec![(SectionKind::EditorialPicks, jobs)],
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn fallback_mentions_top_job_and_count() {
        let slate = slate_with(&["Cafe staff", "Cleaner", "Driver"]);
        assert_eq!(fallback_subject(&slate), "Cafe staff and 2 more jobs picked for you");
    }

    #[test]
    fn single_job_gets_simple_subject() {
        let slate = slate_with(&["Cafe staff"]);
        assert_eq!(fallback_subject(&slate), "New for you: Cafe staff");
    }

    #[test]
    fn empty_slate_gets_generic_subject() {
        let slate = slate_with(&[]);
        assert_eq!(fallback_subject(&slate), "Today's job picks for you");
    }

    #[test]
    fn long_titles_are_truncated() {
        let slate = slate_with(&["An exceptionally long job title that keeps going", "B"]);
        let subject = fallback_subject(&slate);
        assert!(subject.chars().count() <= 60);
        assert!(subject.contains('…'));
    }

    #[tokio::test]
    async fn disabled_copywriter_uses_fallback() {
        let writer = Copywriter::disabled();
        let slate = slate_with(&["Cafe staff"]);
        let user = crate::services::sections::tests::digest_user(1);
        assert_eq!(writer.subject_for(&user, &slate).await, "New for you: Cafe staff");
    }
}
