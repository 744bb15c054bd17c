use base64::Engine;
use handlebars::Handlebars;
use serde_json::json;
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::models::matching::SectionSlate;
use crate::models::user::User;

const TEXT_TEMPLATE: &str = "\
Hello,

Here is your daily shortlist.
{{#each sections}}
== {{heading}} ==
{{#each jobs}}
- {{title}}{{#if salary_line}} ({{salary_line}}){{/if}}
  {{../../base_url}}/jobs/{{job_id}}?cid={{../../correlation_id}}
{{/each}}
{{/each}}

Manage your emails: {{base_url}}/unsubscribe?token={{unsubscribe_token}}
";

const HTML_TEMPLATE: &str = r#"<html>
<body style="font-family: sans-serif; color: #222;">
  <p>Hello,</p>
  <p>Here is your daily shortlist.</p>
  {{#each sections}}
  <h3 style="border-bottom: 1px solid #ddd;">{{heading}}</h3>
  <ul>
    {{#each jobs}}
    <li>
      <a href="{{../../base_url}}/jobs/{{job_id}}?cid={{../../correlation_id}}">{{title}}</a>
      {{#if salary_line}}<span style="color: #666;"> — {{salary_line}}</span>{{/if}}
      {{#if is_fallback}}<span style="color: #999;"> ({{category_label}})</span>{{/if}}
    </li>
    {{/each}}
  </ul>
  {{/each}}
  <p style="font-size: 12px; color: #999;">
    <a href="{{base_url}}/unsubscribe?token={{unsubscribe_token}}">Unsubscribe</a>
  </p>
</body>
</html>
"#;

/// Renders one slate into the text and HTML digest bodies. Templates are
/// compiled once at startup; rendering is pure.
pub struct EmailRenderer {
    registry: Handlebars<'static>,
    base_url: String,
}

impl EmailRenderer {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry
            .register_template_string("digest_text", TEXT_TEMPLATE)
            .map_err(|e| BatchError::Config(format!("bad text template: {e}")))?;
        registry
            .register_template_string("digest_html", HTML_TEMPLATE)
            .map_err(|e| BatchError::Config(format!("bad html template: {e}")))?;
        Ok(Self {
            registry,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn render(
        &self,
        user: &User,
        slate: &SectionSlate,
        correlation_id: Uuid,
    ) -> Result<(String, String)> {
        let sections: Vec<serde_json::Value> = slate
            .sections
            .iter()
            .filter(|(_, jobs)| !jobs.is_empty())
            .map(|(kind, jobs)| {
                json!({
                    "heading": kind.heading(),
                    "jobs": jobs.iter().map(|job| {
                        json!({
                            "job_id": job.job_id,
                            "title": job.title,
                            "salary_line": salary_line(job.min_salary, job.hourly_equivalent),
                            "is_fallback": job.is_fallback,
                            "category_label": job.category_label,
                        })
                    }).collect::<Vec<_>>(),
                })
            })
            .collect();

        let data = json!({
            "sections": sections,
            "base_url": self.base_url,
            "correlation_id": correlation_id.to_string(),
            "unsubscribe_token": unsubscribe_token(user.user_id, correlation_id),
        });

        let text = self
            .registry
            .render("digest_text", &data)
            .map_err(|e| BatchError::Validation {
                field: "digest_text".into(),
                detail: e.to_string(),
            })?;
        let html = self
            .registry
            .render("digest_html", &data)
            .map_err(|e| BatchError::Validation {
                field: "digest_html".into(),
                detail: e.to_string(),
            })?;
        Ok((text, html))
    }
}

fn salary_line(min_salary: Option<i32>, hourly_equivalent: f32) -> Option<String> {
    match min_salary {
        Some(min) if min > 0 => Some(format!("from ¥{min}")),
        _ if hourly_equivalent > 0.0 => Some(format!("~¥{:.0}/h", hourly_equivalent)),
        _ => None,
    }
}

fn unsubscribe_token(user_id: i64, correlation_id: Uuid) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("{user_id}:{correlation_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::matching::{ScoredJob, SectionKind};
    use crate::services::sections::tests::digest_user;
    use chrono::Utc;

    fn slate() -> SectionSlate {
        let job = |id: i64, fallback: bool| ScoredJob {
            job_id: id,
            company_code: format!("C{id}"),
            title: format!("Job {id}"),
            category_code: 101,
            composite: 80.0,
            hourly_equivalent: 1200.0,
            location_subscore: 100.0,
            age_hours: 1.0,
            weekend_ok: false,
            short_time: false,
            category_label: if fallback { "General".into() } else { "101".into() },
            min_salary: Some(1100),
            is_fallback: fallback,
        };
        SectionSlate {
            user_id: 9,
            sections: vec![
                (SectionKind::EditorialPicks, vec![job(1, false), job(2, false)]),
                (SectionKind::HighSalary, vec![]),
                (SectionKind::Other, vec![job(3, true)]),
            ],
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn renders_both_bodies_with_links() {
        let renderer = EmailRenderer::new("https://jobs.example.com/").unwrap();
        let cid = Uuid::new_v4();
        let (text, html) = renderer.render(&digest_user(9), &slate(), cid).unwrap();

        assert!(text.contains("Today's Picks"));
        assert!(text.contains("https://jobs.example.com/jobs/1"));
        assert!(text.contains(&cid.to_string()));
        assert!(html.contains("<a href=\"https://jobs.example.com/jobs/2"));
        assert!(html.contains("Unsubscribe"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let renderer = EmailRenderer::new("https://jobs.example.com").unwrap();
        let (text, _) = renderer
            .render(&digest_user(9), &slate(), Uuid::new_v4())
            .unwrap();
        assert!(!text.contains("High Salary"));
    }

    #[test]
    fn fallback_items_show_generic_category() {
        let renderer = EmailRenderer::new("https://jobs.example.com").unwrap();
        let (_, html) = renderer
            .render(&digest_user(9), &slate(), Uuid::new_v4())
            .unwrap();
        assert!(html.contains("(General)"));
    }
}
