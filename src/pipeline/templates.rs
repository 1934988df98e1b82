//! Email template selection and rendering.

use crate::config::{ApplicantProfile, EmailTemplate};
use crate::error::ValidationError;

/// Used when no title can be read from the posting.
pub const DEFAULT_JOB_TITLE: &str = "Position";

const TITLE_PREFIXES: [&str; 4] = ["title", "position", "role", "job"];
const TITLE_SCAN_LINES: usize = 5;
const TITLE_MAX_CHARS: usize = 80;

/// Values substituted into `{{JOB_TITLE}}`, `{{SOURCE_LINK}}` and `{{APPLICANT_NAME}}`.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub job_title: &'a str,
    pub source_link: &'a str,
    pub applicant_name: &'a str,
}

pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    template
        .replace("{{JOB_TITLE}}", vars.job_title)
        .replace("{{SOURCE_LINK}}", vars.source_link)
        .replace("{{APPLICANT_NAME}}", vars.applicant_name)
}

/// Render both subject and body.
pub fn render_email(template: &EmailTemplate, vars: &TemplateVars<'_>) -> (String, String) {
    (render(&template.subject, vars), render(&template.body, vars))
}

/// Template `index` (default 0) of `profile`.
pub fn select_template(
    profile: &ApplicantProfile,
    index: Option<usize>,
) -> Result<&EmailTemplate, ValidationError> {
    if profile.email_templates.is_empty() {
        return Err(ValidationError::NoTemplates {
            profile_id: profile.profile_id.clone(),
        });
    }
    let index = index.unwrap_or(0);
    profile
        .email_templates
        .get(index)
        .ok_or_else(|| ValidationError::TemplateIndexOutOfRange {
            profile_id: profile.profile_id.clone(),
            index,
            len: profile.email_templates.len(),
        })
}

fn strip_bullet(line: &str) -> &str {
    line.trim()
        .trim_start_matches(['-', '*', '•', '#', '>'])
        .trim()
}

fn plausible_title(candidate: &str) -> bool {
    let len = candidate.chars().count();
    len > 5 && len < 100
}

/// Best-effort job title from the first lines of a posting.
pub fn extract_job_title(text: &str) -> String {
    for line in text.lines().take(TITLE_SCAN_LINES) {
        let line = strip_bullet(line);
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        if !TITLE_PREFIXES.contains(&label.trim().to_lowercase().as_str()) {
            continue;
        }
        let value = value.trim();
        if plausible_title(value) {
            return value.chars().take(TITLE_MAX_CHARS).collect();
        }
    }

    if let Some(first) = text.lines().map(strip_bullet).find(|l| !l.is_empty())
        && plausible_title(first)
    {
        return first.chars().take(TITLE_MAX_CHARS).collect();
    }

    DEFAULT_JOB_TITLE.to_string()
}
