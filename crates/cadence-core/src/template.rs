//! Template renderer: substitutes recipient placeholders into text.
//!
//! Placeholders look like `{{firstName}}` (inner whitespace allowed). Known
//! keys with no value render as an empty string; unknown keys are left
//! untouched so a typo is visible in the output rather than an error.

use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Values available to templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub email: String,
    pub job_title: Option<String>,
    pub phone: Option<String>,
}

impl TemplateVars {
    fn lookup(&self, key: &str) -> Option<&str> {
        let value = match key {
            "firstName" => self.first_name.as_deref(),
            "lastName" => self.last_name.as_deref(),
            "company" | "companyName" => self.company.as_deref(),
            "email" => Some(self.email.as_str()),
            "jobTitle" | "title" => self.job_title.as_deref(),
            "phone" => self.phone.as_deref(),
            _ => return None,
        };
        Some(value.unwrap_or(""))
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_]+)\s*\}\}").expect("static regex"))
}

/// Render `template` with `vars`.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures| match vars.lookup(&caps[1]) {
            Some(v) => v.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
