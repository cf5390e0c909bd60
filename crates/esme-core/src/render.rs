//! Placeholder substitution for configuration files, site scripts and manifests.
//!
//! Templates reference variables as `{{ name }}`. The set of names a template
//! may use is closed: each [`Vocabulary`] lists exactly what it recognizes, and
//! anything else is a configuration error rather than an empty substitution.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration, NaiveDate};

use crate::error::{EsmeError, Result};
use crate::site::SiteDescriptor;

pub const CONFIG_VARIABLES: &[&str] = &[
    "name",
    "today",
    "yesterday",
    "base_dir",
    "bucket_cache_location",
    "machine_name",
    "install_path",
];

pub const MANIFEST_VARIABLES: &[&str] = &["bucket_url"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    Config,
    Manifest,
}

impl Vocabulary {
    pub fn recognized(self) -> &'static [&'static str] {
        match self {
            Vocabulary::Config => CONFIG_VARIABLES,
            Vocabulary::Manifest => MANIFEST_VARIABLES,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Vocabulary::Config => "config",
            Vocabulary::Manifest => "manifest",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variables {
    vocabulary: Vocabulary,
    values: BTreeMap<&'static str, String>,
}

impl Variables {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self {
            vocabulary,
            values: BTreeMap::new(),
        }
    }

    /// Variables for a configuration file or site script written into `base_dir`.
    pub fn for_config(
        name: &str,
        today: NaiveDate,
        base_dir: &Path,
        site: &SiteDescriptor,
    ) -> Self {
        let yesterday = today - Duration::days(1);
        let mut vars = Self::new(Vocabulary::Config);
        vars.values.insert("name", name.to_string());
        vars.values.insert("today", today.format("%Y-%m-%d").to_string());
        vars.values
            .insert("yesterday", yesterday.format("%Y-%m-%d").to_string());
        vars.values
            .insert("base_dir", base_dir.to_string_lossy().to_string());
        vars.values.insert(
            "bucket_cache_location",
            site.bucket_cache_location.to_string_lossy().to_string(),
        );
        vars.values
            .insert("machine_name", site.machine_name.clone());
        vars.values.insert(
            "install_path",
            site.install_path.to_string_lossy().to_string(),
        );
        vars
    }

    pub fn for_manifest(bucket_url: &str) -> Self {
        let mut vars = Self::new(Vocabulary::Manifest);
        vars.values.insert("bucket_url", bucket_url.to_string());
        vars
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<&mut Self> {
        let known = self
            .vocabulary
            .recognized()
            .iter()
            .copied()
            .find(|k| *k == key)
            .ok_or_else(|| self.unrecognized(key))?;
        self.values.insert(known, value.into());
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn unrecognized(&self, key: &str) -> EsmeError {
        EsmeError::config(format!(
            "unrecognized {} template variable `{}` (expected one of: {})",
            self.vocabulary.as_str(),
            key,
            self.vocabulary.recognized().join(", ")
        ))
    }
}

/// Substitute every `{{ var }}` in `template`.
pub fn render(template: &str, vars: &Variables) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut consumed = 0usize;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            EsmeError::config(format!(
                "unterminated `{{{{` on line {}",
                line_of(template, consumed + open)
            ))
        })?;
        let expr = after_open[..close].trim();
        if !is_identifier(expr) {
            return Err(EsmeError::config(format!(
                "unsupported template expression `{{{{ {} }}}}` on line {}",
                expr,
                line_of(template, consumed + open)
            )));
        }
        if !vars.vocabulary.recognized().iter().any(|k| *k == expr) {
            return Err(vars.unrecognized(expr));
        }
        let value = vars.get(expr).ok_or_else(|| {
            EsmeError::config(format!("template variable `{}` has no value", expr))
        })?;
        out.push_str(value);

        let advance = open + 2 + close + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    out.push_str(rest);
    Ok(out)
}

/// True if `text` still contains a placeholder.
pub fn has_placeholders(text: &str) -> bool {
    text.contains("{{")
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}
