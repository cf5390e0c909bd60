use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use esme_core::{EsmeError, IoContext, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.yaml";

/// The experiment's `config.yaml`.
///
/// Only the repository identity is required at create time; the stage sections
/// are checked by the accessors when a stage actually needs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub code_repository_url: String,
    pub code_commit_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<SiteSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSection>,
    /// Free-form keys, kept so a re-serialized record loses nothing.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSection {
    pub bucket_url: String,
    pub machine_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSection {
    pub build_script: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupSection {
    pub setup_script: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSection {
    pub run_script: PathBuf,
}

impl ExperimentConfig {
    /// Parse `text`; `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| EsmeError::yaml(origin, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EsmeError::config(format!(
                "configuration record not found: {}",
                path.display()
            )));
        }
        let text = fs::read_to_string(path).at(path)?;
        Self::parse(&text, path)
    }

    pub fn validate_identity(&self) -> Result<()> {
        if self.code_repository_url.trim().is_empty() {
            return Err(EsmeError::config("code_repository_url is empty"));
        }
        if self.code_commit_hash.trim().is_empty() {
            return Err(EsmeError::config("code_commit_hash is empty"));
        }
        Ok(())
    }

    pub fn site(&self) -> Result<&SiteSection> {
        self.site
            .as_ref()
            .ok_or_else(|| missing("site"))
    }

    pub fn build_script(&self) -> Result<&Path> {
        let p = self.build.as_ref().map(|b| b.build_script.as_path());
        script_path("build.build_script", p)
    }

    pub fn setup_script(&self) -> Result<&Path> {
        let p = self.setup.as_ref().map(|s| s.setup_script.as_path());
        script_path("setup.setup_script", p)
    }

    pub fn run_script(&self) -> Result<&Path> {
        let p = self.run.as_ref().map(|r| r.run_script.as_path());
        script_path("run.run_script", p)
    }
}

fn missing(key: &str) -> EsmeError {
    EsmeError::config(format!("{} is missing `{}`", CONFIG_FILE, key))
}

/// Script paths are relative to the experiment directory and may not leave it.
fn script_path<'a>(key: &str, path: Option<&'a Path>) -> Result<&'a Path> {
    let path = path.ok_or_else(|| missing(key))?;
    if path.as_os_str().is_empty() {
        return Err(missing(key));
    }
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(EsmeError::config(format!(
            "`{}` must be a relative path inside the experiment: {}",
            key,
            path.display()
        )));
    }
    Ok(path)
}
