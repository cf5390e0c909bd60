//! Per-machine deployment parameters and hostname-based machine guessing.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::{EsmeError, IoContext, Result};

pub const UNKNOWN_MACHINE: &str = "unknown";

/// Environment variable consulted in addition to the system hostname.
pub const HOSTNAME_ENV: &str = "HOSTNAME";

/// Ordered substring rules; the first rule matching any hostname candidate wins.
const MACHINE_RULES: &[(&[&str], &str)] = &[(&["gadi"], "Gadi"), (&["irsdev", "irsweb"], "SDC")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDescriptor {
    pub machine_name: String,
    pub bucket_cache_location: PathBuf,
    pub install_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    site: Vec<SiteEntry>,
}

#[derive(Debug, Deserialize)]
struct SiteEntry {
    machine_name: String,
    #[serde(alias = "bucket_cache_location")]
    esme_bucket_cache: PathBuf,
    #[serde(default)]
    install_path: Option<PathBuf>,
}

/// Immutable table of known sites, built once per process.
#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    sites: Vec<SiteDescriptor>,
}

impl SiteRegistry {
    pub fn new(sites: Vec<SiteDescriptor>) -> Self {
        Self { sites }
    }

    /// Load `settings.yaml`. Sites without an explicit `install_path` use `default_install_path`.
    pub fn load(settings_path: &Path, default_install_path: &Path) -> Result<Self> {
        let text = fs::read_to_string(settings_path).at(settings_path)?;
        Self::from_yaml(&text, default_install_path)
            .map_err(|e| match e {
                EsmeError::Yaml { source, .. } => EsmeError::yaml(settings_path, source),
                other => other,
            })
    }

    pub fn from_yaml(text: &str, default_install_path: &Path) -> Result<Self> {
        let parsed: SettingsFile =
            serde_yaml::from_str(text).map_err(|e| EsmeError::yaml("settings.yaml", e))?;
        let sites = parsed
            .site
            .into_iter()
            .map(|entry| SiteDescriptor {
                machine_name: entry.machine_name,
                bucket_cache_location: entry.esme_bucket_cache,
                install_path: entry
                    .install_path
                    .unwrap_or_else(|| default_install_path.to_path_buf()),
            })
            .collect();
        Ok(Self { sites })
    }

    pub fn sites(&self) -> &[SiteDescriptor] {
        &self.sites
    }

    /// Exactly one descriptor must carry `machine_name`.
    pub fn resolve(&self, machine_name: &str) -> Result<&SiteDescriptor> {
        let mut matches = self
            .sites
            .iter()
            .filter(|s| s.machine_name == machine_name);
        let first = matches.next().ok_or_else(|| {
            let known: Vec<&str> = self.sites.iter().map(|s| s.machine_name.as_str()).collect();
            EsmeError::config(format!(
                "no site settings for machine `{}` (known: {})",
                machine_name,
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })?;
        if matches.next().is_some() {
            return Err(EsmeError::config(format!(
                "machine `{}` is listed more than once in site settings",
                machine_name
            )));
        }
        Ok(first)
    }
}

/// Guess the machine from hostname candidates, or [`UNKNOWN_MACHINE`].
pub fn guess_machine<S: AsRef<str>>(hostnames: &[S]) -> String {
    for host in hostnames {
        let host = host.as_ref();
        for (parts, machine) in MACHINE_RULES {
            if parts.iter().any(|p| host.contains(p)) {
                return machine.to_string();
            }
        }
    }
    UNKNOWN_MACHINE.to_string()
}

/// The system hostname followed by `$HOSTNAME`, if set.
pub fn hostname_candidates() -> Vec<String> {
    let mut out = Vec::new();
    if let Some(host) = system_hostname() {
        out.push(host);
    }
    if let Ok(h) = std::env::var(HOSTNAME_ENV) {
        if !h.trim().is_empty() {
            out.push(h.trim().to_string());
        }
    }
    tracing::debug!(candidates = ?out, "hostname candidates");
    out
}

/// Linux exposes the hostname under /proc; elsewhere ask the `hostname` utility.
fn system_hostname() -> Option<String> {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Some(host) = fs::read_to_string(path).ok().and_then(|s| non_empty(&s)) {
            return Some(host);
        }
    }
    let out = Command::new("hostname").output().ok()?;
    if !out.status.success() {
        return None;
    }
    non_empty(&String::from_utf8_lossy(&out.stdout))
}
