//! Manifest-driven population of an experiment stage directory.
//!
//! Population runs as four steps over explicit values: [`render_manifest`]
//! substitutes the bucket URL, [`parse_manifest`] validates entries, [`plan`]
//! maps them onto filesystem actions, and [`apply`] performs those actions.
//! Nothing is written until the first three have succeeded.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use esme_core::render::{has_placeholders, render, Variables};
use esme_core::{EsmeError, Result};
use serde::Deserialize;
use serde_yaml::Value;

use crate::fs::Filesystem;

const ARCHIVE_SUFFIX: &str = ".tgz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub logical_path: PathBuf,
    /// Local path the entry's `file://` URL resolves to.
    pub source: PathBuf,
}

impl ManifestEntry {
    pub fn is_archive(&self) -> bool {
        self.source.to_string_lossy().ends_with(ARCHIVE_SUFFIX)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Extract { archive: PathBuf, dest: PathBuf },
    Link { target: PathBuf, link: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateReport {
    pub extracted: usize,
    pub linked: usize,
    /// Links that already pointed at the right source.
    pub already_linked: usize,
    /// Paths occupied by something else, left untouched.
    pub left_in_place: usize,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    logical_path: PathBuf,
    source_url: String,
}

/// Substitute `{{ bucket_url }}`. Text without placeholders is returned unchanged.
pub fn render_manifest(text: &str, bucket_url: &str) -> Result<String> {
    if !has_placeholders(text) {
        return Ok(text.to_string());
    }
    render(text, &Variables::for_manifest(bucket_url))
}

/// Parse a rendered manifest.
///
/// Two layouts are accepted: a yamanifest stream (optional `format: yamanifest`
/// header document, then a mapping `logical_path: {fullpath: url}`), or a list of
/// `{logical_path, source_url}` entries.
pub fn parse_manifest(text: &str) -> Result<Manifest> {
    let mut entries = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(doc)
            .map_err(|e| EsmeError::manifest(format!("invalid manifest yaml: {}", e)))?;
        match value {
            Value::Null => {}
            Value::Mapping(map) if is_header(&map) => {}
            Value::Mapping(map) => {
                for (key, val) in map {
                    let logical = key.as_str().ok_or_else(|| {
                        EsmeError::manifest(format!("manifest key is not a string: {:?}", key))
                    })?;
                    let url = match &val {
                        Value::String(s) => s.clone(),
                        Value::Mapping(m) => m
                            .get("fullpath")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| {
                                EsmeError::manifest(format!("entry `{}` has no fullpath", logical))
                            })?,
                        other => {
                            return Err(EsmeError::manifest(format!(
                                "entry `{}` has unsupported value {:?}",
                                logical, other
                            )))
                        }
                    };
                    entries.push((PathBuf::from(logical), url));
                }
            }
            Value::Sequence(_) => {
                let list: Vec<ListEntry> = serde_yaml::from_value(value)
                    .map_err(|e| EsmeError::manifest(format!("invalid manifest entry: {}", e)))?;
                entries.extend(list.into_iter().map(|e| (e.logical_path, e.source_url)));
            }
            other => {
                return Err(EsmeError::manifest(format!(
                    "manifest document must be a mapping or a list, found {:?}",
                    other
                )))
            }
        }
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for (logical_path, url) in entries {
        check_logical_path(&logical_path)?;
        let logical_path: PathBuf = logical_path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        if !seen.insert(logical_path.clone()) {
            return Err(EsmeError::manifest(format!(
                "duplicate logical path `{}`",
                logical_path.display()
            )));
        }
        let source = local_source(&url)?;
        out.push(ManifestEntry {
            logical_path,
            source,
        });
    }
    Ok(Manifest { entries: out })
}

fn is_header(map: &serde_yaml::Mapping) -> bool {
    map.get("format").and_then(Value::as_str) == Some("yamanifest")
}

fn check_logical_path(path: &Path) -> Result<()> {
    let ok = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(EsmeError::manifest(format!(
            "logical path must be relative and stay inside the manifest directory: {}",
            path.display()
        )))
    }
}

/// Resolve a `file:` URL to an absolute local path.
pub fn local_source(url: &str) -> Result<PathBuf> {
    let (scheme, rest) = url
        .split_once(':')
        .filter(|(scheme, _)| is_scheme(scheme))
        .ok_or_else(|| {
            EsmeError::manifest(format!("source `{}` is not a URL; expected file://", url))
        })?;
    if !scheme.eq_ignore_ascii_case("file") {
        return Err(EsmeError::manifest(format!(
            "source `{}` uses scheme `{}`; only file:// sources are supported",
            url, scheme
        )));
    }
    let path = match rest.strip_prefix("//") {
        Some(authority_and_path) => {
            let split = authority_and_path.find('/').unwrap_or(authority_and_path.len());
            let (authority, path) = authority_and_path.split_at(split);
            if !authority.is_empty() && authority != "localhost" {
                return Err(EsmeError::manifest(format!(
                    "source `{}` names remote host `{}`",
                    url, authority
                )));
            }
            path
        }
        None => rest,
    };
    if !path.starts_with('/') {
        return Err(EsmeError::manifest(format!(
            "source `{}` does not resolve to an absolute path",
            url
        )));
    }
    Ok(PathBuf::from(path))
}

fn is_scheme(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
}

/// Archives unpack into the manifest's grandparent (the stage root); everything
/// else becomes a symlink next to the manifest.
pub fn plan(manifest: &Manifest, manifest_path: &Path) -> Vec<Action> {
    let manifest_dir = parent_or_dot(manifest_path);
    let stage_root = parent_or_dot(&manifest_dir);
    manifest
        .entries
        .iter()
        .map(|entry| {
            if entry.is_archive() {
                Action::Extract {
                    archive: entry.source.clone(),
                    dest: stage_root.clone(),
                }
            } else {
                Action::Link {
                    target: entry.source.clone(),
                    link: manifest_dir.join(&entry.logical_path),
                }
            }
        })
        .collect()
}

fn parent_or_dot(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn apply<F: Filesystem + ?Sized>(fs: &F, actions: &[Action]) -> Result<PopulateReport> {
    for action in actions {
        if let Action::Extract { archive, .. } = action {
            if !fs.entry_exists(archive) {
                return Err(EsmeError::manifest(format!(
                    "archive not found: {}",
                    archive.display()
                )));
            }
        }
    }

    let mut report = PopulateReport::default();
    for action in actions {
        match action {
            Action::Extract { archive, dest } => {
                tracing::debug!(archive = %archive.display(), dest = %dest.display(), "extracting");
                fs.extract_tgz(archive, dest).map_err(|e| match e {
                    EsmeError::Io { path, source } => EsmeError::manifest(format!(
                        "failed to extract {}: {}: {}",
                        archive.display(),
                        path.display(),
                        source
                    )),
                    other => other,
                })?;
                report.extracted += 1;
            }
            Action::Link { target, link } => link_once(fs, target, link, &mut report)?,
        }
    }
    Ok(report)
}

fn link_once<F: Filesystem + ?Sized>(
    fs: &F,
    target: &Path,
    link: &Path,
    report: &mut PopulateReport,
) -> Result<()> {
    match fs.read_link(link) {
        Some(existing) if existing == target => {
            report.already_linked += 1;
            return Ok(());
        }
        Some(existing) => {
            tracing::warn!(
                link = %link.display(),
                existing = %existing.display(),
                wanted = %target.display(),
                "link already points elsewhere, leaving it"
            );
            report.left_in_place += 1;
            return Ok(());
        }
        None if fs.entry_exists(link) => {
            tracing::warn!(link = %link.display(), "path already exists, leaving it");
            report.left_in_place += 1;
            return Ok(());
        }
        None => {}
    }

    if let Some(parent) = link.parent() {
        if !parent.as_os_str().is_empty() {
            fs.create_dir_all(parent)?;
        }
    }
    tracing::debug!(link = %link.display(), target = %target.display(), "linking");
    match fs.symlink(target, link) {
        Ok(()) => {
            report.linked += 1;
            Ok(())
        }
        Err(EsmeError::Io { source, .. }) if source.kind() == std::io::ErrorKind::AlreadyExists => {
            report.left_in_place += 1;
            Ok(())
        }
        Err(EsmeError::Io { path, source }) => Err(EsmeError::manifest(format!(
            "failed to link {} -> {}: {}",
            path.display(),
            target.display(),
            source
        ))),
        Err(other) => Err(other),
    }
}

/// Render, validate and materialize the manifest at `manifest_path`.
///
/// The rendered text replaces the manifest on disk only once it has parsed
/// cleanly, so a rejected manifest leaves the tree exactly as it was.
pub fn populate<F: Filesystem + ?Sized>(
    fs: &F,
    manifest_path: &Path,
    bucket_url: &str,
) -> Result<PopulateReport> {
    let raw = fs.read_to_string(manifest_path)?;
    let rendered = render_manifest(&raw, bucket_url)?;
    let manifest = parse_manifest(&rendered).map_err(|e| match e {
        EsmeError::ManifestResolution(msg) => {
            EsmeError::manifest(format!("{}: {}", manifest_path.display(), msg))
        }
        other => other,
    })?;
    let actions = plan(&manifest, manifest_path);
    if rendered != raw {
        fs.write(manifest_path, &rendered)?;
    }
    let report = apply(fs, &actions)?;
    tracing::info!(
        manifest = %manifest_path.display(),
        entries = manifest.len(),
        extracted = report.extracted,
        linked = report.linked,
        already_linked = report.already_linked,
        left_in_place = report.left_in_place,
        "manifest populated"
    );
    Ok(report)
}
