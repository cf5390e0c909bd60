//! Binds an experiment directory to a pinned commit of its upstream code repository.
//!
//! The version-control tool itself sits behind [`VersionControl`]; [`GitCli`] drives
//! the `git` binary. A successful bind is recorded in `.esme/binding.yaml`, and that
//! record is what makes a later `create` for the same experiment a no-op.

mod git;
#[cfg(any(test, feature = "fake"))]
pub mod fake;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use esme_core::{atomic_write_bytes, EsmeError, IoContext, Result, STATE_DIR};
use serde::{Deserialize, Serialize};

pub use git::GitCli;

pub const REMOTE: &str = "origin";
pub const BRANCH: &str = "main";
const BINDING_FILE: &str = "binding.yaml";

/// Operations the provenance protocol needs from a version-control tool.
pub trait VersionControl {
    /// Create a repository rooted at `dir`, or open the one already there.
    fn init(&self, dir: &Path) -> Result<()>;
    /// Tracked files carry uncommitted modifications.
    fn is_dirty(&self, dir: &Path) -> Result<bool>;
    /// Add `name -> url` unless a remote called `name` already exists.
    fn ensure_remote(&self, dir: &Path, name: &str, url: &str) -> Result<()>;
    fn fetch(&self, dir: &Path, remote: &str) -> Result<()>;
    /// Create or reuse `branch` tracking `upstream`, and check it out.
    fn checkout_tracking(&self, dir: &Path, branch: &str, upstream: &str) -> Result<()>;
    /// Detach the working copy at exactly `rev`.
    fn pin(&self, dir: &Path, rev: &str) -> Result<()>;
    fn update_submodules(&self, dir: &Path) -> Result<()>;
    /// Current commit id, `None` for a repository with no commits.
    fn head(&self, dir: &Path) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub code_repository_url: String,
    pub code_commit_hash: String,
    pub head: String,
    pub bound_at: DateTime<Utc>,
}

impl BindingRecord {
    pub fn matches(&self, code_url: &str, code_hash: &str) -> bool {
        self.code_repository_url == code_url && self.code_commit_hash == code_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The working copy was bound to the pinned commit by this call.
    Bound(BindingRecord),
    /// A matching binding already existed; nothing was mutated.
    AlreadyBound(BindingRecord),
    /// Local modifications prevented any mutation.
    Blocked(String),
}

impl Outcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Outcome::Blocked(_))
    }

    /// Turn `Blocked` into [`EsmeError::ProvenanceBlocked`].
    pub fn into_result(self) -> Result<BindingRecord> {
        match self {
            Outcome::Bound(r) | Outcome::AlreadyBound(r) => Ok(r),
            Outcome::Blocked(reason) => Err(EsmeError::ProvenanceBlocked(reason)),
        }
    }
}

pub fn binding_path(experiment_dir: &Path) -> PathBuf {
    experiment_dir.join(STATE_DIR).join(BINDING_FILE)
}

pub fn read_binding(experiment_dir: &Path) -> Result<Option<BindingRecord>> {
    let path = binding_path(experiment_dir);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).at(&path)?;
    let record = serde_yaml::from_str(&text).map_err(|e| EsmeError::yaml(&path, e))?;
    Ok(Some(record))
}

/// An experiment directory opened as a version-control working copy.
pub struct Provenance<'a, V: VersionControl + ?Sized> {
    vcs: &'a V,
    dir: PathBuf,
}

impl<'a, V: VersionControl + ?Sized> Provenance<'a, V> {
    pub fn open(vcs: &'a V, experiment_dir: &Path) -> Result<Self> {
        vcs.init(experiment_dir)?;
        Ok(Self {
            vcs,
            dir: experiment_dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.vcs.is_dirty(&self.dir)
    }

    pub fn recorded(&self) -> Result<Option<BindingRecord>> {
        read_binding(&self.dir)
    }

    /// Run the remote/fetch/checkout/pin/submodule sequence and record the binding.
    ///
    /// The caller is responsible for having checked [`Self::is_dirty`]. A failure
    /// part-way leaves the working copy as it is and writes no record.
    pub fn bind(&self, code_url: &str, code_hash: &str) -> Result<BindingRecord> {
        if code_url.trim().is_empty() {
            return Err(EsmeError::config("code_repository_url is empty"));
        }
        if code_hash.trim().is_empty() {
            return Err(EsmeError::config("code_commit_hash is empty"));
        }

        tracing::info!(dir = %self.dir.display(), url = code_url, hash = code_hash, "binding experiment");
        self.vcs.ensure_remote(&self.dir, REMOTE, code_url)?;
        self.vcs.fetch(&self.dir, REMOTE)?;
        let upstream = format!("{}/{}", REMOTE, BRANCH);
        self.vcs.checkout_tracking(&self.dir, BRANCH, &upstream)?;
        self.vcs.pin(&self.dir, code_hash)?;

        let head = self
            .vcs
            .head(&self.dir)?
            .ok_or_else(|| EsmeError::provenance("pin", "HEAD is unborn after checkout"))?;
        if !head_matches(&head, code_hash) {
            return Err(EsmeError::provenance(
                "pin",
                format!("HEAD is {} but {} was requested", head, code_hash),
            ));
        }

        self.vcs.update_submodules(&self.dir)?;

        let record = BindingRecord {
            code_repository_url: code_url.to_string(),
            code_commit_hash: code_hash.to_string(),
            head,
            bound_at: Utc::now(),
        };
        let yaml = serde_yaml::to_string(&record)
            .map_err(|e| EsmeError::yaml(binding_path(&self.dir), e))?;
        atomic_write_bytes(&binding_path(&self.dir), yaml.as_bytes())?;
        tracing::info!(head = %record.head, "experiment bound");
        Ok(record)
    }
}

/// Open `experiment_dir`, refuse if dirty, and bind it to `code_hash` of `code_url`.
pub fn establish<V: VersionControl + ?Sized>(
    vcs: &V,
    experiment_dir: &Path,
    code_url: &str,
    code_hash: &str,
) -> Result<Outcome> {
    let prov = Provenance::open(vcs, experiment_dir)?;
    if prov.is_dirty()? {
        tracing::warn!(dir = %experiment_dir.display(), "working copy has local changes, not binding");
        return Ok(Outcome::Blocked("local changes present".to_string()));
    }
    if let Some(existing) = check_identity(&prov, code_url, code_hash)? {
        return Ok(Outcome::AlreadyBound(existing));
    }
    prov.bind(code_url, code_hash).map(Outcome::Bound)
}

/// Returns the existing record if it matches; errors if it names a different identity.
pub fn check_identity<V: VersionControl + ?Sized>(
    prov: &Provenance<'_, V>,
    code_url: &str,
    code_hash: &str,
) -> Result<Option<BindingRecord>> {
    match prov.recorded()? {
        Some(existing) if existing.matches(code_url, code_hash) => Ok(Some(existing)),
        Some(existing) => Err(EsmeError::config(format!(
            "experiment is already bound to {} at {}; refusing to rebind to {} at {}",
            existing.code_repository_url, existing.code_commit_hash, code_url, code_hash
        ))),
        None => Ok(None),
    }
}

fn head_matches(head: &str, requested: &str) -> bool {
    let requested = requested.trim();
    if !requested.chars().all(|c| c.is_ascii_hexdigit()) {
        // symbolic revision (tag, branch); git already resolved it
        return true;
    }
    head.to_ascii_lowercase()
        .starts_with(&requested.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeVcs;

    const URL: &str = "https://example.org/model.git";
    const HASH: &str = "0123abcd";

    #[test]
    fn establish_runs_protocol_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vcs = FakeVcs::new();
        let outcome = establish(&vcs, dir.path(), URL, HASH).expect("establish");
        let record = match outcome {
            Outcome::Bound(r) => r,
            other => panic!("expected Bound, got {:?}", other),
        };
        assert_eq!(record.code_commit_hash, HASH);
        assert_eq!(
            vcs.calls(),
            vec![
                "init",
                "is_dirty",
                "ensure_remote origin https://example.org/model.git",
                "fetch origin",
                "checkout_tracking main origin/main",
                "pin 0123abcd",
                "head",
                "update_submodules",
            ]
        );
        assert!(binding_path(dir.path()).exists());
    }

    #[test]
    fn dirty_working_copy_blocks_without_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vcs = FakeVcs::new().dirty();
        let outcome = establish(&vcs, dir.path(), URL, HASH).expect("establish");
        assert_eq!(outcome, Outcome::Blocked("local changes present".to_string()));
        assert_eq!(vcs.calls(), vec!["init", "is_dirty"]);
        assert_eq!(vcs.state().branch, None);
        assert!(!binding_path(dir.path()).exists());

        let err = outcome.into_result().expect_err("blocked");
        assert_eq!(err.code(), "provenance_blocked");
    }

    #[test]
    fn failed_fetch_leaves_no_binding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vcs = FakeVcs::new().failing_on("fetch");
        let err = establish(&vcs, dir.path(), URL, HASH).expect_err("fetch fails");
        assert_eq!(err.code(), "provenance_failure");
        assert!(read_binding(dir.path()).expect("read").is_none());
        assert!(!vcs.calls().iter().any(|c| c.starts_with("pin")));
    }

    #[test]
    fn failed_submodule_update_leaves_no_binding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vcs = FakeVcs::new().failing_on("update_submodules");
        assert!(establish(&vcs, dir.path(), URL, HASH).is_err());
        assert!(read_binding(dir.path()).expect("read").is_none());
    }

    #[test]
    fn second_establish_is_already_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vcs = FakeVcs::new();
        establish(&vcs, dir.path(), URL, HASH).expect("first");
        let again = FakeVcs::new();
        let outcome = establish(&again, dir.path(), URL, HASH).expect("second");
        assert!(matches!(outcome, Outcome::AlreadyBound(_)));
        assert_eq!(again.calls(), vec!["init", "is_dirty"]);
    }

    #[test]
    fn rebinding_to_another_commit_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        establish(&FakeVcs::new(), dir.path(), URL, HASH).expect("first");
        let err = establish(&FakeVcs::new(), dir.path(), URL, "ffff0000").expect_err("rebind");
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn pin_mismatch_is_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vcs = FakeVcs::new().with_resolved_head("9999999999");
        let err = establish(&vcs, dir.path(), URL, HASH).expect_err("mismatch");
        assert!(err.to_string().contains("was requested"), "{}", err);
    }

    #[test]
    fn head_matching_accepts_abbreviations_and_symbolic_revs() {
        assert!(head_matches("0123abcdef99", "0123ABCD"));
        assert!(!head_matches("fedcba", "0123"));
        assert!(head_matches("fedcba", "v1.2.0"));
    }
}
