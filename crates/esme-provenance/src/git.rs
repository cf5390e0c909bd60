use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use esme_core::{EsmeError, Result};

use crate::VersionControl;

/// [`VersionControl`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn output(&self, dir: &Path, step: &str, args: &[&str]) -> Result<Output> {
        tracing::debug!(dir = %dir.display(), ?args, "git");
        Command::new(&self.program)
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .map_err(|e| {
                EsmeError::provenance(
                    step,
                    format!("failed to execute {}: {}", self.program.display(), e),
                )
            })
    }

    /// Run git and fail with a provenance error on non-zero exit.
    fn run(&self, dir: &Path, step: &str, args: &[&str]) -> Result<String> {
        let out = self.output(dir, step, args)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
                .unwrap_or_else(|| format!("git {} exited with {}", args.join(" "), out.status));
            return Err(EsmeError::provenance(step, detail));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Run git and report only whether it succeeded.
    fn probe(&self, dir: &Path, step: &str, args: &[&str]) -> Result<Option<String>> {
        let out = self.output(dir, step, args)?;
        if out.status.success() {
            Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }
}

impl VersionControl for GitCli {
    fn init(&self, dir: &Path) -> Result<()> {
        self.run(dir, "init", &["init", "-q"]).map(|_| ())
    }

    fn is_dirty(&self, dir: &Path) -> Result<bool> {
        let status = self.run(
            dir,
            "status",
            &["status", "--porcelain", "--untracked-files=no"],
        )?;
        Ok(!status.is_empty())
    }

    fn ensure_remote(&self, dir: &Path, name: &str, url: &str) -> Result<()> {
        match self.probe(dir, "remote", &["remote", "get-url", name])? {
            Some(existing) => {
                if existing != url {
                    tracing::warn!(
                        remote = name,
                        existing = %existing,
                        requested = url,
                        "remote already exists with a different url, reusing it"
                    );
                }
                Ok(())
            }
            None => self.run(dir, "remote", &["remote", "add", name, url]).map(|_| ()),
        }
    }

    fn fetch(&self, dir: &Path, remote: &str) -> Result<()> {
        self.run(dir, "fetch", &["fetch", "-q", remote]).map(|_| ())
    }

    fn checkout_tracking(&self, dir: &Path, branch: &str, upstream: &str) -> Result<()> {
        let local_ref = format!("refs/heads/{}", branch);
        let exists = self
            .probe(dir, "checkout", &["rev-parse", "--verify", "--quiet", &local_ref])?
            .is_some();
        if exists {
            self.run(dir, "checkout", &["checkout", "-q", branch])?;
            let set_upstream = format!("--set-upstream-to={}", upstream);
            self.run(dir, "checkout", &["branch", &set_upstream, branch])?;
        } else {
            self.run(
                dir,
                "checkout",
                &["checkout", "-q", "-b", branch, "--track", upstream],
            )?;
        }
        Ok(())
    }

    fn pin(&self, dir: &Path, rev: &str) -> Result<()> {
        let spec = format!("{}^{{commit}}", rev);
        let commit = self
            .probe(dir, "pin", &["rev-parse", "--verify", "--quiet", &spec])?
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                EsmeError::provenance("pin", format!("unknown revision `{}` after fetch", rev))
            })?;
        self.run(dir, "pin", &["checkout", "-q", "--detach", &commit])
            .map(|_| ())
    }

    fn update_submodules(&self, dir: &Path) -> Result<()> {
        self.run(
            dir,
            "submodules",
            &["submodule", "update", "--init", "--recursive"],
        )
        .map(|_| ())
    }

    fn head(&self, dir: &Path) -> Result<Option<String>> {
        self.probe(dir, "head", &["rev-parse", "--verify", "--quiet", "HEAD"])
    }
}
