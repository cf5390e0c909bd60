//! Scripted [`VersionControl`] that records every call.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use esme_core::{EsmeError, Result};

use crate::VersionControl;

#[derive(Debug, Clone, Default)]
pub struct FakeState {
    pub dirty: bool,
    pub fail_on: Option<String>,
    pub resolved_head: Option<String>,
    pub remotes: BTreeMap<String, String>,
    pub branch: Option<String>,
    pub head: Option<String>,
    pub calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeVcs {
    state: RefCell<FakeState>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dirty(self) -> Self {
        self.state.borrow_mut().dirty = true;
        self
    }

    /// Make the named trait method fail with a provenance error.
    pub fn failing_on(self, step: &str) -> Self {
        self.state.borrow_mut().fail_on = Some(step.to_string());
        self
    }

    /// HEAD reported after `pin`, regardless of the requested revision.
    pub fn with_resolved_head(self, head: &str) -> Self {
        self.state.borrow_mut().resolved_head = Some(head.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn state(&self) -> FakeState {
        self.state.borrow().clone()
    }

    fn record(&self, step: &str, call: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(call);
        if state.fail_on.as_deref() == Some(step) {
            return Err(EsmeError::provenance(step, "injected failure"));
        }
        Ok(())
    }
}

impl VersionControl for FakeVcs {
    fn init(&self, _dir: &Path) -> Result<()> {
        self.record("init", "init".to_string())
    }

    fn is_dirty(&self, _dir: &Path) -> Result<bool> {
        self.record("is_dirty", "is_dirty".to_string())?;
        Ok(self.state.borrow().dirty)
    }

    fn ensure_remote(&self, _dir: &Path, name: &str, url: &str) -> Result<()> {
        self.record("ensure_remote", format!("ensure_remote {} {}", name, url))?;
        self.state
            .borrow_mut()
            .remotes
            .entry(name.to_string())
            .or_insert_with(|| url.to_string());
        Ok(())
    }

    fn fetch(&self, _dir: &Path, remote: &str) -> Result<()> {
        self.record("fetch", format!("fetch {}", remote))
    }

    fn checkout_tracking(&self, _dir: &Path, branch: &str, upstream: &str) -> Result<()> {
        self.record(
            "checkout_tracking",
            format!("checkout_tracking {} {}", branch, upstream),
        )?;
        let mut state = self.state.borrow_mut();
        state.branch = Some(branch.to_string());
        state.head = Some(format!("{}-tip", upstream));
        Ok(())
    }

    fn pin(&self, _dir: &Path, rev: &str) -> Result<()> {
        self.record("pin", format!("pin {}", rev))?;
        let mut state = self.state.borrow_mut();
        let head = state.resolved_head.clone().unwrap_or_else(|| rev.to_string());
        state.branch = None;
        state.head = Some(head);
        Ok(())
    }

    fn update_submodules(&self, _dir: &Path) -> Result<()> {
        self.record("update_submodules", "update_submodules".to_string())
    }

    fn head(&self, _dir: &Path) -> Result<Option<String>> {
        self.record("head", "head".to_string())?;
        Ok(self.state.borrow().head.clone())
    }
}
