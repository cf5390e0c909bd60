use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EsmeError>;

#[derive(Debug, Error)]
pub enum EsmeError {
    /// Missing or invalid configuration record, unresolved machine, or an
    /// unrecognized template variable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The working copy has local modifications; nothing was changed.
    #[error("provenance blocked: {0}")]
    ProvenanceBlocked(String),

    #[error("provenance failure during {step}: {message}")]
    ProvenanceFailure { step: String, message: String },

    #[error("manifest resolution error: {0}")]
    ManifestResolution(String),

    #[error("script {} exited with status {status}", script.display())]
    ExternalScriptFailure { script: PathBuf, status: i32 },

    /// Another stage holds the experiment's lock.
    #[error("stage in progress: {0}")]
    StageInProgress(String),

    #[error("{0} is reserved and has no behavior yet")]
    NotImplemented(String),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid yaml in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl EsmeError {
    pub fn config(message: impl Into<String>) -> Self {
        EsmeError::Configuration(message.into())
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        EsmeError::ManifestResolution(message.into())
    }

    pub fn provenance(step: impl Into<String>, message: impl Into<String>) -> Self {
        EsmeError::ProvenanceFailure {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        EsmeError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn yaml(path: impl AsRef<Path>, source: serde_yaml::Error) -> Self {
        EsmeError::Yaml {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Stable machine-readable code, used by the CLI's JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            EsmeError::Configuration(_) | EsmeError::Yaml { .. } => "configuration_error",
            EsmeError::ProvenanceBlocked(_) => "provenance_blocked",
            EsmeError::ProvenanceFailure { .. } => "provenance_failure",
            EsmeError::ManifestResolution(_) => "manifest_resolution_error",
            EsmeError::ExternalScriptFailure { .. } => "external_script_failure",
            EsmeError::StageInProgress(_) => "stage_in_progress",
            EsmeError::NotImplemented(_) => "not_implemented",
            EsmeError::Io { .. } => "io_error",
        }
    }
}

/// Attach a path to an `std::io::Result`.
pub trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| EsmeError::io(path, e))
    }
}
