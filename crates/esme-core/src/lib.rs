pub mod error;
pub mod render;
pub mod site;

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Utc;

pub use error::{EsmeError, IoContext, Result};
pub use render::{render, Variables, Vocabulary};
pub use site::{guess_machine, hostname_candidates, SiteDescriptor, SiteRegistry, UNKNOWN_MACHINE};

/// Per-experiment bookkeeping directory (lock file, binding record).
pub const STATE_DIR: &str = ".esme";

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).at(path)
}

/// Write through a sibling temp file and rename, so readers never observe a partial file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).at(&tmp)?;
    file.write_all(bytes).at(&tmp)?;
    file.sync_all().at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(())
}
