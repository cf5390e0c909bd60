//! Filesystem primitives used to materialize manifests.

use std::fs;
use std::path::{Path, PathBuf};

use esme_core::{atomic_write_bytes, EsmeError, IoContext, Result};
use flate2::read::GzDecoder;

pub trait Filesystem {
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn write(&self, path: &Path, contents: &str) -> Result<()>;
    /// True for any entry, including a dangling symlink.
    fn entry_exists(&self, path: &Path) -> bool;
    /// Target of `path` if it is a symlink.
    fn read_link(&self, path: &Path) -> Option<PathBuf>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
    /// Unpack a gzip-compressed tarball into `dest`, overwriting existing files.
    fn extract_tgz(&self, archive: &Path, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl Filesystem for LocalFs {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).at(path)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        atomic_write_bytes(path, contents.as_bytes())
    }

    fn entry_exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn read_link(&self, path: &Path) -> Option<PathBuf> {
        fs::read_link(path).ok()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).at(path)
    }

    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link).at(link)
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &Path, link: &Path) -> Result<()> {
        Err(EsmeError::io(
            link,
            std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks require unix"),
        ))
    }

    fn extract_tgz(&self, archive: &Path, dest: &Path) -> Result<()> {
        let file = fs::File::open(archive).at(archive)?;
        fs::create_dir_all(dest).at(dest)?;
        let mut tarball = tar::Archive::new(GzDecoder::new(file));
        tarball.set_overwrite(true);
        tarball.set_preserve_permissions(true);
        tarball.unpack(dest).map_err(|e| {
            EsmeError::manifest(format!(
                "failed to extract {} into {}: {}",
                archive.display(),
                dest.display(),
                e
            ))
        })
    }
}
