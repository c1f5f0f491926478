//! File system operations (read, write, directory trees).

use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self, contents))]
    pub(crate) fn write_impl(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("Failed to write to {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn read_to_string_impl(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn rename_impl(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| format!("Failed to rename {:?} to {:?}", from, to))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn create_dir_all_impl(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).context("Failed to create directory")
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_file_impl(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("Failed to remove file {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_dir_all_impl(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory {:?} and its contents", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn exists_impl(&self, path: &Path) -> bool {
        path.exists()
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn is_dir_impl(&self, path: &Path) -> bool {
        path.is_dir()
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn is_symlink_impl(&self, path: &Path) -> bool {
        path.is_symlink()
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn read_dir_impl(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("Failed to read directory {:?}", path))?
            .map(|entry| Ok(entry?.path()))
            .collect::<Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn canonicalize_impl(&self, path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).with_context(|| format!("Failed to canonicalize {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn copy_dir_impl(&self, from: &Path, to: &Path) -> Result<()> {
        fs::create_dir_all(to).context("Failed to create directory")?;
        for entry in WalkDir::new(from).min_depth(1).follow_links(false) {
            let entry = entry.context("Failed to walk source directory")?;
            let relative = entry.path().strip_prefix(from)?;
            let target = to.join(relative);
            let file_type = entry.file_type();

            if file_type.is_symlink() {
                let link = fs::read_link(entry.path())?;
                copy_symlink(&link, &target)?;
            } else if file_type.is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                fs::copy(entry.path(), &target)
                    .with_context(|| format!("Failed to copy {:?}", entry.path()))?;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn move_dir_impl(&self, from: &Path, to: &Path) -> Result<()> {
        if fs::rename(from, to).is_ok() {
            return Ok(());
        }
        debug!("Rename failed, copying {:?} to {:?}", from, to);
        self.copy_dir_impl(from, to)?;
        fs::remove_dir_all(from).with_context(|| format!("Failed to remove {:?}", from))
    }
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).context("Failed to create symlink")
}

#[cfg(windows)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let resolved = target.parent().map(|p| p.join(link)).unwrap_or_default();
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(link, target).context("Failed to create symlink")
    } else {
        std::os::windows::fs::symlink_file(link, target).context("Failed to create symlink")
    }
}
