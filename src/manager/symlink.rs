//! Packages installed by reference.
//!
//! `symlink:///path/to/tree` leaves the tree where it is and drops a small
//! `<name>.fwpm-link` descriptor into the storage root instead.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::PackageManager;
use crate::error::Error;
use crate::package::spec::local_uri_path;
use crate::package::{PackageItem, PackageSpec};
use crate::runtime::Runtime;
use crate::runtime::path::absolute_path;

pub const LINK_SUFFIX: &str = ".fwpm-link";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymlinkDescriptor {
    /// Working directory at install time; relative targets resolve against it.
    pub cwd: PathBuf,
    pub spec: PackageSpec,
}

impl SymlinkDescriptor {
    pub fn target(&self) -> Option<PathBuf> {
        let uri = self.spec.uri.as_deref()?;
        let path = local_uri_path(uri)?;
        Some(absolute_path(&self.cwd, Path::new(path)))
    }
}

pub(crate) fn is_descriptor(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(LINK_SUFFIX))
}

fn read_descriptor<R: Runtime>(runtime: &R, path: &Path) -> Result<SymlinkDescriptor> {
    let content = runtime.read_to_string(path)?;
    serde_json::from_str(&content).with_context(|| format!("Invalid link descriptor {:?}", path))
}

impl<R: Runtime> PackageManager<R> {
    /// The package a descriptor points to; `None` when the target is gone.
    pub(crate) fn get_symlinked_package(&self, descriptor: &Path) -> Option<PackageItem> {
        let link = match read_descriptor(&self.runtime, descriptor) {
            Ok(link) => link,
            Err(e) => {
                warn!("{:#}", e);
                return None;
            }
        };
        let target = link.target()?;
        let target = self.runtime.canonicalize(&target).ok()?;
        if !self.runtime.is_dir(&target) {
            debug!("Link {:?} points to missing {:?}", descriptor, target);
            return None;
        }
        let mut pkg = PackageItem::load(&self.runtime, target);
        if pkg.metadata.is_none() {
            pkg.metadata = self.build_metadata(&pkg.path, &link.spec, None).ok();
        }
        Some(pkg)
    }

    pub(crate) fn install_symlink(&self, spec: &PackageSpec) -> Result<PackageItem> {
        let cwd = self.runtime.current_dir()?;
        let link = SymlinkDescriptor {
            cwd,
            spec: spec.clone(),
        };
        let target = link
            .target()
            .filter(|path| self.runtime.is_dir(path))
            .ok_or_else(|| {
                Error::package(format!(
                    "Can not create a symbolic link for `{}`, not a directory",
                    spec.uri.as_deref().unwrap_or_default()
                ))
            })?;

        let name = spec
            .name
            .clone()
            .or_else(|| target.file_name().map(|n| n.to_string_lossy().to_string()))
            .ok_or_else(|| Error::package(format!("Could not name the link to {:?}", target)))?;
        let descriptor = self
            .package_dir
            .join(format!("{}{}", crate::package::safe_dirname(&name), LINK_SUFFIX));
        self.runtime.create_dir_all(&self.package_dir)?;
        self.runtime
            .write(&descriptor, serde_json::to_string_pretty(&link)?.as_bytes())?;
        info!("Linked {:?} as {}", target, name);
        self.reset_cache();

        self.get_symlinked_package(&descriptor).ok_or_else(|| {
            Error::package(format!("Could not load the package linked at {:?}", target)).into()
        })
    }

    /// Remove every descriptor that was created for `spec`'s source.
    pub(crate) fn uninstall_symlink(&self, spec: &PackageSpec) -> Result<()> {
        for path in self.runtime.read_dir(&self.package_dir)? {
            if !is_descriptor(&path) {
                continue;
            }
            let Ok(link) = read_descriptor(&self.runtime, &path) else {
                continue;
            };
            if link.spec.uri == spec.uri {
                debug!("Removing link {:?}", path);
                self.runtime.remove_file(&path)?;
            }
        }
        Ok(())
    }
}
