use anyhow::{Context, Result};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::{PackageManager, TMP_INSTALL_PREFIX};
use crate::archive::Unpacker;
use crate::cleanup::CleanupGuard;
use crate::error::Error;
use crate::package::spec::local_uri_path;
use crate::package::{PackageCompatibility, PackageItem, PackageMetadata, PackageSpec};
use crate::runtime::Runtime;
use crate::runtime::path::absolute_path;

/// Specs already handled during one top-level install. An entry is added
/// before the package's dependencies are visited, which ends dependency cycles.
#[derive(Debug, Default)]
pub(crate) struct InstallContext {
    history: HashMap<PackageSpec, PackageItem>,
}

/// What to do when a fetched package meets an installed one of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementAction {
    /// Replace whatever is at the canonical path.
    Overwrite,
    /// Park the installed package under a suffixed name; the new one takes the canonical path.
    DetachExisting,
    /// Keep the installed package; park the new one under a suffixed name.
    DetachNew,
}

impl PlacementAction {
    pub fn decide(incoming: &PackageMetadata, existing: Option<&PackageMetadata>) -> Self {
        let incoming_spec = incoming.spec.clone().unwrap_or_default();
        if incoming_spec.name_is_custom {
            return PlacementAction::Overwrite;
        }
        let Some(existing) = existing else {
            return PlacementAction::Overwrite;
        };
        let existing_spec = existing.spec.clone().unwrap_or_default();

        if existing_spec.external() {
            if existing_spec.uri != incoming_spec.uri {
                return PlacementAction::DetachExisting;
            }
            return PlacementAction::Overwrite;
        }
        if incoming_spec.external() {
            return PlacementAction::DetachNew;
        }
        if existing.version != incoming.version || existing_spec.owner != incoming_spec.owner {
            // The newer version holds the canonical path
            return if incoming.version > existing.version {
                PlacementAction::DetachExisting
            } else {
                PlacementAction::DetachNew
            };
        }
        PlacementAction::Overwrite
    }
}

/// `name@<version>`, or `name@src-<digest>` for packages from an external source.
fn detached_dirname(dirname: &str, metadata: &PackageMetadata) -> String {
    match metadata.spec.as_ref().and_then(|s| s.uri.as_deref()) {
        Some(uri) => {
            let digest = hex::encode(Sha256::digest(uri.as_bytes()));
            format!("{}@src-{}", dirname, &digest[..32])
        }
        None => format!("{}@{}", dirname, metadata.version),
    }
}

impl<R: Runtime> PackageManager<R> {
    /// Install `spec` and, unless skipped, its dependencies.
    #[tracing::instrument(skip(self))]
    pub async fn install(
        &self,
        spec: &PackageSpec,
        skip_dependencies: bool,
        force: bool,
    ) -> Result<PackageItem> {
        let _lock = self.lock_async().await?;
        let mut ctx = InstallContext::default();
        let pkg = self
            .install_inner(&mut ctx, spec, None, skip_dependencies, force)
            .await?;
        self.reset_cache();
        if let Err(e) = self.downloader.cleanup_expired_downloads() {
            warn!("Could not prune the download cache: {:#}", e);
        }
        Ok(pkg)
    }

    pub(crate) async fn install_inner(
        &self,
        ctx: &mut InstallContext,
        spec: &PackageSpec,
        qualifiers: Option<BTreeMap<String, Vec<String>>>,
        skip_dependencies: bool,
        force: bool,
    ) -> Result<PackageItem> {
        if let Some(pkg) = ctx.history.get(spec) {
            debug!("{} was handled earlier in this install", spec);
            return Ok(pkg.clone());
        }

        let mut installed = self.get_package(spec)?;
        if force && let Some(existing) = installed.take() {
            self.uninstall_item(&existing, true)?;
        }

        let pkg = match installed {
            Some(pkg) => {
                info!("{} is already installed", pkg);
                pkg
            }
            None => {
                info!("Installing {}", spec.humanize());
                let pkg = if spec.symlink() {
                    self.install_symlink(spec)?
                } else if let Some(uri) = &spec.uri {
                    self.install_from_uri(uri, spec, None).await?
                } else {
                    self.install_from_registry(spec, qualifiers).await?
                };
                if pkg.metadata.is_none() {
                    return Err(Error::package(format!(
                        "Could not install package '{}' for '{}' system",
                        spec.humanize(),
                        self.systype
                    ))
                    .into());
                }
                info!("{} has been installed", pkg);
                self.reset_cache();
                pkg
            }
        };

        ctx.history.insert(spec.clone(), pkg.clone());
        if !skip_dependencies && !self.always_skips_dependencies() {
            self.install_dependencies(ctx, &pkg).await;
        }
        Ok(pkg)
    }

    /// Dependency failures are logged and never abort the parent install.
    async fn install_dependencies(&self, ctx: &mut InstallContext, pkg: &PackageItem) {
        let dependencies = self.get_pkg_dependencies(pkg);
        if dependencies.is_empty() {
            return;
        }
        info!("Installing dependencies of {}", pkg);
        for dependency in dependencies {
            let compatibility = PackageCompatibility::from_dependency(&dependency);
            if let Some(env) = &self.compatibility
                && !env.is_compatible(&compatibility)
            {
                debug!("Skipping incompatible dependency {}", dependency.name);
                continue;
            }
            let spec = match Self::dependency_to_spec(&dependency) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!("Invalid dependency {} of {}: {:#}", dependency.name, pkg, e);
                    continue;
                }
            };
            let qualifiers =
                Some(compatibility.to_search_qualifiers()).filter(|q| !q.is_empty());
            if let Err(e) = Box::pin(self.install_inner(ctx, &spec, qualifiers, false, false)).await {
                match &dependency.owner {
                    Some(owner) => warn!(
                        "Could not install dependency '{}' owned by '{}' for package '{}': {:#}",
                        dependency.name, owner, pkg, e
                    ),
                    None => warn!(
                        "Could not install dependency '{}' for package '{}': {:#}",
                        dependency.name, pkg, e
                    ),
                }
            }
        }
    }

    /// Fetch a package from a local path, an archive URL or a VCS remote,
    /// stage it inside the storage root and move it into place.
    pub(crate) async fn install_from_uri(
        &self,
        uri: &str,
        spec: &PackageSpec,
        checksum: Option<&str>,
    ) -> Result<PackageItem> {
        self.runtime.create_dir_all(&self.package_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(TMP_INSTALL_PREFIX)
            .tempdir_in(&self.package_dir)
            .context("Failed to create staging directory")?;
        let guard = CleanupGuard::new(self.cleanup.clone(), staging.path().to_path_buf());

        let mut vcs_revision = None;
        if let Some(path) = local_uri_path(uri) {
            let path = absolute_path(&self.runtime.current_dir()?, Path::new(path));
            if self.runtime.is_dir(&path) {
                self.runtime.copy_dir(&path, staging.path())?;
            } else {
                self.unpack(&path, staging.path())?;
            }
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            let archive = self.downloader.download(uri, checksum).await?;
            self.unpack(&archive, staging.path())?;
        } else {
            let vcs = self.vcs.new_client(staging.path(), uri)?;
            vcs.export()?;
            vcs_revision = Some(vcs.current_revision()?);
        }

        let root_dir = self.find_pkg_root(staging.path(), spec)?;
        let metadata = self.build_metadata(&root_dir, spec, vcs_revision.as_deref())?;
        let tmp_pkg = PackageItem::new(root_dir, Some(metadata));
        tmp_pkg.dump_metadata(&self.runtime)?;

        let pkg = self.install_tmp_pkg(&tmp_pkg)?;
        guard.success();
        Ok(pkg)
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()> {
        Unpacker::new(archive)?
            .with_progress(self.progress)
            .unpack(dest)
    }

    /// Move a staged package to its final path according to [`PlacementAction`].
    pub(crate) fn install_tmp_pkg(&self, tmp_pkg: &PackageItem) -> Result<PackageItem> {
        let metadata = tmp_pkg
            .metadata
            .as_ref()
            .ok_or_else(|| Error::package(format!("No metadata for {:?}", tmp_pkg.path)))?;
        let spec = metadata.spec.clone().unwrap_or_default();
        if let Some(req) = &spec.requirements
            && !req.matches(&metadata.version)
        {
            return Err(Error::package(format!(
                "Package version {} doesn't satisfy requirements {} based on {}",
                metadata.version, req, spec
            ))
            .into());
        }

        let dirname = match (&spec.name, spec.name_is_custom) {
            (Some(name), true) => name.clone(),
            _ => crate::package::safe_dirname(&metadata.name),
        };
        let dst_path = self.package_dir.join(&dirname);
        let existing = PackageItem::load(&self.runtime, dst_path.clone());
        let action = PlacementAction::decide(metadata, existing.metadata.as_ref());
        debug!("Placing {} at {:?}: {:?}", metadata.name, dst_path, action);

        let final_path = match action {
            PlacementAction::DetachExisting => {
                let existing_meta = existing.metadata.as_ref().ok_or_else(|| {
                    Error::package(format!("No metadata for {:?}", existing.path))
                })?;
                let parked = self
                    .package_dir
                    .join(detached_dirname(&dirname, existing_meta));
                info!("Detaching {} to {:?}", existing, parked);
                self.replace_dir(&existing.path, &parked)?;
                self.replace_dir(&tmp_pkg.path, &dst_path)?;
                dst_path
            }
            PlacementAction::DetachNew => {
                let parked = self.package_dir.join(detached_dirname(&dirname, metadata));
                info!("Installing {} detached to {:?}", metadata.name, parked);
                self.replace_dir(&tmp_pkg.path, &parked)?;
                parked
            }
            PlacementAction::Overwrite => {
                self.replace_dir(&tmp_pkg.path, &dst_path)?;
                dst_path
            }
        };
        self.reset_cache();
        Ok(PackageItem::load(&self.runtime, final_path))
    }

    fn replace_dir(&self, from: &Path, to: &Path) -> Result<PathBuf> {
        if self.runtime.is_dir(to) {
            self.runtime.remove_dir_all(to)?;
        }
        self.runtime.move_dir(from, to)?;
        Ok(to.to_path_buf())
    }
}
