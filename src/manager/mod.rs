//! Package manager engine.
//!
//! One [`PackageManager`] owns one storage root (`lib/`, `platforms/` or
//! `packages/`). Every mutating call holds the root's [`LockFile`] for its
//! whole duration, so two managers on the same root, in this process or
//! another, never interleave.
//!
//! # Structure
//!
//! - `install` - install state machine and the placement policy
//! - `uninstall` - removal and promotion of detached copies
//! - `update` / `outdated` - version comparison against the sources
//! - `registry` - registry lookups and mirror iteration
//! - `symlink` - packages installed by reference to a working tree
//! - `legacy` - metadata for packages installed without a `.fwpm` file
//! - `kinds` - library/platform/tool specializations

mod install;
mod kinds;
mod legacy;
mod outdated;
mod registry;
mod symlink;
mod uninstall;
mod update;

use anyhow::Result;
use log::{debug, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cleanup::{self, SharedCleanupContext};
use crate::config::Config;
use crate::download::Downloader;
use crate::error::Error;
use crate::lockfile::LockFile;
use crate::package::manifest::find_manifest;
use crate::package::spec::local_uri_path;
use crate::package::version::{generate_rand_version, version_with_revision};
use crate::package::{
    Manifest, ManifestDependency, PackageCompatibility, PackageItem, PackageMetadata, PackageSpec,
    PackageType, cast_version_to_semver,
};
use crate::registry::RegistryClient;
use crate::runtime::Runtime;
use crate::runtime::path::{absolute_path, normalize_path};
use crate::vcs::{CommandVcsFactory, VcsFactory};

pub use install::PlacementAction;
pub use kinds::find_library_root;
pub use symlink::{LINK_SUFFIX, SymlinkDescriptor};

/// Prefix of staging directories inside the storage root.
pub const TMP_INSTALL_PREFIX: &str = "_tmp_installing";

pub struct PackageManager<R: Runtime> {
    runtime: R,
    pkg_type: PackageType,
    package_dir: PathBuf,
    systype: String,
    progress: bool,
    registry: Arc<dyn RegistryClient>,
    vcs: Arc<dyn VcsFactory>,
    downloader: Downloader,
    compatibility: Option<PackageCompatibility>,
    cleanup: SharedCleanupContext,
    /// Memoized `get_installed`, dropped on every mutation.
    installed: Mutex<Option<Vec<PackageItem>>>,
}

impl<R: Runtime> PackageManager<R> {
    pub fn new(
        runtime: R,
        pkg_type: PackageType,
        package_dir: PathBuf,
        config: &Config,
        registry: Arc<dyn RegistryClient>,
    ) -> Result<Self> {
        Ok(Self {
            runtime,
            pkg_type,
            package_dir,
            systype: config.systype.clone(),
            progress: config.progress,
            registry,
            vcs: Arc::new(CommandVcsFactory),
            downloader: Downloader::from_config(config)?,
            compatibility: None,
            cleanup: cleanup::new_shared(),
            installed: Mutex::new(None),
        })
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VcsFactory>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_cleanup(mut self, cleanup: SharedCleanupContext) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Environment qualifiers that dependency candidates must match.
    pub fn with_compatibility(mut self, compatibility: PackageCompatibility) -> Self {
        self.compatibility = Some(compatibility);
        self
    }

    pub fn pkg_type(&self) -> PackageType {
        self.pkg_type
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn manifest_names(&self) -> &'static [&'static str] {
        self.pkg_type.manifest_names()
    }

    fn root_lock(&self) -> Result<LockFile> {
        self.runtime.create_dir_all(&self.package_dir)?;
        Ok(LockFile::new(&self.package_dir))
    }

    pub(crate) fn lock(&self) -> Result<LockFile> {
        self.root_lock()?.acquire()
    }

    pub(crate) async fn lock_async(&self) -> Result<LockFile> {
        self.root_lock()?.acquire_async().await
    }

    pub(crate) fn reset_cache(&self) {
        match self.installed.lock() {
            Ok(mut cache) => *cache = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn load_manifest(&self, pkg_dir: &Path) -> Result<Manifest> {
        Manifest::from_dir(&self.runtime, pkg_dir, self.manifest_names())
    }

    /// Locate the package root inside freshly fetched contents, searching one
    /// directory level at a time.
    pub(crate) fn find_pkg_root(&self, path: &Path, spec: &PackageSpec) -> Result<PathBuf> {
        let mut queue = VecDeque::from([path.to_path_buf()]);
        while let Some(dir) = queue.pop_front() {
            if find_manifest(&self.runtime, &dir, self.manifest_names()).is_some() {
                return Ok(dir);
            }
            for entry in self.runtime.read_dir(&dir)? {
                let hidden_vcs = entry
                    .file_name()
                    .is_some_and(|n| matches!(n.to_str(), Some(".git" | ".hg" | ".svn")));
                if !hidden_vcs && self.runtime.is_dir(&entry) && !self.runtime.is_symlink(&entry) {
                    queue.push_back(entry);
                }
            }
        }

        if self.pkg_type == PackageType::Library {
            return self.synthesize_library_root(path, spec);
        }
        Err(Error::MissingManifest {
            names: self.manifest_names().join(", "),
            path: path.to_path_buf(),
        }
        .into())
    }

    /// Metadata for the package at `pkg_dir`; the manifest supplies name and
    /// version unless the spec carries a custom name.
    pub(crate) fn build_metadata(
        &self,
        pkg_dir: &Path,
        spec: &PackageSpec,
        vcs_revision: Option<&str>,
    ) -> Result<PackageMetadata> {
        let manifest = self.load_manifest(pkg_dir)?;
        let name = if spec.name_is_custom || manifest.name.is_none() {
            spec.name.clone()
        } else {
            manifest.name.clone()
        };
        let name = name.ok_or_else(|| {
            Error::package(format!("Could not determine the name of the package {:?}", pkg_dir))
        })?;

        let version = manifest.version.as_deref().and_then(cast_version_to_semver);
        let version = match vcs_revision {
            Some(rev) => version_with_revision(version.as_ref(), rev),
            None => version,
        }
        .unwrap_or_else(generate_rand_version);

        Ok(PackageMetadata::new(
            self.pkg_type,
            &name,
            version,
            Some(spec.clone()),
        ))
    }

    /// Installed packages, sorted by directory name. Staging directories,
    /// unreadable packages and, for tools, packages built for other systems
    /// are left out.
    #[tracing::instrument(skip(self))]
    pub fn get_installed(&self) -> Result<Vec<PackageItem>> {
        if let Ok(cache) = self.installed.lock()
            && let Some(items) = cache.as_ref()
        {
            return Ok(items.clone());
        }
        if !self.runtime.is_dir(&self.package_dir) {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        for path in self.runtime.read_dir(&self.package_dir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(TMP_INSTALL_PREFIX) {
                continue;
            }
            let mut pkg = if self.runtime.is_dir(&path) {
                PackageItem::load(&self.runtime, path.clone())
            } else if symlink::is_descriptor(&path) {
                match self.get_symlinked_package(&path) {
                    Some(pkg) => pkg,
                    None => continue,
                }
            } else {
                continue;
            };
            if pkg.metadata.is_none() {
                pkg.metadata = self.legacy_metadata(&pkg.path);
                // Pin the synthesized version so later scans agree
                if pkg.metadata.is_some()
                    && let Err(e) = pkg.dump_metadata(&self.runtime)
                {
                    warn!("Could not save metadata for {:?}: {:#}", pkg.path, e);
                }
            }
            if pkg.metadata.is_none() {
                debug!("Skipping {:?}: no package metadata", pkg.path);
                continue;
            }
            if !self.is_visible(&pkg) {
                continue;
            }
            result.push(pkg);
        }

        if let Ok(mut cache) = self.installed.lock() {
            *cache = Some(result.clone());
        }
        Ok(result)
    }

    /// Highest installed version matching `spec`.
    pub fn get_package(&self, spec: &PackageSpec) -> Result<Option<PackageItem>> {
        let mut best: Option<PackageItem> = None;
        for pkg in self.get_installed()? {
            if !self.test_pkg_spec(&pkg, spec) {
                continue;
            }
            let Some(version) = pkg.version() else {
                continue;
            };
            if let Some(req) = &spec.requirements
                && !req.matches(version)
            {
                continue;
            }
            if best.as_ref().and_then(PackageItem::version).is_none_or(|b| version > b) {
                best = Some(pkg);
            }
        }
        Ok(best)
    }

    /// Identity match of an installed package against a spec: id, source
    /// uri (or the local path itself), then case-insensitive owner and name.
    fn test_pkg_spec(&self, pkg: &PackageItem, spec: &PackageSpec) -> bool {
        let Some(metadata) = &pkg.metadata else {
            return false;
        };
        let pkg_spec = metadata.spec.clone().unwrap_or_default();

        if let Some(id) = spec.id
            && pkg_spec.id != Some(id)
        {
            return false;
        }

        if let Some(uri) = &spec.uri {
            if self.is_same_local_path(uri, &pkg.path) {
                return true;
            }
            return pkg_spec.uri.as_deref() == Some(uri.as_str());
        }

        if let Some(owner) = &spec.owner {
            return pkg_spec
                .owner
                .as_deref()
                .is_some_and(|o| o.eq_ignore_ascii_case(owner));
        }

        if spec.id.is_none() {
            return spec
                .name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(&metadata.name));
        }
        true
    }

    fn is_same_local_path(&self, uri: &str, pkg_path: &Path) -> bool {
        let Ok(cwd) = self.runtime.current_dir() else {
            return false;
        };
        let pkg_path = normalize_path(&absolute_path(&cwd, pkg_path));
        let candidates = [Some(uri), local_uri_path(uri)];
        candidates
            .into_iter()
            .flatten()
            .any(|path| normalize_path(&absolute_path(&cwd, Path::new(path))) == pkg_path)
    }

    /// Dependencies declared by the package manifest; none when it cannot be read.
    pub fn get_pkg_dependencies(&self, pkg: &PackageItem) -> Vec<ManifestDependency> {
        match self.load_manifest(&pkg.path) {
            Ok(manifest) => manifest.dependencies,
            Err(e) => {
                debug!("No dependencies for {}: {:#}", pkg, e);
                Vec::new()
            }
        }
    }

    pub(crate) fn dependency_to_spec(dependency: &ManifestDependency) -> Result<PackageSpec> {
        PackageSpec::from_parts(
            dependency.owner.as_deref(),
            Some(&dependency.name),
            dependency.version.as_deref(),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::archive::PackagePacker;
    use crate::http::HttpClient;
    use crate::registry::{
        MockRegistryClient, RegistryChecksum, RegistryFile, RegistryOwner, RegistryPackage,
        RegistryVersion,
    };
    use crate::runtime::RealRuntime;
    use serde_json::json;
    use std::fs;

    pub const SYSTYPE: &str = "linux_x86_64";

    pub fn config(core_dir: &Path) -> Config {
        Config {
            core_dir: core_dir.to_path_buf(),
            registry_url: "http://127.0.0.1:9".to_string(),
            systype: SYSTYPE.to_string(),
            progress: false,
            auth_token: None,
        }
    }

    pub fn manager(
        core_dir: &Path,
        pkg_type: PackageType,
        registry: MockRegistryClient,
    ) -> PackageManager<RealRuntime> {
        let config = config(core_dir);
        let package_dir = match pkg_type {
            PackageType::Library => config.lib_dir(),
            PackageType::Platform => config.platforms_dir(),
            PackageType::Tool => config.packages_dir(),
        };
        let downloader =
            Downloader::new(HttpClient::new(reqwest::Client::new()), config.download_dir());
        PackageManager::new(RealRuntime, pkg_type, package_dir, &config, Arc::new(registry))
            .unwrap()
            .with_downloader(downloader)
    }

    /// Write a package source tree with a `library.json`-style manifest.
    pub fn write_source(
        dir: &Path,
        manifest_name: &str,
        name: &str,
        version: &str,
        dependencies: serde_json::Value,
    ) -> PathBuf {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src").join(format!("{}.h", name)), "#pragma once\n").unwrap();
        let manifest = json!({
            "name": name,
            "version": version,
            "dependencies": dependencies,
        });
        fs::write(dir.join(manifest_name), manifest.to_string()).unwrap();
        dir.to_path_buf()
    }

    /// Pack a library source tree and return its `file://` url.
    pub fn packed_library(work: &Path, name: &str, version: &str, deps: serde_json::Value) -> String {
        let src = write_source(
            &work.join(format!("src-{}-{}", name, version)),
            "library.json",
            name,
            version,
            deps,
        );
        let out = work.join("dist");
        fs::create_dir_all(&out).unwrap();
        let archive = PackagePacker::new(src).pack(&RealRuntime, Some(&out)).unwrap();
        format!("file://{}", archive.display())
    }

    pub fn registry_package(id: u64, owner: &str, name: &str, versions: &[(&str, &str)]) -> RegistryPackage {
        let versions: Vec<RegistryVersion> = versions
            .iter()
            .map(|(version, url)| RegistryVersion {
                name: version.to_string(),
                released_at: None,
                files: vec![RegistryFile {
                    system: Vec::new(),
                    download_url: url.to_string(),
                    checksum: RegistryChecksum::default(),
                }],
            })
            .collect();
        RegistryPackage {
            id,
            owner: RegistryOwner {
                username: owner.to_string(),
            },
            name: name.to_string(),
            pkg_type: Some(PackageType::Library),
            version: versions.last().cloned(),
            versions,
        }
    }

    /// A registry serving `packages` directly, without mirrors.
    pub fn registry_with(packages: Vec<RegistryPackage>) -> MockRegistryClient {
        let mut registry = MockRegistryClient::new();
        let by_name = packages.clone();
        registry
            .expect_get_package()
            .returning(move |_, owner, name, _| {
                Ok(by_name
                    .iter()
                    .find(|p| p.owner.username == owner && p.name == name)
                    .cloned())
            });
        registry.expect_list_packages().returning(move |query| {
            let names = query.filters.get("names").cloned().unwrap_or_default();
            Ok(packages
                .iter()
                .filter(|p| names.iter().any(|n| n.eq_ignore_ascii_case(&p.name)))
                .cloned()
                .collect())
        });
        registry.expect_next_mirror().returning(|_, _| Ok(None));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::registry::MockRegistryClient;
    use crate::runtime::RealRuntime;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn install_metadata(pm: &PackageManager<RealRuntime>, dir: &Path, name: &str, version: &str, spec: &str) {
        let meta = PackageMetadata::new(
            pm.pkg_type(),
            name,
            cast_version_to_semver(version).unwrap(),
            Some(PackageSpec::parse(spec).unwrap()),
        );
        PackageItem::new(dir.to_path_buf(), Some(meta))
            .dump_metadata(pm.runtime())
            .unwrap();
    }

    #[test]
    fn test_get_installed_empty_root() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        assert!(pm.get_installed().unwrap().is_empty());
    }

    #[test]
    fn test_get_installed_skips_staging_and_loose_files() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let root = pm.package_dir().to_path_buf();

        let foo = write_source(&root.join("foo"), "library.json", "foo", "1.0.0", json!([]));
        install_metadata(&pm, &foo, "foo", "1.0.0", "alice/foo");
        write_source(
            &root.join(format!("{}abc", TMP_INSTALL_PREFIX)),
            "library.json",
            "bar",
            "1.0.0",
            json!([]),
        );
        fs::write(root.join("notes.txt"), "x").unwrap();

        let installed = pm.get_installed().unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].name(), Some("foo"));
    }

    #[test]
    fn test_get_installed_is_memoized_until_reset() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let root = pm.package_dir().to_path_buf();
        let foo = write_source(&root.join("foo"), "library.json", "foo", "1.0.0", json!([]));
        install_metadata(&pm, &foo, "foo", "1.0.0", "foo");
        assert_eq!(pm.get_installed().unwrap().len(), 1);

        let bar = write_source(&root.join("bar"), "library.json", "bar", "1.0.0", json!([]));
        install_metadata(&pm, &bar, "bar", "1.0.0", "bar");
        assert_eq!(pm.get_installed().unwrap().len(), 1);

        pm.reset_cache();
        assert_eq!(pm.get_installed().unwrap().len(), 2);
    }

    #[test]
    fn test_get_package_matching_rules() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let root = pm.package_dir().to_path_buf();

        let v1 = write_source(&root.join("foo@1.0.0"), "library.json", "foo", "1.0.0", json!([]));
        install_metadata(&pm, &v1, "foo", "1.0.0", "Alice/foo");
        let v2 = write_source(&root.join("foo"), "library.json", "foo", "2.0.0", json!([]));
        install_metadata(&pm, &v2, "foo", "2.0.0", "alice/foo");
        let ext = write_source(&root.join("ext"), "library.json", "ext", "0.1.0", json!([]));
        install_metadata(&pm, &ext, "ext", "0.1.0", "https://example.com/ext.zip");

        let get = |raw: &str| pm.get_package(&PackageSpec::parse(raw).unwrap()).unwrap();

        assert_eq!(get("foo").unwrap().path, v2);
        assert_eq!(get("alice/foo@^1").unwrap().path, v1);
        assert_eq!(get("ALICE/FOO@^2").unwrap().path, v2);
        assert!(get("bob/foo").is_none());
        assert!(get("foo@^3").is_none());
        assert_eq!(get("https://example.com/ext.zip").unwrap().path, ext);
        assert!(get("https://example.com/other.zip").is_none());
        assert_eq!(
            get(&format!("file://{}", ext.display())).unwrap().path,
            ext
        );
    }

    #[test]
    fn test_find_pkg_root_searches_level_by_level() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Tool, MockRegistryClient::new());
        let contents = dir.path().join("contents");
        fs::create_dir_all(contents.join("a").join("deep").join("nested")).unwrap();
        fs::write(contents.join("a/deep/nested/package.json"), r#"{"name": "deep"}"#).unwrap();
        fs::create_dir_all(contents.join("b").join("tool")).unwrap();
        fs::write(contents.join("b/tool/package.json"), r#"{"name": "tool"}"#).unwrap();

        let spec = PackageSpec::parse("tool").unwrap();
        assert_eq!(
            pm.find_pkg_root(&contents, &spec).unwrap(),
            contents.join("b").join("tool")
        );
    }

    #[test]
    fn test_find_pkg_root_missing_manifest() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Tool, MockRegistryClient::new());
        let contents = dir.path().join("contents");
        fs::create_dir_all(&contents).unwrap();
        fs::write(contents.join("README"), "x").unwrap();

        let err = pm
            .find_pkg_root(&contents, &PackageSpec::parse("tool").unwrap())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingManifest { .. })
        ));
    }

    #[test]
    fn test_build_metadata() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let src = write_source(&dir.path().join("src"), "library.json", "foo", "1.2", json!([]));

        let meta = pm
            .build_metadata(&src, &PackageSpec::parse("alice/foo").unwrap(), None)
            .unwrap();
        assert_eq!(meta.name, "foo");
        assert_eq!(meta.version.to_string(), "1.2.0");

        let meta = pm
            .build_metadata(&src, &PackageSpec::parse("bar=https://h/x.zip").unwrap(), Some("abc1234"))
            .unwrap();
        assert_eq!(meta.name, "bar");
        assert_eq!(meta.version.to_string(), "1.2.0+sha.abc1234");
    }
}
