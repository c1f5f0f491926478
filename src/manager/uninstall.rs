use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;

use super::PackageManager;
use crate::error::Error;
use crate::package::{PackageItem, PackageSpec};
use crate::runtime::Runtime;

impl<R: Runtime> PackageManager<R> {
    /// Remove the installed package matching `spec` and, unless skipped, the
    /// packages its manifest depends on.
    #[tracing::instrument(skip(self))]
    pub fn uninstall(&self, spec: &PackageSpec, skip_dependencies: bool) -> Result<PackageItem> {
        let _lock = self.lock()?;
        let pkg = self
            .get_package(spec)?
            .ok_or_else(|| Error::UnknownPackage(spec.humanize()))?;
        self.uninstall_item(&pkg, skip_dependencies)?;
        Ok(pkg)
    }

    /// Uninstall an already resolved package. The caller holds the root lock.
    pub(crate) fn uninstall_item(&self, pkg: &PackageItem, skip_dependencies: bool) -> Result<()> {
        let mut visited = HashSet::new();
        self.uninstall_inner(pkg, skip_dependencies, &mut visited)
    }

    fn uninstall_inner(
        &self,
        pkg: &PackageItem,
        skip_dependencies: bool,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        if !visited.insert(pkg.path.clone()) {
            return Ok(());
        }
        info!("Removing {}", pkg);

        if !skip_dependencies {
            self.uninstall_dependencies(pkg, visited);
        }

        let spec = pkg.spec().cloned().unwrap_or_default();
        if spec.symlink() {
            self.uninstall_symlink(&spec)?;
        } else if self.runtime.is_symlink(&pkg.path) {
            self.runtime.remove_file(&pkg.path)?;
        } else if self.runtime.is_dir(&pkg.path) {
            self.runtime.remove_dir_all(&pkg.path)?;
        }
        self.reset_cache();

        self.promote_detached(pkg)?;
        info!("{} has been removed", pkg);
        Ok(())
    }

    fn uninstall_dependencies(&self, pkg: &PackageItem, visited: &mut HashSet<PathBuf>) {
        for dependency in self.get_pkg_dependencies(pkg) {
            let found = Self::dependency_to_spec(&dependency)
                .and_then(|spec| self.get_package(&spec));
            match found {
                Ok(Some(dep_pkg)) => {
                    if let Err(e) = self.uninstall_inner(&dep_pkg, false, visited) {
                        warn!("Could not remove dependency {}: {:#}", dep_pkg, e);
                    }
                }
                Ok(None) => debug!("Dependency {} of {} is not installed", dependency.name, pkg),
                Err(e) => warn!("{:#}", e),
            }
        }
    }

    /// Move a detached copy of the same package into the canonical directory
    /// once that directory is free.
    fn promote_detached(&self, removed: &PackageItem) -> Result<()> {
        let Some(name) = removed.name() else {
            return Ok(());
        };
        let spec = PackageSpec {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let Some(candidate) = self.get_package(&spec)? else {
            return Ok(());
        };
        let detached = candidate
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains('@'));
        let Some(dirname) = candidate.safe_dirname() else {
            return Ok(());
        };
        let canonical = self.package_dir.join(dirname);
        if !detached || self.runtime.exists(&canonical) {
            return Ok(());
        }

        info!("Promoting {:?} to {:?}", candidate.path, canonical);
        self.runtime.move_dir(&candidate.path, &canonical)?;
        self.reset_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::package::PackageType;
    use crate::registry::MockRegistryClient;
    use semver::Version;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn spec(raw: &str) -> PackageSpec {
        PackageSpec::parse(raw).unwrap()
    }

    #[test]
    fn test_uninstall_unknown_package() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let err = pm.uninstall(&spec("foo"), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownPackage(_))
        ));
    }

    #[tokio::test]
    async fn test_uninstall_promotes_detached_copy() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let v1 = packed_library(&work, "foo", "1.0.0", json!([]));
        let v2 = packed_library(&work, "foo", "2.0.0", json!([]));
        let registry = registry_with(vec![registry_package(
            1,
            "alice",
            "foo",
            &[("1.0.0", &v1), ("2.0.0", &v2)],
        )]);
        let pm = manager(dir.path(), PackageType::Library, registry);
        pm.install(&spec("alice/foo@1.0.0"), false, false).await.unwrap();
        pm.install(&spec("alice/foo@2.0.0"), false, false).await.unwrap();
        assert!(pm.package_dir().join("foo@1.0.0").is_dir());

        let removed = pm.uninstall(&spec("alice/foo@2.0.0"), false).unwrap();
        assert_eq!(removed.version(), Some(&Version::new(2, 0, 0)));

        assert!(!pm.package_dir().join("foo@1.0.0").exists());
        let remaining = pm.get_package(&spec("foo")).unwrap().unwrap();
        assert_eq!(remaining.path, pm.package_dir().join("foo"));
        assert_eq!(remaining.version(), Some(&Version::new(1, 0, 0)));
    }

    #[tokio::test]
    async fn test_uninstall_removes_dependencies() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let a = packed_library(&work, "a", "1.0.0", json!([{"owner": "alice", "name": "b"}]));
        let b = packed_library(&work, "b", "1.0.0", json!([{"owner": "alice", "name": "a"}]));
        let c = packed_library(&work, "c", "1.0.0", json!([]));
        let registry = registry_with(vec![
            registry_package(1, "alice", "a", &[("1.0.0", &a)]),
            registry_package(2, "alice", "b", &[("1.0.0", &b)]),
            registry_package(3, "alice", "c", &[("1.0.0", &c)]),
        ]);
        let pm = manager(dir.path(), PackageType::Library, registry);
        pm.install(&spec("alice/a"), false, false).await.unwrap();
        pm.install(&spec("alice/c"), false, false).await.unwrap();

        pm.uninstall(&spec("alice/a"), false).unwrap();

        let names: Vec<String> = pm
            .get_installed()
            .unwrap()
            .iter()
            .filter_map(|p| p.name().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["c"]);
    }

    #[tokio::test]
    async fn test_uninstall_keeps_dependencies_when_skipped() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let a = packed_library(&work, "a", "1.0.0", json!([{"owner": "alice", "name": "b"}]));
        let b = packed_library(&work, "b", "1.0.0", json!([]));
        let registry = registry_with(vec![
            registry_package(1, "alice", "a", &[("1.0.0", &a)]),
            registry_package(2, "alice", "b", &[("1.0.0", &b)]),
        ]);
        let pm = manager(dir.path(), PackageType::Library, registry);
        pm.install(&spec("alice/a"), false, false).await.unwrap();

        pm.uninstall(&spec("alice/a"), true).unwrap();
        assert!(pm.get_package(&spec("alice/b")).unwrap().is_some());
        assert!(!pm.package_dir().join("a").exists());
    }

    #[test]
    fn test_uninstall_package_without_metadata() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let foo = write_source(&pm.package_dir().join("foo"), "library.json", "foo", "1.0.0", json!([]));
        fs::write(foo.join("extra.txt"), "x").unwrap();

        pm.uninstall(&spec("foo"), true).unwrap();
        assert!(!foo.exists());
    }
}
