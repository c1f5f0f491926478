use anyhow::Result;
use log::info;

use super::PackageManager;
use super::install::InstallContext;
use crate::error::Error;
use crate::package::{PackageItem, PackageSpec, VersionRequirement};
use crate::runtime::Runtime;

impl<R: Runtime> PackageManager<R> {
    /// Bring the package matching `from_spec` up to date.
    ///
    /// `to_spec` narrows the target to a requirement; without it the latest
    /// release is used. Checkouts are pulled in place; registry packages are
    /// replaced while their dependencies stay installed.
    #[tracing::instrument(skip(self))]
    pub async fn update(
        &self,
        from_spec: &PackageSpec,
        to_spec: Option<&PackageSpec>,
        skip_dependencies: bool,
    ) -> Result<PackageItem> {
        let pkg = self
            .get_package(from_spec)?
            .ok_or_else(|| Error::UnknownPackage(from_spec.humanize()))?;
        let outdated = self.outdated(&pkg, to_spec).await?;
        if !outdated.is_outdated(false) {
            info!("{} is already up to date", pkg);
            return Ok(pkg);
        }

        let _lock = self.lock_async().await?;
        let pkg_spec = pkg.spec().cloned().unwrap_or_default();
        if pkg_spec.external() {
            return self.update_checkout(&pkg, &pkg_spec);
        }

        let target = Self::update_target(&outdated)
            .ok_or_else(|| Error::UnknownPackage(from_spec.humanize()))?;
        info!("Updating {} to {}", pkg, target);
        let spec = PackageSpec {
            owner: pkg_spec.owner.clone(),
            id: pkg_spec.id,
            name: pkg_spec.name.clone().or_else(|| pkg.name().map(str::to_string)),
            requirements: Some(VersionRequirement::exact(target)),
            ..Default::default()
        };
        self.uninstall_item(&pkg, true)?;
        let mut ctx = InstallContext::default();
        let updated = self
            .install_inner(&mut ctx, &spec, None, skip_dependencies, false)
            .await?;
        self.reset_cache();
        Ok(updated)
    }

    fn update_checkout(&self, pkg: &PackageItem, pkg_spec: &PackageSpec) -> Result<PackageItem> {
        let uri = pkg_spec
            .uri
            .as_deref()
            .ok_or_else(|| Error::package(format!("{} has no source to update from", pkg)))?;
        let vcs = self.vcs.new_client(&pkg.path, uri)?;
        info!("Pulling {} with {}", pkg, vcs.kind());
        vcs.update()?;
        let revision = vcs.current_revision()?;

        let metadata = self.build_metadata(&pkg.path, pkg_spec, Some(&revision))?;
        let updated = PackageItem::new(pkg.path.clone(), Some(metadata));
        updated.dump_metadata(&self.runtime)?;
        self.reset_cache();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::package::{PackageMetadata, PackageType};
    use crate::registry::MockRegistryClient;
    use crate::vcs::{MockVcsClient, MockVcsFactory, VcsKind};
    use semver::Version;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn spec(raw: &str) -> PackageSpec {
        PackageSpec::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_update_registry_package() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let v1 = packed_library(&work, "foo", "1.0.0", json!([]));
        let v11 = packed_library(&work, "foo", "1.1.0", json!([]));
        let v2 = packed_library(&work, "foo", "2.0.0", json!([]));
        let registry = registry_with(vec![registry_package(
            1,
            "alice",
            "foo",
            &[("1.0.0", &v1), ("1.1.0", &v11), ("2.0.0", &v2)],
        )]);
        let pm = manager(dir.path(), PackageType::Library, registry);
        pm.install(&spec("alice/foo@1.0.0"), false, false).await.unwrap();

        let updated = pm
            .update(&spec("alice/foo"), Some(&spec("alice/foo@^1")), false)
            .await
            .unwrap();
        assert_eq!(updated.version(), Some(&Version::new(1, 1, 0)));
        assert_eq!(updated.path, pm.package_dir().join("foo"));

        let updated = pm.update(&spec("alice/foo"), None, false).await.unwrap();
        assert_eq!(updated.version(), Some(&Version::new(2, 0, 0)));
        assert_eq!(pm.get_installed().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_up_to_date_is_noop() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let v1 = packed_library(&work, "foo", "1.0.0", json!([]));
        let registry = registry_with(vec![registry_package(1, "alice", "foo", &[("1.0.0", &v1)])]);
        let pm = manager(dir.path(), PackageType::Library, registry);
        let installed = pm.install(&spec("alice/foo"), false, false).await.unwrap();

        let same = pm.update(&spec("alice/foo"), None, false).await.unwrap();
        assert_eq!(same, installed);
        assert_eq!(same.version(), Some(&Version::new(1, 0, 0)));
    }

    #[tokio::test]
    async fn test_update_unknown_package() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let err = pm.update(&spec("foo"), None, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownPackage(_))
        ));
    }

    #[tokio::test]
    async fn test_update_checkout_in_place() {
        let dir = tempdir().unwrap();
        let mut factory = MockVcsFactory::new();
        factory.expect_new_client().returning(|_, _| {
            let mut client = MockVcsClient::new();
            client.expect_kind().return_const(VcsKind::Git);
            client.expect_can_be_updated().return_const(true);
            client
                .expect_latest_revision()
                .returning(|| Ok(Some("def5678".to_string())));
            client.expect_update().returning(|| Ok(()));
            client
                .expect_current_revision()
                .returning(|| Ok("def5678".to_string()));
            Ok(Box::new(client))
        });
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new())
            .with_vcs(Arc::new(factory));

        let pkg_dir = write_source(&pm.package_dir().join("foo"), "library.json", "foo", "1.0.0", json!([]));
        std::fs::create_dir_all(pkg_dir.join(".git")).unwrap();
        let meta = PackageMetadata::new(
            PackageType::Library,
            "foo",
            Version::parse("1.0.0+sha.abc1234").unwrap(),
            Some(spec("https://github.com/alice/foo.git")),
        );
        PackageItem::new(pkg_dir.clone(), Some(meta))
            .dump_metadata(pm.runtime())
            .unwrap();

        let updated = pm
            .update(&spec("https://github.com/alice/foo.git"), None, false)
            .await
            .unwrap();

        assert_eq!(updated.path, pkg_dir);
        assert_eq!(updated.version().unwrap().to_string(), "1.0.0+sha.def5678");
        pm.reset_cache();
        let reloaded = pm.get_package(&spec("https://github.com/alice/foo.git")).unwrap().unwrap();
        assert_eq!(reloaded.version().unwrap().to_string(), "1.0.0+sha.def5678");
    }
}
