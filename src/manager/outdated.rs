use anyhow::Result;
use log::{debug, warn};
use semver::Version;

use super::PackageManager;
use crate::package::{PackageItem, PackageOutdatedResult, PackageSpec, VersionRequirement};
use crate::runtime::Runtime;

impl<R: Runtime> PackageManager<R> {
    /// Compare an installed package against its source.
    ///
    /// `latest` ignores requirements. `wanted` is resolved only when `spec`
    /// is given and honors its requirement. Packages detached to a version,
    /// and checkouts pinned to a revision, are reported as detached.
    pub async fn outdated(
        &self,
        pkg: &PackageItem,
        spec: Option<&PackageSpec>,
    ) -> Result<PackageOutdatedResult> {
        let mut result = PackageOutdatedResult::new(pkg.version().cloned());
        if !self.runtime.is_dir(&pkg.path) {
            return Ok(result);
        }
        let pkg_spec = pkg.spec().cloned().unwrap_or_default();

        let detached_dir = pkg
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains('@'));
        if detached_dir && !pkg_spec.external() && spec.is_none() {
            result.detached = true;
            return Ok(result);
        }

        if pkg_spec.external() {
            self.outdated_vcs(pkg, &pkg_spec, spec, &mut result);
        } else {
            self.outdated_registry(&pkg_spec, spec, &mut result).await;
        }
        Ok(result)
    }

    fn outdated_vcs(
        &self,
        pkg: &PackageItem,
        pkg_spec: &PackageSpec,
        spec: Option<&PackageSpec>,
        result: &mut PackageOutdatedResult,
    ) {
        let Some(uri) = pkg_spec.uri.as_deref() else {
            return;
        };
        let vcs = match self.vcs.new_client(&pkg.path, uri) {
            Ok(vcs) => vcs,
            Err(e) => {
                debug!("{} has no updatable source: {:#}", pkg, e);
                return;
            }
        };
        if !vcs.can_be_updated() {
            result.detached = spec.is_none_or(|s| s.requirements.is_none());
            return;
        }
        let latest = vcs.latest_revision().and_then(|revision| match revision {
            Some(rev) => self
                .build_metadata(&pkg.path, pkg_spec, Some(&rev))
                .map(|meta| Some(meta.version)),
            None => Ok(None),
        });
        match latest {
            Ok(latest) => result.latest = latest,
            Err(e) => warn!("Could not check {} for updates: {:#}", pkg, e),
        }
    }

    async fn outdated_registry(
        &self,
        pkg_spec: &PackageSpec,
        spec: Option<&PackageSpec>,
        result: &mut PackageOutdatedResult,
    ) {
        let lookup = PackageSpec {
            requirements: None,
            ..pkg_spec.clone()
        };
        let package = match self.find_registry_package(&lookup, None).await {
            Ok(Some(package)) => package,
            Ok(None) => {
                debug!("{} is not in the registry", lookup.humanize());
                return;
            }
            Err(e) => {
                warn!("Could not check {} for updates: {:#}", lookup.humanize(), e);
                return;
            }
        };

        let pick = |requirement: Option<&VersionRequirement>| {
            self.pick_best_registry_version(&package.versions, requirement)
                .and_then(|v| v.semver())
        };
        result.latest = pick(None);
        if let Some(spec) = spec {
            result.wanted = pick(spec.requirements.as_ref());
            if result.wanted.is_none() {
                result.latest = None;
            }
        }
    }

    /// Version a registry update should move to.
    pub(crate) fn update_target(outdated: &PackageOutdatedResult) -> Option<&Version> {
        outdated.wanted.as_ref().or(outdated.latest.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::package::{PackageMetadata, PackageType};
    use crate::registry::MockRegistryClient;
    use crate::vcs::{MockVcsClient, MockVcsFactory};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn installed(root: &Path, dirname: &str, version: &str, spec: &str) -> PackageItem {
        let dir = write_source(&root.join(dirname), "library.json", "foo", "1.0.0", json!([]));
        let meta = PackageMetadata::new(
            PackageType::Library,
            "foo",
            Version::parse(version).unwrap(),
            Some(PackageSpec::parse(spec).unwrap()),
        );
        let pkg = PackageItem::new(dir, Some(meta));
        pkg.dump_metadata(&crate::runtime::RealRuntime).unwrap();
        pkg
    }

    fn vcs_factory(updatable: bool, latest: &'static str) -> MockVcsFactory {
        let mut factory = MockVcsFactory::new();
        factory.expect_new_client().returning(move |_, _| {
            let mut client = MockVcsClient::new();
            client.expect_can_be_updated().return_const(updatable);
            client
                .expect_latest_revision()
                .returning(move || Ok(Some(latest.to_string())));
            Ok(Box::new(client))
        });
        factory
    }

    #[tokio::test]
    async fn test_registry_latest_and_wanted() {
        let dir = tempdir().unwrap();
        let registry = registry_with(vec![registry_package(
            1,
            "alice",
            "foo",
            &[("1.0.0", "u1"), ("1.2.0", "u2"), ("2.0.0", "u3")],
        )]);
        let pm = manager(dir.path(), PackageType::Library, registry);
        let pkg = installed(pm.package_dir(), "foo", "1.0.0", "alice/foo@^1");

        let result = pm.outdated(&pkg, None).await.unwrap();
        assert_eq!(result.latest, Some(Version::new(2, 0, 0)));
        assert_eq!(result.wanted, None);
        assert!(result.is_outdated(false));

        let spec = PackageSpec::parse("alice/foo@^1").unwrap();
        let result = pm.outdated(&pkg, Some(&spec)).await.unwrap();
        assert_eq!(result.latest, Some(Version::new(2, 0, 0)));
        assert_eq!(result.wanted, Some(Version::new(1, 2, 0)));
        assert!(result.is_outdated(false));

        let spec = PackageSpec::parse("alice/foo@^3").unwrap();
        let result = pm.outdated(&pkg, Some(&spec)).await.unwrap();
        assert_eq!(result.latest, None);
        assert!(!result.is_outdated(true));
    }

    #[tokio::test]
    async fn test_detached_directory_is_never_outdated() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new());
        let pkg = installed(pm.package_dir(), "foo@1.0.0", "1.0.0", "alice/foo");

        let result = pm.outdated(&pkg, None).await.unwrap();
        assert!(result.detached);
        assert!(!result.is_outdated(true));
    }

    #[tokio::test]
    async fn test_unknown_registry_package_has_no_latest() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, registry_with(Vec::new()));
        let pkg = installed(pm.package_dir(), "foo", "1.0.0", "alice/foo");

        let result = pm.outdated(&pkg, None).await.unwrap();
        assert_eq!(result.current, Some(Version::new(1, 0, 0)));
        assert_eq!(result.latest, None);
    }

    #[tokio::test]
    async fn test_vcs_latest_revision() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new())
            .with_vcs(Arc::new(vcs_factory(true, "def5678")));
        let pkg = installed(
            pm.package_dir(),
            "foo",
            "1.0.0+sha.abc1234",
            "https://github.com/alice/foo.git",
        );

        let result = pm.outdated(&pkg, None).await.unwrap();
        assert_eq!(result.latest.as_ref().unwrap().to_string(), "1.0.0+sha.def5678");
        assert!(!result.detached);
        assert!(result.is_outdated(false));
    }

    #[tokio::test]
    async fn test_pinned_checkout_is_detached() {
        let dir = tempdir().unwrap();
        let pm = manager(dir.path(), PackageType::Library, MockRegistryClient::new())
            .with_vcs(Arc::new(vcs_factory(false, "abc1234")));
        let pkg = installed(
            pm.package_dir(),
            "foo",
            "1.0.0+sha.abc1234",
            "https://github.com/alice/foo.git#abc1234",
        );

        let result = pm.outdated(&pkg, None).await.unwrap();
        assert!(result.detached);
        assert_eq!(result.latest, None);
        assert!(!result.is_outdated(true));
    }
}
