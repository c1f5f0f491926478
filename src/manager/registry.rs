use anyhow::Result;
use log::{debug, info, warn};
use semver::Version;
use std::collections::BTreeMap;

use super::PackageManager;
use crate::error::Error;
use crate::package::compat::is_system_compatible;
use crate::package::{PackageItem, PackageSpec, VersionRequirement};
use crate::registry::{RegistryFile, RegistryPackage, RegistryVersion, SearchQuery};
use crate::runtime::Runtime;

impl<R: Runtime> PackageManager<R> {
    pub(crate) async fn install_from_registry(
        &self,
        spec: &PackageSpec,
        qualifiers: Option<BTreeMap<String, Vec<String>>>,
    ) -> Result<PackageItem> {
        let unknown = || Error::UnknownPackage(spec.humanize());
        let package = self
            .find_registry_package(spec, qualifiers)
            .await?
            .ok_or_else(unknown)?;
        let version = self
            .pick_best_registry_version(&package.versions, spec.requirements.as_ref())
            .ok_or_else(unknown)?;
        let file = self.pick_compatible_file(version).ok_or_else(unknown)?;

        let pkg_spec = PackageSpec {
            owner: Some(package.owner.username.clone()),
            id: Some(package.id),
            name: Some(package.name.clone()),
            requirements: spec.requirements.clone(),
            ..Default::default()
        };
        info!(
            "Installing {}/{} @ {} from the registry",
            package.owner.username, package.name, version.name
        );

        let mut visited: Vec<String> = Vec::new();
        loop {
            let location = match self.registry.next_mirror(&file.download_url, &visited).await {
                Ok(location) => location,
                Err(e) => {
                    warn!("{:#}", e);
                    None
                }
            };
            let Some(location) = location else { break };
            visited.push(location.mirror.clone());
            let checksum = location
                .checksum
                .as_deref()
                .or(file.checksum.sha256.as_deref());
            match self.install_from_uri(&location.url, &pkg_spec, checksum).await {
                Ok(pkg) => return Ok(pkg),
                Err(e) => {
                    warn!("Package installation from {} failed: {:#}", location.mirror, e);
                    warn!("Looking for another mirror...");
                }
            }
        }

        if visited.is_empty() {
            debug!("No mirrors announced for {}", file.download_url);
            return self
                .install_from_uri(&file.download_url, &pkg_spec, file.checksum.sha256.as_deref())
                .await;
        }
        Err(unknown().into())
    }

    /// The full registry record for `spec`: fetched directly when owner and
    /// name are known, otherwise through a search.
    pub(crate) async fn find_registry_package(
        &self,
        spec: &PackageSpec,
        qualifiers: Option<BTreeMap<String, Vec<String>>>,
    ) -> Result<Option<RegistryPackage>> {
        if let (Some(owner), Some(name), None) = (&spec.owner, &spec.name, &qualifiers) {
            return self.registry.get_package(self.pkg_type, owner, name, None).await;
        }

        let matches = self.search_registry_packages(spec, qualifiers).await?;
        if matches.len() > 1 {
            let names: Vec<String> = matches
                .iter()
                .map(|p| format!("{}/{}", p.owner.username, p.name))
                .collect();
            warn!(
                "More than one package matches '{}': {}. Using {}; add an owner to pick another",
                spec.humanize(),
                names.join(", "),
                names[0]
            );
        }
        let Some(first) = matches.into_iter().next() else {
            return Ok(None);
        };
        if !first.versions.is_empty() {
            return Ok(Some(first));
        }
        self.registry
            .get_package(self.pkg_type, &first.owner.username, &first.name, None)
            .await
    }

    async fn search_registry_packages(
        &self,
        spec: &PackageSpec,
        qualifiers: Option<BTreeMap<String, Vec<String>>>,
    ) -> Result<Vec<RegistryPackage>> {
        let mut query = SearchQuery::new().filter("types", self.pkg_type.to_string());
        if let Some(id) = spec.id {
            query = query.filter("ids", id.to_string());
        } else {
            if let Some(name) = &spec.name {
                query = query.filter("names", name.to_lowercase());
            }
            if let Some(owner) = &spec.owner {
                query = query.filter("owners", owner.to_lowercase());
            }
        }
        if let Some(qualifiers) = qualifiers {
            query = query.with_qualifiers(qualifiers);
        }
        self.registry.list_packages(&query).await
    }

    /// Highest version satisfying `requirement` that ships a file for this host.
    pub(crate) fn pick_best_registry_version<'a>(
        &self,
        versions: &'a [RegistryVersion],
        requirement: Option<&VersionRequirement>,
    ) -> Option<&'a RegistryVersion> {
        let mut best: Option<(Version, &RegistryVersion)> = None;
        for version in versions {
            let Some(semver) = version.semver() else {
                continue;
            };
            if requirement.is_some_and(|req| !req.matches(&semver)) {
                continue;
            }
            if self.pick_compatible_file(version).is_none() {
                continue;
            }
            if best.as_ref().is_none_or(|(b, _)| semver > *b) {
                best = Some((semver, version));
            }
        }
        best.map(|(_, version)| version)
    }

    fn pick_compatible_file<'a>(&self, version: &'a RegistryVersion) -> Option<&'a RegistryFile> {
        version
            .files
            .iter()
            .find(|file| is_system_compatible(&file.system, &self.systype))
    }
}
