use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::PackageManager;
use crate::package::{PackageMetadata, PackageSpec, VersionRequirement};
use crate::runtime::Runtime;

const LEGACY_MANIFEST: &str = ".pkgmanager.json";

/// Install record written by older releases.
#[derive(Debug, Default, Deserialize)]
struct LegacyManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    requirements: Option<String>,
}

impl<R: Runtime> PackageManager<R> {
    /// Metadata for a package directory that has no metadata file.
    pub(crate) fn legacy_metadata(&self, path: &Path) -> Option<PackageMetadata> {
        if !self.runtime.is_dir(path) {
            return None;
        }
        let spec = self.build_legacy_spec(path).ok()?;
        match self.build_metadata(path, &spec, None) {
            Ok(metadata) => {
                debug!("Synthesized metadata for legacy package {:?}", path);
                Some(metadata)
            }
            Err(e) => {
                debug!("Not a package {:?}: {:#}", path, e);
                None
            }
        }
    }

    pub(crate) fn build_legacy_spec(&self, pkg_dir: &Path) -> Result<PackageSpec> {
        if let Some(record) = self.find_legacy_manifest(pkg_dir) {
            let content = self.runtime.read_to_string(&record)?;
            let legacy: LegacyManifest = serde_json::from_str(&content)
                .with_context(|| format!("Invalid legacy manifest {:?}", record))?;
            let mut spec = match &legacy.url {
                Some(url) => PackageSpec::parse(url)?,
                None => PackageSpec::default(),
            };
            if legacy.name.is_some() {
                spec.name = legacy.name;
            }
            spec.requirements = legacy
                .requirements
                .as_deref()
                .and_then(|r| r.parse::<VersionRequirement>().ok());
            return Ok(spec);
        }

        let manifest = self.load_manifest(pkg_dir)?;
        Ok(PackageSpec {
            name: manifest.name,
            ..Default::default()
        })
    }

    fn find_legacy_manifest(&self, pkg_dir: &Path) -> Option<PathBuf> {
        let direct = pkg_dir.join(LEGACY_MANIFEST);
        if self.runtime.exists(&direct) {
            return Some(direct);
        }
        self.runtime
            .read_dir(pkg_dir)
            .ok()?
            .into_iter()
            .filter(|entry| self.runtime.is_dir(entry))
            .map(|entry| entry.join(LEGACY_MANIFEST))
            .find(|candidate| self.runtime.exists(candidate))
    }
}
