use anyhow::{Context, Result};
use log::warn;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::spec::PackageSpec;
use super::version::UpdateIncrement;
use crate::error::Error;
use crate::runtime::Runtime;

/// File holding the metadata of an installed package.
pub const METAFILE_NAME: &str = ".fwpm";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Library,
    Platform,
    Tool,
}

impl PackageType {
    pub fn manifest_names(&self) -> &'static [&'static str] {
        match self {
            PackageType::Library => &["library.json", "library.properties", "module.json"],
            PackageType::Platform => &["platform.json"],
            PackageType::Tool => &["package.json"],
        }
    }

    pub fn all_manifest_names() -> Vec<&'static str> {
        [PackageType::Library, PackageType::Platform, PackageType::Tool]
            .iter()
            .flat_map(|t| t.manifest_names().iter().copied())
            .collect()
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageType::Library => write!(f, "library"),
            PackageType::Platform => write!(f, "platform"),
            PackageType::Tool => write!(f, "tool"),
        }
    }
}

impl FromStr for PackageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "library" | "lib" => Ok(PackageType::Library),
            "platform" => Ok(PackageType::Platform),
            "tool" => Ok(PackageType::Tool),
            _ => Err(Error::Parse(s.to_string())),
        }
    }
}

/// Persisted description of an installed package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    #[serde(rename = "type")]
    pub pkg_type: PackageType,
    pub name: String,
    #[serde(with = "version_string")]
    pub version: Version,
    #[serde(default)]
    pub spec: Option<PackageSpec>,
}

mod version_string {
    use crate::package::version::cast_version_to_semver;
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &Version, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(version)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
        let raw = String::deserialize(deserializer)?;
        cast_version_to_semver(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid version '{}'", raw)))
    }
}

impl PackageMetadata {
    pub fn new(pkg_type: PackageType, name: &str, version: Version, spec: Option<PackageSpec>) -> Self {
        Self {
            pkg_type,
            name: name.to_string(),
            version,
            spec,
        }
    }

    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        let content = runtime.read_to_string(path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse package metadata {:?}", path))
    }

    #[tracing::instrument(skip(self, runtime))]
    pub fn dump<R: Runtime>(&self, runtime: &R, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        runtime.write(path, json.as_bytes())
    }
}

/// An installed package directory and its metadata.
#[derive(Debug, Clone)]
pub struct PackageItem {
    pub path: PathBuf,
    pub metadata: Option<PackageMetadata>,
}

impl PackageItem {
    pub fn new(path: PathBuf, metadata: Option<PackageMetadata>) -> Self {
        Self { path, metadata }
    }

    /// Build an item for `path`, reading its metadata file when present.
    pub fn load<R: Runtime>(runtime: &R, path: PathBuf) -> Self {
        let metadata = if runtime.is_dir(&path) {
            Self::load_metadata(runtime, &path)
        } else {
            None
        };
        Self { path, metadata }
    }

    fn load_metadata<R: Runtime>(runtime: &R, path: &Path) -> Option<PackageMetadata> {
        let meta_path = metafile_locations(path)
            .into_iter()
            .map(|location| location.join(METAFILE_NAME))
            .find(|candidate| runtime.exists(candidate))?;
        match PackageMetadata::load(runtime, &meta_path) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!("Ignoring broken package metadata {:?}: {:#}", meta_path, e);
                None
            }
        }
    }

    pub fn exists<R: Runtime>(&self, runtime: &R) -> bool {
        runtime.is_dir(&self.path)
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.name.as_str())
    }

    pub fn version(&self) -> Option<&Version> {
        self.metadata.as_ref().map(|m| &m.version)
    }

    pub fn spec(&self) -> Option<&PackageSpec> {
        self.metadata.as_ref().and_then(|m| m.spec.as_ref())
    }

    /// Directory name derived from the package name.
    pub fn safe_dirname(&self) -> Option<String> {
        self.name().map(safe_dirname)
    }

    /// Write the metadata next to VCS bookkeeping when present, else in the package root.
    pub fn dump_metadata<R: Runtime>(&self, runtime: &R) -> Result<()> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| Error::package(format!("No metadata for {:?}", self.path)))?;
        let location = metafile_locations(&self.path)
            .into_iter()
            .find(|location| runtime.is_dir(location))
            .unwrap_or_else(|| self.path.clone());
        metadata.dump(runtime, &location.join(METAFILE_NAME))
    }
}

impl PartialEq for PackageItem {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for PackageItem {}

impl fmt::Display for PackageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.metadata {
            Some(m) => write!(f, "{} @ {}", m.name, m.version),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

fn metafile_locations(path: &Path) -> [PathBuf; 4] {
    [
        path.join(".git"),
        path.join(".hg"),
        path.join(".svn"),
        path.to_path_buf(),
    ]
}

/// Replace characters outside `[0-9a-z_-. ]` (case-insensitive) with `_`.
pub fn safe_dirname(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Outcome of comparing an installed package against its sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageOutdatedResult {
    pub current: Option<Version>,
    pub latest: Option<Version>,
    pub wanted: Option<Version>,
    pub detached: bool,
}

impl PackageOutdatedResult {
    pub fn new(current: Option<Version>) -> Self {
        Self {
            current,
            ..Default::default()
        }
    }

    pub fn is_outdated(&self, allow_incompatible: bool) -> bool {
        let Some(latest) = &self.latest else {
            return false;
        };
        if self.detached || self.current.as_ref() == Some(latest) {
            return false;
        }
        if allow_incompatible {
            return self.current.as_ref() != Some(latest);
        }
        match &self.wanted {
            Some(wanted) => self.current.as_ref() != Some(wanted),
            None => true,
        }
    }

    pub fn update_increment_type(&self) -> Option<UpdateIncrement> {
        match (&self.current, &self.latest) {
            (Some(current), Some(latest)) => UpdateIncrement::between(current, latest),
            _ => None,
        }
    }
}
