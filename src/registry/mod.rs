//! Package registry client.
//!
//! The registry is a hosted index of published packages. The manager only
//! consumes plain records from it; [`RegistryClient`] is the seam that tests
//! replace with a mock.

mod http;

use anyhow::Result;
use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::package::{PackageType, cast_version_to_semver};

pub use http::HttpRegistryClient;

/// Filters for `/v3/search`, keyed by plural qualifier (`types`, `names`,
/// `owners`, `ids`, `platforms`, `frameworks`, `authors`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub filters: BTreeMap<String, Vec<String>>,
    pub query: Option<String>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.filters
            .entry(key.to_string())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_qualifiers(mut self, qualifiers: BTreeMap<String, Vec<String>>) -> Self {
        for (key, values) in qualifiers {
            self.filters.entry(key).or_default().extend(values);
        }
        self
    }

    /// `type:"library" name:"foo" free text`; plural keys are made singular.
    pub fn to_query_string(&self) -> String {
        let mut terms: Vec<String> = Vec::new();
        for (key, values) in &self.filters {
            let key = key.strip_suffix('s').unwrap_or(key);
            for value in values {
                terms.push(format!("{}:\"{}\"", key, value));
            }
        }
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            terms.push(query.to_string());
        }
        terms.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryOwner {
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryChecksum {
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A `system` value: one tag, or a list of tags.
#[derive(Deserialize)]
#[serde(untagged)]
enum SystemTags {
    One(String),
    Many(Vec<String>),
}

fn deserialize_system<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<SystemTags>::deserialize(deserializer)? {
        Some(SystemTags::One(tag)) => vec![tag],
        Some(SystemTags::Many(tags)) => tags,
        None => Vec::new(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default, deserialize_with = "deserialize_system")]
    pub system: Vec<String>,
    pub download_url: String,
    #[serde(default)]
    pub checksum: RegistryChecksum,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryVersion {
    pub name: String,
    #[serde(default)]
    pub released_at: Option<String>,
    #[serde(default)]
    pub files: Vec<RegistryFile>,
}

impl RegistryVersion {
    pub fn semver(&self) -> Option<Version> {
        cast_version_to_semver(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryPackage {
    pub id: u64,
    pub owner: RegistryOwner,
    pub name: String,
    #[serde(default, rename = "type")]
    pub pkg_type: Option<PackageType>,
    /// Latest version, as returned by search.
    #[serde(default)]
    pub version: Option<RegistryVersion>,
    /// All versions, as returned by the package endpoint.
    #[serde(default)]
    pub versions: Vec<RegistryVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub items: Vec<RegistryPackage>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    #[serde(default)]
    pub message: String,
}

/// One hop of mirror discovery for a registry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorLocation {
    pub mirror: String,
    pub url: String,
    pub checksum: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_packages(&self, query: &SearchQuery) -> Result<Vec<RegistryPackage>>;

    /// `None` when the registry does not know the package.
    async fn get_package(
        &self,
        pkg_type: PackageType,
        owner: &str,
        name: &str,
        version: Option<String>,
    ) -> Result<Option<RegistryPackage>>;

    async fn publish_package(
        &self,
        owner: &str,
        pkg_type: PackageType,
        archive: &Path,
        released_at: Option<String>,
        private: bool,
    ) -> Result<PublishResult>;

    /// Next mirror serving `download_url`, skipping mirrors in `visited`.
    async fn next_mirror(
        &self,
        download_url: &str,
        visited: &[String],
    ) -> Result<Option<MirrorLocation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string() {
        let query = SearchQuery::new()
            .filter("types", "library")
            .filter("names", "foo")
            .filter("owners", "alice");
        assert_eq!(
            query.to_query_string(),
            r#"name:"foo" owner:"alice" type:"library""#
        );
    }

    #[test]
    fn test_query_string_with_qualifiers_and_text() {
        let mut qualifiers = BTreeMap::new();
        qualifiers.insert("platforms".to_string(), vec!["espressif32".to_string()]);
        let query = SearchQuery {
            query: Some("wifi".into()),
            ..SearchQuery::new().filter("ids", "42")
        }
        .with_qualifiers(qualifiers);
        assert_eq!(
            query.to_query_string(),
            r#"id:"42" platform:"espressif32" wifi"#
        );
    }

    #[test]
    fn test_package_deserialization() {
        let json = r#"{
            "id": 7,
            "owner": {"username": "alice"},
            "name": "foo",
            "type": "tool",
            "version": {"name": "1.2.0", "files": []},
            "versions": [
                {"name": "1.2.0", "released_at": "2024-01-01", "files": [
                    {"system": "*", "download_url": "https://dl/foo-1.2.0.tar.gz",
                     "checksum": {"sha256": "abc"}}
                ]},
                {"name": "1.1", "files": [
                    {"system": ["linux_x86_64", "darwin_arm64"], "download_url": "https://dl/foo-1.1.tar.gz"}
                ]}
            ]
        }"#;
        let pkg: RegistryPackage = serde_json::from_str(json).unwrap();
        assert_eq!(pkg.owner.username, "alice");
        assert_eq!(pkg.pkg_type, Some(PackageType::Tool));
        assert_eq!(pkg.versions[0].files[0].system, vec!["*"]);
        assert_eq!(pkg.versions[0].files[0].checksum.sha256.as_deref(), Some("abc"));
        assert_eq!(pkg.versions[1].files[0].system.len(), 2);
        assert!(pkg.versions[1].files[0].checksum.sha256.is_none());
        assert_eq!(pkg.versions[1].semver(), Some(Version::new(1, 1, 0)));
    }
}
