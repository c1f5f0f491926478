//! Package specifier parsing.
//!
//! A specifier is what users type (`owner/name@^1.2.3`, `42`,
//! `core=git+https://host/core.git#v1.0`) or what a manifest declares as a
//! dependency. Parsing runs a fixed pipeline where each stage either consumes
//! part of the text or terminates the parse:
//!
//! 1. existing local paths become `file://` sources
//! 2. a trailing `@requirement` is split off unless it looks like a URL
//! 3. `name=value` declares a custom name
//! 4. digits or `id=N` select a registry id
//! 5. `owner/name`
//! 6. anything URL-shaped becomes the source uri (with VCS prefix heuristics)
//! 7. the leftover is the plain name

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

use super::requirement::VersionRequirement;
use crate::error::Error;

const GIT_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.com"];
const HG_HOSTS: &[&str] = &["mbed.com", "os.mbed.com", "developer.mbed.org"];

/// Shape of a specifier, decided once at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind<'a> {
    ById(u64),
    ByOwnerName {
        owner: Option<&'a str>,
        name: &'a str,
    },
    ByLocalPath(&'a str),
    ByRemoteUri(&'a str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<VersionRequirement>,
    #[serde(default, alias = "url", skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip)]
    pub raw: Option<String>,
    #[serde(skip)]
    pub name_is_custom: bool,
}

impl PackageSpec {
    #[tracing::instrument]
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let mut spec = PackageSpec {
            raw: Some(raw.to_string()),
            ..Default::default()
        };

        let mut rest = Some(parse_local_file(raw));
        let stages: [fn(&mut PackageSpec, String) -> Result<Option<String>>; 5] = [
            PackageSpec::parse_requirements,
            PackageSpec::parse_custom_name,
            PackageSpec::parse_id,
            PackageSpec::parse_owner,
            PackageSpec::parse_uri,
        ];
        for stage in stages {
            let Some(text) = rest.take() else { break };
            rest = stage(&mut spec, text)?;
        }

        if spec.name.is_none() {
            if let Some(uri) = &spec.uri {
                spec.name = name_from_uri(uri);
            } else if let Some(leftover) = rest.filter(|s| !s.is_empty()) {
                spec.name = Some(leftover);
            }
        }

        if spec.id.is_none() && spec.name.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Parse(raw.to_string()).into());
        }
        Ok(spec)
    }

    pub fn from_id(id: u64) -> Self {
        Self {
            id: Some(id),
            raw: Some(id.to_string()),
            ..Default::default()
        }
    }

    /// Build a spec from separate fields, as declared by a manifest dependency.
    ///
    /// A requirement that is not a version range but names a source (for
    /// example a git URL) turns the spec into `name=<source>`.
    pub fn from_parts(
        owner: Option<&str>,
        name: Option<&str>,
        requirements: Option<&str>,
    ) -> Result<Self> {
        let mut spec = PackageSpec {
            owner: owner.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            name: name.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            ..Default::default()
        };
        let Some(requirements) = requirements.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(spec);
        };
        match requirements.parse::<VersionRequirement>() {
            Ok(req) => {
                spec.requirements = Some(req);
                Ok(spec)
            }
            Err(err) => match &spec.name {
                Some(name) => PackageSpec::parse(&format!("{}={}", name, requirements)),
                None => Err(err.into()),
            },
        }
    }

    pub fn with_requirements(mut self, requirements: Option<VersionRequirement>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn kind(&self) -> SpecKind<'_> {
        if let Some(uri) = &self.uri {
            if is_local_uri(uri) {
                return SpecKind::ByLocalPath(uri);
            }
            return SpecKind::ByRemoteUri(uri);
        }
        match (&self.id, &self.name) {
            (Some(id), _) => SpecKind::ById(*id),
            (None, name) => SpecKind::ByOwnerName {
                owner: self.owner.as_deref(),
                name: name.as_deref().unwrap_or_default(),
            },
        }
    }

    /// Sourced from somewhere other than the registry.
    pub fn external(&self) -> bool {
        self.uri.is_some()
    }

    pub fn symlink(&self) -> bool {
        self.uri
            .as_deref()
            .is_some_and(|uri| uri.starts_with("symlink://"))
    }

    /// Textual form suitable for a manifest dependency list.
    pub fn as_dependency(&self) -> String {
        if let Some(uri) = &self.uri {
            return self.raw.clone().unwrap_or_else(|| uri.clone());
        }
        let mut result = match (&self.owner, &self.name, self.id) {
            (Some(owner), Some(name), _) => format!("{}/{}", owner, name),
            (None, Some(name), _) => name.clone(),
            (_, None, Some(id)) => id.to_string(),
            _ => String::new(),
        };
        if let Some(req) = &self.requirements {
            result = format!("{}@{}", result, req);
        }
        result
    }

    pub fn humanize(&self) -> String {
        let mut result = match (&self.owner, &self.name, self.id) {
            (Some(owner), Some(name), _) => format!("{}/{}", owner, name),
            (None, Some(name), _) => name.clone(),
            (_, None, Some(id)) => format!("id:{}", id),
            _ => String::new(),
        };
        if let Some(req) = &self.requirements {
            result = format!("{} @ {}", result, req);
        }
        result
    }

    fn parse_requirements(&mut self, raw: String) -> Result<Option<String>> {
        // Local paths may contain `@`, e.g. detached `name@src-<hash>` directories
        if raw.starts_with("file://") {
            return Ok(Some(raw));
        }
        let Some((left, right)) = raw.rsplit_once('@') else {
            return Ok(Some(raw));
        };
        if right.contains([':', '/']) {
            return Ok(Some(raw));
        }
        self.requirements = Some(right.parse()?);
        Ok(Some(left.trim().to_string()))
    }

    fn parse_custom_name(&mut self, raw: String) -> Result<Option<String>> {
        if raw.starts_with("id=") {
            return Ok(Some(raw));
        }
        let Some((left, right)) = raw.split_once('=') else {
            return Ok(Some(raw));
        };
        if left.contains('/') {
            return Ok(Some(raw));
        }
        self.name = Some(left.trim().to_string());
        self.name_is_custom = true;
        Ok(Some(right.trim().to_string()))
    }

    fn parse_id(&mut self, raw: String) -> Result<Option<String>> {
        let digits = raw.strip_prefix("id=").unwrap_or(&raw).trim();
        if raw.starts_with("id=") || (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())) {
            let id = digits
                .parse::<u64>()
                .map_err(|_| Error::Parse(raw.clone()))?;
            self.id = Some(id);
            return Ok(None);
        }
        Ok(Some(raw))
    }

    fn parse_owner(&mut self, raw: String) -> Result<Option<String>> {
        if raw.matches('/').count() != 1 || raw.contains('@') {
            return Ok(Some(raw));
        }
        let Some((owner, name)) = raw.split_once('/') else {
            return Ok(Some(raw));
        };
        self.owner = Some(owner.trim().to_string());
        self.name = Some(name.trim().to_string());
        Ok(None)
    }

    fn parse_uri(&mut self, raw: String) -> Result<Option<String>> {
        if !raw.contains(['@', ':', '/', '\\']) {
            return Ok(Some(raw));
        }
        let uri = raw.trim().to_string();
        let parts = UriParts::split(&uri);
        if matches!(parts.scheme, "file" | "symlink")
            || parts.scheme.contains('+')
            || uri.starts_with("git+")
        {
            self.uri = Some(uri);
            return Ok(None);
        }

        let is_git = parts.path.ends_with(".git")
            || (GIT_HOSTS.contains(&parts.netloc)
                && !(parts.path.ends_with(".zip") || parts.path.ends_with(".tar.gz")));
        let is_hg = HG_HOSTS.contains(&parts.netloc);

        self.uri = Some(if is_git {
            format!("git+{}", uri)
        } else if is_hg {
            format!("hg+{}", uri)
        } else {
            uri
        });
        Ok(None)
    }
}

fn parse_local_file(raw: &str) -> String {
    if raw.contains("://") || !raw.contains(['/', '\\']) {
        return raw.to_string();
    }
    if Path::new(raw).exists() {
        return format!("file://{}", raw);
    }
    raw.to_string()
}

pub(crate) fn is_local_uri(uri: &str) -> bool {
    uri.starts_with("file://") || uri.starts_with("symlink://")
}

/// Strip the local scheme from `file://` and `symlink://` uris.
pub(crate) fn local_uri_path(uri: &str) -> Option<&str> {
    uri.strip_prefix("file://")
        .or_else(|| uri.strip_prefix("symlink://"))
}

/// Name of a package derived from its source uri.
fn name_from_uri(uri: &str) -> Option<String> {
    let mut uri = uri.strip_suffix('/').unwrap_or(uri);
    let mut stop_chars = vec!['#', '?'];
    if uri.starts_with("file://") {
        stop_chars.push('@');
    }
    for c in stop_chars {
        if let Some(idx) = uri.find(c) {
            uri = &uri[..idx];
        }
    }

    let parts = UriParts::split(uri);
    if parts.netloc == "github.com" && parts.path.matches('/').count() > 2 {
        return parts.path.split('/').nth(2).map(str::to_string);
    }

    let basename = uri.rsplit(['/', '\\']).next().unwrap_or(uri);
    let name = match basename.split_once('.') {
        Some((stem, _)) => stem.trim(),
        None => basename,
    };
    (!name.is_empty()).then(|| name.to_string())
}

/// Minimal `scheme://netloc/path` split; `path` excludes query and fragment.
struct UriParts<'a> {
    scheme: &'a str,
    netloc: &'a str,
    path: &'a str,
}

impl<'a> UriParts<'a> {
    fn split(uri: &'a str) -> Self {
        let uri = uri.split(['?', '#']).next().unwrap_or(uri);
        match uri.split_once("://") {
            Some((scheme, rest)) => {
                let (netloc, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, ""),
                };
                Self {
                    scheme,
                    netloc,
                    path,
                }
            }
            None => Self {
                scheme: "",
                netloc: "",
                path: uri,
            },
        }
    }
}

impl FromStr for PackageSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageSpec::parse(s)
    }
}

impl From<u64> for PackageSpec {
    fn from(id: u64) -> Self {
        PackageSpec::from_id(id)
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.humanize())
    }
}

impl PartialEq for PackageSpec {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner
            && self.id == other.id
            && self.name == other.name
            && self.requirements == other.requirements
            && self.uri == other.uri
    }
}

impl Eq for PackageSpec {}

impl Hash for PackageSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.id.hash(state);
        self.name.hash(state);
        self.requirements.hash(state);
        self.uri.hash(state);
    }
}
