//! Version coercion and pseudo-versions.
//!
//! Every installed artifact must carry a comparable semantic version, even
//! when its source only offers a tag, a commit hash or nothing at all.

use semver::{BuildMetadata, Prerelease, Version};
use std::fmt;

/// Parse `value` into a semantic version, coercing loose forms.
///
/// Order: strict parse, lenient coercion (`1.2` -> `1.2.0`, `1.2.3.4` ->
/// `1.2.3+4`), a hex digest -> `0.0.0+sha.<hex>`, anything else ->
/// `0.0.0+<sanitized value>`.
pub fn cast_version_to_semver(value: &str) -> Option<Version> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(value) {
        return Some(version);
    }
    if let Some(version) = coerce(value) {
        return Some(version);
    }
    if value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Version::parse(&format!("0.0.0+sha.{}", value)).ok();
    }
    let build = sanitize_identifiers(value, '.');
    Version::parse(&format!("0.0.0+{}", build)).ok()
}

fn coerce(value: &str) -> Option<Version> {
    let base_len = numeric_prefix_len(value);
    if base_len == 0 {
        return None;
    }
    let mut parts = value[..base_len]
        .split('.')
        .map(|part| part.parse::<u64>().ok());
    let major = parts.next().flatten()?;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    let mut version = Version::new(major, minor, patch);

    let rest: String = value[base_len..]
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if rest.is_empty() {
        return Some(version);
    }

    let (pre, build) = if let Some(build) = rest.strip_prefix(['+', '.']) {
        ("", build)
    } else {
        let rest = rest.strip_prefix('-').unwrap_or(&rest);
        rest.split_once('+').unwrap_or((rest, ""))
    };
    let build = build.replace('+', ".");

    if !pre.is_empty() {
        version.pre = Prerelease::new(pre).ok()?;
    }
    if !build.is_empty() {
        version.build = BuildMetadata::new(&build).ok()?;
    }
    Some(version)
}

/// Length of the leading `N[.N[.N]]` run.
fn numeric_prefix_len(value: &str) -> usize {
    let bytes = value.as_bytes();
    let mut end = 0;
    let mut groups = 0;
    let mut i = 0;
    while groups < 3 {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            break;
        }
        end = i;
        groups += 1;
        if i < bytes.len() && bytes[i] == b'.' {
            i += 1;
        } else {
            break;
        }
    }
    end
}

/// Replace characters invalid in semver identifiers and drop empty identifiers.
fn sanitize_identifiers(value: &str, separator: char) -> String {
    value
        .split(|c: char| c == separator || c == '+')
        .map(|ident| {
            ident
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect::<String>()
        })
        .filter(|ident| !ident.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

/// `0.0.0+<YYYYMMDDHHMMSS>` for sources that carry no version at all.
pub fn generate_rand_version() -> Version {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    let mut version = Version::new(0, 0, 0);
    version.build = BuildMetadata::new(&stamp).unwrap_or(BuildMetadata::EMPTY);
    version
}

/// Attach a VCS revision as build metadata: `<version core>+sha.<rev>`.
pub fn version_with_revision(version: Option<&Version>, revision: &str) -> Option<Version> {
    let base = version
        .map(|v| format!("{}.{}.{}", v.major, v.minor, v.patch))
        .unwrap_or_else(|| "0.0.0".to_string());
    let rev = sanitize_identifiers(revision, '.');
    Version::parse(&format!("{}+sha.{}", base, rev)).ok()
}

/// Severity of the jump from one version to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateIncrement {
    Major,
    Minor,
    Patch,
}

impl UpdateIncrement {
    pub fn between(current: &Version, latest: &Version) -> Option<Self> {
        if current == latest {
            None
        } else if current.major != latest.major {
            Some(Self::Major)
        } else if current.minor != latest.minor {
            Some(Self::Minor)
        } else {
            Some(Self::Patch)
        }
    }
}

impl fmt::Display for UpdateIncrement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Patch => write!(f, "patch"),
        }
    }
}
