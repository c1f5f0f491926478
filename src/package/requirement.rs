//! Version requirements attached to a package specifier.
//!
//! A requirement is a comma-separated list of clauses. Each clause is a
//! semver range (`^1.2`, `~2.0`, `>=1.0`, `<2`, `*`), an exact version
//! (`1.2.3`, `==1.2.3`, `=1.2.3`) or a negation (`!=1.2.3`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use semver::{Version, VersionReq};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone)]
enum Clause {
    Match(VersionReq),
    Not(VersionReq),
}

#[derive(Debug, Clone)]
pub struct VersionRequirement {
    raw: String,
    clauses: Vec<Clause>,
}

impl VersionRequirement {
    /// Requirement matching exactly `version` (build metadata is ignored).
    pub fn exact(version: &Version) -> Self {
        let mut core = version.clone();
        core.build = semver::BuildMetadata::EMPTY;
        let raw = core.to_string();
        let clauses = vec![Clause::Match(exact_req(&raw))];
        Self { raw, clauses }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Match(req) => req.matches(version),
            Clause::Not(req) => !req.matches(version),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn exact_req(version: &str) -> VersionReq {
    VersionReq::parse(&format!("={}", version)).unwrap_or(VersionReq::STAR)
}

fn parse_clause(clause: &str) -> Option<Clause> {
    let clause = clause.trim();
    if clause.is_empty() {
        return None;
    }
    if let Some(rest) = clause.strip_prefix("!=") {
        return VersionReq::parse(&format!("={}", rest.trim()))
            .ok()
            .map(Clause::Not);
    }
    let normalized = match clause.strip_prefix("==") {
        Some(rest) => format!("={}", rest.trim()),
        // A bare version pins exactly
        None if clause.starts_with(|c: char| c.is_ascii_digit()) => format!("={}", clause),
        None => clause.to_string(),
    };
    VersionReq::parse(&normalized).ok().map(Clause::Match)
}

impl FromStr for VersionRequirement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(Error::Parse(s.to_string()));
        }
        let clauses = raw
            .split(',')
            .map(|clause| parse_clause(clause).ok_or_else(|| Error::Parse(raw.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: raw.to_string(),
            clauses,
        })
    }
}

impl fmt::Display for VersionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for VersionRequirement {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for VersionRequirement {}

impl Hash for VersionRequirement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl Serialize for VersionRequirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionRequirement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn req(s: &str) -> VersionRequirement {
        s.parse().unwrap()
    }

    #[test]
    fn test_caret_and_tilde() {
        assert!(req("^1.2.3").matches(&v("1.9.0")));
        assert!(!req("^1.2.3").matches(&v("2.0.0")));
        assert!(req("~2.0").matches(&v("2.0.7")));
        assert!(!req("~2.0").matches(&v("2.1.0")));
    }

    #[test]
    fn test_bare_version_is_exact() {
        assert!(req("1.2.3").matches(&v("1.2.3")));
        assert!(!req("1.2.3").matches(&v("1.2.4")));
        assert!(req("==4.4.0").matches(&v("4.4.0")));
    }

    #[test]
    fn test_negation_and_multiple_clauses() {
        let r = req("!=1.2.3,<2.0");
        assert!(r.matches(&v("1.2.4")));
        assert!(!r.matches(&v("1.2.3")));
        assert!(!r.matches(&v("2.0.0")));

        let r = req("^1.2.3,!=5");
        assert!(r.matches(&v("1.5.0")));
    }

    #[test]
    fn test_build_metadata_is_ignored() {
        assert!(req("^1.0.0").matches(&v("1.0.0+sha.abc1234")));
        let exact = VersionRequirement::exact(&v("1.0.0+sha.abc1234"));
        assert_eq!(exact.as_str(), "1.0.0");
        assert!(exact.matches(&v("1.0.0")));
    }

    #[test]
    fn test_invalid_requirement() {
        assert!("develop".parse::<VersionRequirement>().is_err());
        assert!("".parse::<VersionRequirement>().is_err());
        assert!("^1.0,".parse::<VersionRequirement>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let r = req(">=1.0, <2");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"">=1.0, <2""#);
        let back: VersionRequirement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
