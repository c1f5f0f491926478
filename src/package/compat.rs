//! Compatibility qualifiers used to filter dependency candidates.

use semver::Version;
use serde_json::Value;
use std::collections::BTreeMap;

use super::requirement::VersionRequirement;
use super::version::cast_version_to_semver;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageCompatibility {
    pub owner: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub platforms: Vec<String>,
    pub frameworks: Vec<String>,
    pub authors: Vec<String>,
}

impl PackageCompatibility {
    /// Qualifiers declared by a manifest dependency entry.
    pub fn from_dependency(dependency: &super::manifest::ManifestDependency) -> Self {
        Self {
            owner: dependency.owner.clone(),
            name: Some(dependency.name.clone()),
            version: dependency.version.clone(),
            platforms: dependency.platforms.clone(),
            frameworks: dependency.frameworks.clone(),
            authors: dependency.authors.clone(),
        }
    }

    pub fn with_platforms(mut self, platforms: &[&str]) -> Self {
        self.platforms = platforms.iter().map(|p| p.to_lowercase()).collect();
        self
    }

    pub fn with_frameworks(mut self, frameworks: &[&str]) -> Self {
        self.frameworks = frameworks.iter().map(|f| f.to_lowercase()).collect();
        self
    }

    /// Whether nothing but identity qualifiers are set.
    pub fn has_search_qualifiers(&self) -> bool {
        !(self.platforms.is_empty() && self.frameworks.is_empty() && self.authors.is_empty())
    }

    /// Registry search filters for the list qualifiers that are set.
    pub fn to_search_qualifiers(&self) -> BTreeMap<String, Vec<String>> {
        [
            ("platforms", &self.platforms),
            ("frameworks", &self.frameworks),
            ("authors", &self.authors),
        ]
        .into_iter()
        .filter(|(_, items)| !items.is_empty() && !items.iter().any(|i| i == "*"))
        .map(|(key, items)| (key.to_string(), items.clone()))
        .collect()
    }

    /// Empty qualifiers on either side always match; lists match on any
    /// shared item (`*` matches everything).
    pub fn is_compatible(&self, other: &PackageCompatibility) -> bool {
        let scalars = [
            (&self.owner, &other.owner),
            (&self.name, &other.name),
        ];
        for (mine, theirs) in scalars {
            if let (Some(a), Some(b)) = (mine, theirs)
                && !a.is_empty()
                && !b.is_empty()
                && !a.eq_ignore_ascii_case(b)
            {
                return false;
            }
        }

        if let (Some(mine), Some(theirs)) = (&self.version, &other.version)
            && !version_matches(mine, theirs)
        {
            return false;
        }

        let lists = [
            (&self.platforms, &other.platforms),
            (&self.frameworks, &other.frameworks),
            (&self.authors, &other.authors),
        ];
        lists
            .into_iter()
            .filter(|(a, b)| !a.is_empty() && !b.is_empty())
            .all(|(a, b)| items_in_list(a, b))
    }
}

fn version_matches(version: &str, requirement: &str) -> bool {
    let Some(version) = cast_version_to_semver(version) else {
        return false;
    };
    requirement
        .parse::<VersionRequirement>()
        .map(|req| req.matches(&version))
        .unwrap_or(false)
}

/// Whether two qualifier lists share an item, `*` acting as a wildcard.
pub fn items_in_list(needle: &[String], haystack: &[String]) -> bool {
    if needle.iter().chain(haystack).any(|item| item == "*") {
        return true;
    }
    needle
        .iter()
        .any(|item| haystack.iter().any(|h| h.eq_ignore_ascii_case(item)))
}

/// Normalize a JSON string or array into a lowercase list; strings are split on commas.
pub fn items_to_list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<String> = match value {
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Whether a package or file declared for `systems` runs on `systype`.
pub fn is_system_compatible(systems: &[String], systype: &str) -> bool {
    if systems.is_empty() {
        return true;
    }
    items_in_list(systems, &[systype.to_string()])
}

/// Highest version among candidates that satisfies `requirement`.
pub fn pick_best_version<'a, I>(candidates: I, requirement: Option<&VersionRequirement>) -> Option<&'a Version>
where
    I: IntoIterator<Item = &'a Version>,
{
    candidates
        .into_iter()
        .filter(|v| requirement.is_none_or(|req| req.matches(v)))
        .max()
}
