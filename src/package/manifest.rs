//! Package manifest loading.
//!
//! Manifests come in three shapes: `library.json`/`module.json`/`platform.json`/`package.json`
//! (JSON) and Arduino-style `library.properties` (`key=value`). All of them are
//! reduced to the fields the package manager needs; schema validation beyond
//! that is left to the manifest authors' tooling.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use super::compat::items_to_list;
use crate::error::Error;
use crate::runtime::Runtime;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestDependency {
    pub owner: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub platforms: Vec<String>,
    pub frameworks: Vec<String>,
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestExport {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub path: PathBuf,
    pub name: Option<String>,
    pub version: Option<String>,
    pub dependencies: Vec<ManifestDependency>,
    pub export: Option<ManifestExport>,
    pub system: Vec<String>,
    /// The manifest as loaded, for rewriting on pack.
    pub raw: Value,
}

impl Manifest {
    #[tracing::instrument(skip(runtime))]
    pub fn from_file<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        let content = runtime.read_to_string(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut manifest = Self::parse(&file_name, &content).map_err(|e| {
            anyhow::Error::from(Error::MissingManifest {
                names: file_name.clone(),
                path: path.to_path_buf(),
            })
            .context(format!("Invalid manifest: {:#}", e))
        })?;
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    /// Load the first manifest among `names` found directly in `dir`.
    pub fn from_dir<R: Runtime>(runtime: &R, dir: &Path, names: &[&str]) -> Result<Self> {
        match find_manifest(runtime, dir, names) {
            Some(path) => Self::from_file(runtime, &path),
            None => Err(Error::MissingManifest {
                names: names.join(", "),
                path: dir.to_path_buf(),
            }
            .into()),
        }
    }

    pub fn parse(file_name: &str, content: &str) -> Result<Self> {
        let raw = if file_name.ends_with(".properties") {
            properties_to_json(content)
        } else {
            serde_json::from_str::<Value>(content).context("Failed to parse manifest JSON")?
        };
        let object = raw
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("Manifest must be an object"))?;

        let name = string_field(object, "name");
        let version = match object.get("version") {
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => string_field(object, "version"),
        };
        let dependencies = parse_dependencies(object.get("dependencies"));
        let export = object.get("export").and_then(Value::as_object).map(|export| ManifestExport {
            include: string_list(export.get("include")),
            exclude: string_list(export.get("exclude")),
        });
        let system = items_to_list(object.get("system"));

        Ok(Self {
            path: PathBuf::new(),
            name,
            version,
            dependencies,
            export,
            system,
            raw,
        })
    }

    /// The manifest JSON without `export.include`, used when a single included
    /// directory becomes the package root.
    pub fn without_export_include(&self) -> Value {
        let mut raw = self.raw.clone();
        if let Some(export) = raw.get_mut("export").and_then(Value::as_object_mut) {
            export.remove("include");
        }
        raw
    }
}

/// First existing manifest file among `names` in `dir`.
pub fn find_manifest<R: Runtime>(runtime: &R, dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| runtime.exists(path) && !runtime.is_dir(path))
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Keep case for file patterns; accept a single string or an array.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_dependencies(value: Option<&Value>) -> Vec<ManifestDependency> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(dependency_from_value).collect(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, version)| {
                let (owner, name) = split_owner(key);
                ManifestDependency {
                    owner,
                    name,
                    version: version.as_str().map(str::to_string).filter(|v| !v.is_empty()),
                    ..Default::default()
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn dependency_from_value(value: &Value) -> Option<ManifestDependency> {
    match value {
        Value::String(s) => {
            let (key, version) = match s.rsplit_once('@') {
                Some((key, version)) => (key.trim(), Some(version.trim().to_string())),
                None => (s.trim(), None),
            };
            let (owner, name) = split_owner(key);
            Some(ManifestDependency {
                owner,
                name,
                version,
                ..Default::default()
            })
        }
        Value::Object(object) => {
            let name = string_field(object, "name")?;
            Some(ManifestDependency {
                owner: string_field(object, "owner"),
                name,
                version: string_field(object, "version"),
                platforms: items_to_list(object.get("platforms")),
                frameworks: items_to_list(object.get("frameworks")),
                authors: items_to_list(object.get("authors")),
            })
        }
        _ => None,
    }
}

fn split_owner(key: &str) -> (Option<String>, String) {
    match key.split_once('/') {
        Some((owner, name)) => (Some(owner.trim().to_string()), name.trim().to_string()),
        None => (None, key.trim().to_string()),
    }
}

/// Convert `library.properties` into the JSON manifest shape.
fn properties_to_json(content: &str) -> Value {
    let mut object = Map::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "depends" => {
                let deps: Vec<Value> = value
                    .split(',')
                    .filter_map(|item| {
                        let item = item.trim();
                        if item.is_empty() {
                            return None;
                        }
                        let mut dep = Map::new();
                        match item.split_once('(') {
                            Some((name, version)) => {
                                dep.insert("name".into(), Value::from(name.trim()));
                                dep.insert(
                                    "version".into(),
                                    Value::from(version.trim_end_matches(')').trim()),
                                );
                            }
                            None => {
                                dep.insert("name".into(), Value::from(item));
                            }
                        }
                        Some(Value::Object(dep))
                    })
                    .collect();
                object.insert("dependencies".into(), Value::Array(deps));
            }
            "architectures" => {
                object.insert("platforms".into(), Value::from(value));
            }
            _ => {
                object.insert(key.to_string(), Value::from(value));
            }
        }
    }
    Value::Object(object)
}
