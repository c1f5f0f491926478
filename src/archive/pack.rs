//! Build a distributable `.tar.gz` from a package directory or archive.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use glob::{MatchOptions, Pattern};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::Unpacker;
use crate::error::Error;
use crate::package::{Manifest, PackageType, METAFILE_NAME};
use crate::runtime::Runtime;

const INCLUDE_DEFAULT: &[&str] = &["*", ".*"];

const INCLUDE_ALWAYS: &[&str] = &["README", "README.md", "README.rst", "LICENSE"];

const EXCLUDE_DEFAULT: &[&str] = &[
    METAFILE_NAME,
    "._*",
    "__*",
    ".DS_Store",
    ".vscode",
    ".cache",
    "**/.cache",
    "**/__pycache__",
    "**/*.pyc",
    ".git",
    ".hg",
    ".svn",
];

const EXCLUDE_EXTRA: &[&str] = &[
    "test",
    "tests",
    "doc",
    "docs",
    "examples/*/build",
    ".pio",
    "**/.pio",
    "**/*.o",
    "**/*.a",
    "**/*.so",
    "**/*.dll",
    "**/*.exe",
    "**/*.jar",
    "**/*.zip",
    "**/*.tar.gz",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    Include(String),
    Exclude(String),
}

/// Archive file name for a package; characters outside `[0-9A-Za-z-._+]` are dropped.
pub fn archive_name(name: &str, version: &str, system: Option<&str>) -> String {
    let system = system.map(|s| format!("-{}", s)).unwrap_or_default();
    format!("{}{}-{}.tar.gz", name, system, version)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '+'))
        .collect()
}

pub struct PackagePacker {
    package: PathBuf,
}

impl PackagePacker {
    pub fn new(package: impl Into<PathBuf>) -> Self {
        Self {
            package: package.into(),
        }
    }

    /// Pack into `dst`: a file path, an existing directory, or the current
    /// directory when `None`. Returns the created archive path.
    #[tracing::instrument(skip(self, runtime))]
    pub fn pack<R: Runtime>(&self, runtime: &R, dst: Option<&Path>) -> Result<PathBuf> {
        let unpacked;
        let src = if self.package.is_dir() {
            self.package.clone()
        } else {
            unpacked = tempfile::tempdir().context("Failed to create temporary directory")?;
            Unpacker::new(&self.package)?.unpack(unpacked.path())?;
            unpacked.path().to_path_buf()
        };

        let src = find_source_root(&src);
        let names = PackageType::all_manifest_names();
        let manifest = Manifest::from_dir(runtime, &src, &names)?;
        let (Some(name), Some(version)) = (&manifest.name, &manifest.version) else {
            return Err(Error::package(format!(
                "Manifest {:?} must declare a name and a version",
                manifest.path
            ))
            .into());
        };

        let filename = archive_name(name, version, manifest.system.first().map(String::as_str));
        let dst = match dst {
            None => runtime.current_dir()?.join(&filename),
            Some(dir) if dir.is_dir() => dir.join(&filename),
            Some(path) => path.to_path_buf(),
        };

        self.create_tarball(&src, &dst, &manifest)?;
        info!("Packed {} {} into {:?}", name, version, dst);
        Ok(dst)
    }

    fn create_tarball(&self, src: &Path, dst: &Path, manifest: &Manifest) -> Result<()> {
        let export = manifest.export.clone().unwrap_or_default();
        let mut src = src.to_path_buf();
        let mut include = export.include.clone();
        let mut rewritten_manifest = None;

        // A single included directory becomes the package root
        if let [only] = include.as_slice()
            && src.join(only).is_dir()
        {
            src = src.join(only);
            let manifest_name = manifest
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .filter(|n| n.ends_with(".json"))
                .unwrap_or_else(|| "library.json".to_string());
            let json = serde_json::to_vec_pretty(&manifest.without_export_include())?;
            rewritten_manifest = Some((manifest_name, json));
            include.clear();
        }

        let is_properties = manifest
            .path
            .extension()
            .is_some_and(|ext| ext == "properties");
        let filters = compute_src_filters(
            &src,
            &include,
            &export.exclude,
            manifest.export.is_none() || is_properties,
        );
        let files = match_src_files(&src, &filters);
        debug!("Packing {} files from {:?}", files.len(), src);

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let file = File::create(dst).with_context(|| format!("Failed to create {:?}", dst))?;
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        tar.follow_symlinks(false);

        for rel in &files {
            if let Some((name, _)) = &rewritten_manifest
                && rel == Path::new(name)
            {
                continue;
            }
            tar.append_path_with_name(src.join(rel), rel)
                .with_context(|| format!("Failed to add {:?} to the archive", rel))?;
        }
        if let Some((name, json)) = rewritten_manifest {
            let mut header = tar::Header::new_gnu();
            header.set_size(json.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
            tar.append_data(&mut header, &name, json.as_slice())
                .context("Failed to add the manifest to the archive")?;
        }

        tar.into_inner()
            .context("Failed to finish the archive")?
            .finish()
            .context("Failed to finish compression")?;
        Ok(())
    }
}

/// First directory (top-down, sorted) that holds a recognized manifest.
fn find_source_root(src: &Path) -> PathBuf {
    let names = PackageType::all_manifest_names();
    WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .find(|e| names.iter().any(|name| e.path().join(name).is_file()))
        .map(|e| e.into_path())
        .unwrap_or_else(|| src.to_path_buf())
}

fn compute_src_filters(src: &Path, include: &[String], exclude: &[String], with_extra: bool) -> Vec<Filter> {
    let mut filters: Vec<Filter> = if include.is_empty() {
        INCLUDE_DEFAULT.iter().map(|p| Filter::Include(p.to_string())).collect()
    } else {
        include.iter().map(|p| Filter::Include(p.clone())).collect()
    };
    filters.extend(EXCLUDE_DEFAULT.iter().map(|p| Filter::Exclude(p.to_string())));
    filters.extend(exclude.iter().map(|p| Filter::Exclude(p.clone())));

    if with_extra {
        filters.extend(EXCLUDE_EXTRA.iter().map(|p| Filter::Exclude(p.to_string())));
        let gitignore = src.join(".gitignore");
        if gitignore.is_file() {
            match fs::read_to_string(&gitignore) {
                Ok(content) => filters.extend(gitignore_filters(&content)),
                Err(e) => warn!("Could not read {:?}: {}", gitignore, e),
            }
        }
    }

    filters.extend(
        PackageType::all_manifest_names()
            .into_iter()
            .chain(INCLUDE_ALWAYS.iter().copied())
            .map(|p| Filter::Include(p.to_string())),
    );
    filters
}

fn gitignore_filters(content: &str) -> Vec<Filter> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.strip_prefix('!') {
            Some(negated) => Filter::Include(negated.to_string()),
            None => Filter::Exclude(line.to_string()),
        })
        .collect()
}

/// Apply ordered include/exclude filters to every file below `src`.
/// A pattern matching a directory selects everything inside it.
fn match_src_files(src: &Path, filters: &[Filter]) -> Vec<PathBuf> {
    let candidates: Vec<PathBuf> = WalkDir::new(src)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .filter_map(|e| e.path().strip_prefix(src).ok().map(Path::to_path_buf))
        .collect();

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let mut result = BTreeSet::new();
    for filter in filters {
        let (raw, include) = match filter {
            Filter::Include(p) => (p, true),
            Filter::Exclude(p) => (p, false),
        };
        let trimmed = raw.trim_start_matches('/').trim_end_matches('/');
        let Ok(pattern) = Pattern::new(trimmed) else {
            debug!("Ignoring invalid filter pattern {:?}", raw);
            continue;
        };
        for rel in &candidates {
            if !path_or_ancestor_matches(&pattern, rel, options) {
                continue;
            }
            if include {
                result.insert(rel.clone());
            } else {
                result.remove(rel);
            }
        }
    }
    result.into_iter().collect()
}

fn path_or_ancestor_matches(pattern: &Pattern, rel: &Path, options: MatchOptions) -> bool {
    let mut prefix = PathBuf::new();
    for component in rel.components() {
        prefix.push(component);
        let text = prefix.to_string_lossy().replace('\\', "/");
        if pattern.matches_with(&text, options) {
            return true;
        }
    }
    false
}
