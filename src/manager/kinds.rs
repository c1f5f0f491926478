//! Behavior that depends on the kind of package a root holds.

use anyhow::Result;
use log::{debug, info};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::PackageManager;
use crate::config::Config;
use crate::package::compat::is_system_compatible;
use crate::package::version::generate_rand_version;
use crate::package::{PackageItem, PackageSpec, PackageType};
use crate::registry::RegistryClient;
use crate::runtime::Runtime;

const LIBRARY_DIR_SIGNS: &[&str] = &["include", "Include", "inc", "Inc", "src", "Src"];
const LIBRARY_FILE_SIGNS: &[&str] = &["conanfile.py", "CMakeLists.txt"];
const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "h", "hpp", "S"];

impl<R: Runtime> PackageManager<R> {
    pub fn library(
        runtime: R,
        dir: Option<PathBuf>,
        config: &Config,
        registry: Arc<dyn RegistryClient>,
    ) -> Result<Self> {
        let dir = dir.unwrap_or_else(|| config.lib_dir());
        Self::new(runtime, PackageType::Library, dir, config, registry)
    }

    pub fn platform(
        runtime: R,
        dir: Option<PathBuf>,
        config: &Config,
        registry: Arc<dyn RegistryClient>,
    ) -> Result<Self> {
        let dir = dir.unwrap_or_else(|| config.platforms_dir());
        Self::new(runtime, PackageType::Platform, dir, config, registry)
    }

    pub fn tool(
        runtime: R,
        dir: Option<PathBuf>,
        config: &Config,
        registry: Arc<dyn RegistryClient>,
    ) -> Result<Self> {
        let dir = dir.unwrap_or_else(|| config.packages_dir());
        Self::new(runtime, PackageType::Tool, dir, config, registry)
    }

    /// Platforms leave their toolchains to the build orchestration.
    pub(crate) fn always_skips_dependencies(&self) -> bool {
        self.pkg_type == PackageType::Platform
    }

    /// Tools built for another host system are hidden from listings.
    pub(crate) fn is_visible(&self, pkg: &PackageItem) -> bool {
        if self.pkg_type != PackageType::Tool {
            return true;
        }
        match self.load_manifest(&pkg.path) {
            Ok(manifest) => {
                let visible = is_system_compatible(&manifest.system, &self.systype);
                if !visible {
                    debug!("Hiding {}: built for {:?}", pkg, manifest.system);
                }
                visible
            }
            Err(_) => true,
        }
    }

    /// Write a `library.json` into the detected root of an unpackaged library.
    pub(crate) fn synthesize_library_root(&self, path: &Path, spec: &PackageSpec) -> Result<PathBuf> {
        let root = find_library_root(&self.runtime, path).unwrap_or_else(|| path.to_path_buf());
        let name = spec
            .name
            .clone()
            .or_else(|| root.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "library".to_string());
        let manifest = json!({
            "name": name,
            "version": generate_rand_version().to_string(),
        });
        self.runtime.write(
            &root.join("library.json"),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )?;
        info!("Generated library.json for {} in {:?}", name, root);
        Ok(root)
    }
}

/// First directory, depth first, that holds a source directory, a build
/// file or C/C++ sources.
pub fn find_library_root<R: Runtime>(runtime: &R, path: &Path) -> Option<PathBuf> {
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = runtime.read_dir(&dir) else {
            continue;
        };
        let (dirs, files): (Vec<PathBuf>, Vec<PathBuf>) = entries
            .into_iter()
            .filter(|entry| !runtime.is_symlink(entry))
            .partition(|entry| runtime.is_dir(entry));
        let file_name = |p: &PathBuf| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        };

        if dirs.iter().any(|d| LIBRARY_DIR_SIGNS.contains(&file_name(d).as_str())) {
            return Some(dir);
        }
        let has_sources = files.iter().any(|f| {
            LIBRARY_FILE_SIGNS.contains(&file_name(f).as_str())
                || f.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
        });
        if has_sources {
            return Some(dir);
        }

        // Reverse so the alphabetically first child is visited next
        for child in dirs.into_iter().rev() {
            if !file_name(&child).starts_with('.') {
                stack.push(child);
            }
        }
    }
    None
}
