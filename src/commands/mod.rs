//! Subcommands behind the `fwpm` binary. Each one is a thin layer that
//! parses specifiers, calls the manager and prints the outcome.

mod install;
mod list;
mod pack;
mod update;

use anyhow::Result;
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cleanup::SharedCleanupContext;
use crate::config::Config;
use crate::manager::PackageManager;
use crate::package::PackageType;
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::runtime::Runtime;

pub use install::{install, uninstall};
pub use list::{list, render_list};
pub use pack::pack;
pub use update::{outdated, update};

/// Which storage root a command works on.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageOptions {
    pub pkg_type: PackageType,
    /// Overrides the default root of `pkg_type` under the core directory.
    pub storage_dir: Option<PathBuf>,
}

pub fn open_manager<R: Runtime>(
    runtime: R,
    config: &Config,
    storage: &StorageOptions,
    cleanup: SharedCleanupContext,
) -> Result<PackageManager<R>> {
    let registry: Arc<dyn RegistryClient> = Arc::new(HttpRegistryClient::from_config(config)?);
    let dir = storage.storage_dir.clone();
    let pm = match storage.pkg_type {
        PackageType::Library => PackageManager::library(runtime, dir, config, registry)?,
        PackageType::Platform => PackageManager::platform(runtime, dir, config, registry)?,
        PackageType::Tool => PackageManager::tool(runtime, dir, config, registry)?,
    };
    debug!("Using {} storage at {:?}", storage.pkg_type, pm.package_dir());
    Ok(pm.with_cleanup(cleanup))
}
