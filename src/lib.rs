//! Package manager engine for embedded development: libraries, tools and
//! development platforms installed from a registry, VCS remotes, archives or
//! local directories into per-kind storage roots.

pub mod archive;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod lockfile;
pub mod manager;
pub mod package;
pub mod registry;
pub mod runtime;
pub mod vcs;

pub use config::Config;
pub use error::Error;
pub use manager::PackageManager;
pub use package::{PackageItem, PackageSpec, PackageType};
