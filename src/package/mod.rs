//! Package data model
//!
//! Specifiers, version requirements, installed-package metadata, manifests
//! and compatibility qualifiers.

pub mod compat;
pub mod manifest;
mod meta;
pub mod requirement;
pub mod spec;
pub mod version;

pub use compat::PackageCompatibility;
pub use manifest::{Manifest, ManifestDependency, ManifestExport};
pub use meta::{
    METAFILE_NAME, PackageItem, PackageMetadata, PackageOutdatedResult, PackageType, safe_dirname,
};
pub use requirement::VersionRequirement;
pub use spec::{PackageSpec, SpecKind};
pub use version::{UpdateIncrement, cast_version_to_semver};
