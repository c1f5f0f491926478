//! Error taxonomy for package operations.
//!
//! Functions across the crate return `anyhow::Result`; the variants below are
//! attached as the root cause so callers can classify a failure with
//! `err.downcast_ref::<Error>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The package specifier could not be understood.
    #[error("Invalid package specification '{0}'")]
    Parse(String),

    /// No installed or published package matches the request.
    #[error("Could not find the package with '{0}' requirements")]
    UnknownPackage(String),

    /// No recognized manifest was found in the package contents.
    #[error("Could not find one of '{names}' manifest files in the package {path}")]
    MissingManifest { names: String, path: PathBuf },

    /// A fetched artifact failed verification or does not satisfy the request.
    #[error("{0}")]
    Package(String),

    /// The storage root stayed locked for longer than the allowed wait.
    #[error("Timed out waiting for the lock {0}")]
    LockTimeout(PathBuf),

    /// A version-control command failed.
    #[error("VCS: {0}")]
    Vcs(String),

    /// An archive item is missing after extraction.
    #[error("Could not extract `{item}` to `{dest}`. Try to disable antivirus tool or check the directory permissions")]
    Extraction { item: String, dest: PathBuf },
}

impl Error {
    pub fn package(msg: impl Into<String>) -> Self {
        Error::Package(msg.into())
    }

    pub fn vcs(msg: impl Into<String>) -> Self {
        Error::Vcs(msg.into())
    }
}

/// Returns the package error carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}
