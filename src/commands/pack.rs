use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::archive::PackagePacker;
use crate::runtime::Runtime;

/// Pack a package source directory (or re-pack an archive) into a tarball.
#[tracing::instrument(skip(runtime))]
pub fn pack<R: Runtime>(runtime: &R, source: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let archive = PackagePacker::new(source).pack(runtime, output)?;
    println!("Wrote {}", archive.display());
    Ok(archive)
}
