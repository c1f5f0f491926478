//! Safe archive extraction and package packing.
//!
//! The format is chosen from the leading magic bytes, never from the file
//! name. Every entry whose destination, or whose link target, resolves outside
//! the destination root is skipped and logged.

mod pack;
mod tar_gz;
mod zip;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::error::Error;
use crate::runtime::is_path_under;

pub use pack::{PackagePacker, archive_name};
pub use tar_gz::TarGzExtractor;
pub use zip::ZipExtractor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarBz2,
    Zip,
}

const MAGIC: &[(&[u8], ArchiveKind)] = &[
    (b"\x1f\x8b\x08", ArchiveKind::TarGz),
    (b"\x42\x5a\x68", ArchiveKind::TarBz2),
    (b"\x50\x4b\x03\x04", ArchiveKind::Zip),
];

impl ArchiveKind {
    pub fn detect(path: &Path) -> Result<Self> {
        let mut header = [0u8; 4];
        let mut file =
            File::open(path).with_context(|| format!("Failed to open archive {:?}", path))?;
        let n = file
            .read(&mut header)
            .with_context(|| format!("Failed to read archive {:?}", path))?;
        MAGIC
            .iter()
            .find(|(magic, _)| header[..n].starts_with(magic))
            .map(|(_, kind)| *kind)
            .ok_or_else(|| Error::package(format!("Unknown archive type '{}'", path.display())).into())
    }
}

/// Format-specific extraction. Returns the entries (relative to `dest`) that
/// were extracted and are not links, so the caller can verify them on disk.
pub trait Extractor {
    fn extract(&self, archive: &Path, dest: &Path, progress: Option<&ProgressBar>) -> Result<Vec<PathBuf>>;
}

pub struct Unpacker {
    archive: PathBuf,
    kind: ArchiveKind,
    progress: bool,
}

impl Unpacker {
    pub fn new(archive: &Path) -> Result<Self> {
        let kind = ArchiveKind::detect(archive)?;
        Ok(Self {
            archive: archive.to_path_buf(),
            kind,
            progress: false,
        })
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Extract into `dest`, then check that every extracted item exists.
    #[tracing::instrument(skip(self))]
    pub fn unpack(&self, dest: &Path) -> Result<()> {
        let extractor: Box<dyn Extractor> = match self.kind {
            ArchiveKind::TarGz => Box::new(TarGzExtractor),
            ArchiveKind::Zip => Box::new(ZipExtractor),
            ArchiveKind::TarBz2 => {
                return Err(Error::package(format!(
                    "Unsupported archive type 'tar.bz2' for '{}'",
                    self.archive.display()
                ))
                .into());
            }
        };
        std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {:?}", dest))?;
        info!("Unpacking {:?}", self.archive);

        let attempt = |progress: Option<&ProgressBar>| -> Result<()> {
            let items = extractor.extract(&self.archive, dest, progress)?;
            verify_unpacked(dest, &items)
        };

        if !self.progress {
            return attempt(None);
        }
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("Unpacking {spinner} {pos} items") {
            bar.set_style(style);
        }
        let result = attempt(Some(&bar));
        bar.finish_and_clear();
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Unpacking with progress failed ({:#}), retrying silently", e);
                attempt(None)
            }
        }
    }
}

/// Create `dest` and return its canonical form, the root every entry is
/// checked against.
pub(crate) fn canonical_root(dest: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {:?}", dest))?;
    std::fs::canonicalize(dest).with_context(|| format!("Failed to resolve {:?}", dest))
}

/// Where `path` lands once links already on disk are followed. Components
/// that do not exist yet are kept as written.
pub(crate) fn resolve_on_disk(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => {
                resolved.push(other);
                if let Ok(canonical) = std::fs::canonicalize(&resolved) {
                    resolved = canonical;
                }
            }
        }
    }
    resolved
}

pub(crate) fn resolves_inside(path: &Path, root: &Path) -> bool {
    is_path_under(&resolve_on_disk(path), root)
}

/// Drop a link left at `target` so writing the entry cannot follow it.
pub(crate) fn clear_link(target: &Path) -> Result<()> {
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::remove_file(target)
            .with_context(|| format!("Failed to replace {:?}", target)),
        _ => Ok(()),
    }
}

fn verify_unpacked(dest: &Path, items: &[PathBuf]) -> Result<()> {
    for item in items {
        if std::fs::symlink_metadata(dest.join(item)).is_err() {
            return Err(Error::Extraction {
                item: item.display().to_string(),
                dest: dest.to_path_buf(),
            }
            .into());
        }
    }
    debug!("Verified {} unpacked items in {:?}", items.len(), dest);
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs::File;
    use std::path::Path;

    pub enum TarItem<'a> {
        File(&'a str, &'a str),
        Symlink(&'a str, &'a str),
        Hardlink(&'a str, &'a str),
    }

    /// Write a gzip tarball; names are stored verbatim so hostile paths survive.
    pub fn create_tar_gz(path: &Path, items: &[TarItem]) {
        let file = File::create(path).unwrap();
        let enc = GzEncoder::new(file, Compression::default());
        let mut tar = tar::Builder::new(enc);

        for item in items {
            let mut header = tar::Header::new_gnu();
            let (name, data): (&str, &[u8]) = match item {
                TarItem::File(name, content) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    (name, content.as_bytes())
                }
                TarItem::Symlink(name, target) | TarItem::Hardlink(name, target) => {
                    let kind = if matches!(item, TarItem::Symlink(..)) {
                        tar::EntryType::Symlink
                    } else {
                        tar::EntryType::Link
                    };
                    header.set_entry_type(kind);
                    header.set_size(0);
                    header.set_mode(0o777);
                    let gnu = header.as_gnu_mut().unwrap();
                    gnu.linkname = [0; 100];
                    gnu.linkname[..target.len()].copy_from_slice(target.as_bytes());
                    (name, &[])
                }
            };
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name = [0; 100];
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_cksum();
            tar.append(&header, data).unwrap();
        }
        tar.into_inner().unwrap().finish().unwrap();
    }
}
