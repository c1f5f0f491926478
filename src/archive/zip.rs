use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

use super::{Extractor, canonical_root, clear_link, resolve_on_disk, resolves_inside};

/// Extractor for .zip archives
pub struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn extract(&self, archive: &Path, dest: &Path, progress: Option<&ProgressBar>) -> Result<Vec<PathBuf>> {
        debug!("Extracting zip archive {:?} to {:?}", archive, dest);
        let file = File::open(archive).with_context(|| format!("Failed to open {:?}", archive))?;
        let mut zip = ZipArchive::new(BufReader::new(file)).context("Failed to parse ZIP archive")?;
        if let Some(bar) = progress {
            bar.set_length(zip.len() as u64);
        }

        let root = canonical_root(dest)?;
        let mut extracted = Vec::new();

        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .with_context(|| format!("Failed to read ZIP entry {}", i))?;
            if let Some(bar) = progress {
                bar.inc(1);
            }

            let Some(rel) = entry.enclosed_name() else {
                warn!("Blocked insecure item `{}` from ZIP archive", entry.name());
                continue;
            };
            let target = root.join(&rel);
            if !resolves_inside(&target, &root) {
                warn!("Blocked insecure item `{}` from ZIP archive", rel.display());
                continue;
            }

            if entry.is_dir() {
                fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create {:?}", target))?;
                extracted.push(rel);
                continue;
            }
            let parent = target.parent().unwrap_or(&root);
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;

            if entry.is_symlink() {
                let mut link = String::new();
                entry
                    .read_to_string(&mut link)
                    .context("Failed to read ZIP symlink target")?;
                if !resolves_inside(&resolve_on_disk(parent).join(&link), &root) {
                    warn!(
                        "Blocked insecure item `{}` -> `{}` from ZIP archive",
                        rel.display(),
                        link
                    );
                    continue;
                }
                write_symlink(&link, &target)?;
                continue;
            }

            clear_link(&target)?;
            let mut out =
                File::create(&target).with_context(|| format!("Failed to create {:?}", target))?;
            std::io::copy(&mut entry, &mut out)
                .with_context(|| format!("Failed to extract {:?}", target))?;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777)) {
                    debug!("Failed to set permissions on {:?}: {}", target, e);
                }
            }
            extracted.push(rel);
        }

        Ok(extracted)
    }
}

#[cfg(unix)]
fn write_symlink(link: &str, target: &Path) -> Result<()> {
    clear_link(target)?;
    std::os::unix::fs::symlink(link, target)
        .with_context(|| format!("Failed to create symlink {:?}", target))
}

#[cfg(not(unix))]
fn write_symlink(link: &str, target: &Path) -> Result<()> {
    // Without symlink privileges keep the link text as a plain file
    fs::write(target, link).with_context(|| format!("Failed to write {:?}", target))
}
