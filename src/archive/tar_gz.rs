use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use indicatif::ProgressBar;
use log::{debug, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::{Extractor, canonical_root, clear_link, resolve_on_disk, resolves_inside};

/// Extractor for gzip-compressed tarballs.
pub struct TarGzExtractor;

impl Extractor for TarGzExtractor {
    fn extract(&self, archive: &Path, dest: &Path, progress: Option<&ProgressBar>) -> Result<Vec<PathBuf>> {
        debug!("Extracting tar.gz archive {:?} to {:?}", archive, dest);
        let file = File::open(archive).with_context(|| format!("Failed to open {:?}", archive))?;
        let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        tar.set_preserve_permissions(true);
        tar.set_overwrite(true);

        let root = canonical_root(dest)?;
        let mut extracted = Vec::new();

        for entry in tar.entries().context("Failed to read tar entries")? {
            let mut entry = entry.context("Failed to read tar entry")?;
            let rel = entry.path().context("Invalid tar entry path")?.into_owned();
            let target = root.join(&rel);

            if !resolves_inside(&target, &root) {
                warn!("Blocked insecure item `{}` from TAR archive", rel.display());
                continue;
            }

            let entry_type = entry.header().entry_type();
            let is_link = entry_type.is_symlink() || entry_type.is_hard_link();
            if is_link {
                let link = entry
                    .link_name()
                    .context("Invalid tar link name")?
                    .map(|l| l.into_owned())
                    .unwrap_or_default();
                // Symlinks resolve from their own directory, hardlinks from the archive root
                let base = if entry_type.is_symlink() {
                    resolve_on_disk(target.parent().unwrap_or(&root))
                } else {
                    root.clone()
                };
                if !resolves_inside(&base.join(&link), &root) {
                    warn!(
                        "Blocked insecure item `{}` -> `{}` from TAR archive",
                        rel.display(),
                        link.display()
                    );
                    continue;
                }
            }
            if !entry_type.is_dir() {
                clear_link(&target)?;
            }

            let unpacked = entry
                .unpack_in(&root)
                .with_context(|| format!("Failed to extract {:?}", rel))?;
            if !unpacked {
                warn!("Skipped tar item `{}`", rel.display());
                continue;
            }
            if !is_link {
                extracted.push(rel);
            }
            if let Some(bar) = progress {
                bar.inc(1);
            }
        }

        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{TarItem, create_tar_gz};
    use super::super::Unpacker;
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_extract_nested_files() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        let dest = dir.path().join("out");
        create_tar_gz(
            &archive,
            &[
                TarItem::File("foo-1.0/library.json", "{}"),
                TarItem::File("foo-1.0/src/foo.c", "int foo;"),
            ],
        );

        Unpacker::new(&archive).unwrap().unpack(&dest).unwrap();

        assert!(dest.join("foo-1.0/library.json").is_file());
        assert_eq!(
            fs::read_to_string(dest.join("foo-1.0/src/foo.c")).unwrap(),
            "int foo;"
        );
    }

    #[test]
    fn test_blocks_parent_traversal() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        let dest = dir.path().join("a").join("b").join("out");
        create_tar_gz(
            &archive,
            &[
                TarItem::File("../../etc/passwd", "root:x:0:0"),
                TarItem::File("good.txt", "fine"),
            ],
        );

        Unpacker::new(&archive).unwrap().unpack(&dest).unwrap();

        assert!(!dir.path().join("a").join("etc").join("passwd").exists());
        assert_eq!(fs::read_to_string(dest.join("good.txt")).unwrap(), "fine");
    }

    #[cfg(unix)]
    #[test]
    fn test_blocks_escaping_links() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("links.tar.gz");
        let dest = dir.path().join("out");
        create_tar_gz(
            &archive,
            &[
                TarItem::Symlink("escape", "../../outside"),
                TarItem::Symlink("abs", "/etc/passwd"),
                TarItem::Hardlink("hard", "../secret"),
                TarItem::File("include/foo.h", "#pragma once"),
                TarItem::Symlink("foo.h", "include/foo.h"),
            ],
        );

        Unpacker::new(&archive).unwrap().unpack(&dest).unwrap();

        assert!(fs::symlink_metadata(dest.join("escape")).is_err());
        assert!(fs::symlink_metadata(dest.join("abs")).is_err());
        assert!(fs::symlink_metadata(dest.join("hard")).is_err());
        assert_eq!(
            fs::read_link(dest.join("foo.h")).unwrap(),
            PathBuf::from("include/foo.h")
        );
    }

    #[test]
    fn test_extract_reports_non_link_items() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        create_tar_gz(
            &archive,
            &[
                TarItem::File("a.txt", "a"),
                TarItem::Symlink("b.txt", "a.txt"),
            ],
        );

        let items = TarGzExtractor.extract(&archive, &dest, None).unwrap();
        assert_eq!(items, vec![PathBuf::from("a.txt")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_link_chain_is_skipped_and_siblings_extract() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("chain.tar.gz");
        let dest = dir.path().join("out");
        create_tar_gz(
            &archive,
            &[
                TarItem::Symlink("a", "."),
                TarItem::Symlink("a/b", ".."),
                TarItem::File("a/b/evil.txt", "bad"),
                TarItem::File("good.txt", "fine"),
            ],
        );

        Unpacker::new(&archive).unwrap().unpack(&dest).unwrap();

        assert!(!dir.path().join("evil.txt").exists());
        assert_eq!(fs::read_link(dest.join("a")).unwrap(), PathBuf::from("."));
        assert_eq!(fs::read_to_string(dest.join("good.txt")).unwrap(), "fine");
    }

    #[cfg(unix)]
    #[test]
    fn test_does_not_write_through_linked_parent() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("through.tar.gz");
        let dest = dir.path().join("out");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&dest).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, dest.join("cache")).unwrap();
        create_tar_gz(
            &archive,
            &[
                TarItem::File("cache/evil.txt", "bad"),
                TarItem::File("src/main.c", "int x;"),
            ],
        );

        Unpacker::new(&archive).unwrap().unpack(&dest).unwrap();

        assert!(!outside.join("evil.txt").exists());
        assert!(dest.join("src/main.c").is_file());
    }
}
