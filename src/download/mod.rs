//! Content-addressed download cache.
//!
//! A blob lives at `<download dir>/<sha256(uri ‖ checksum)>`. Identical
//! requests are served from disk; a miss streams into a temp file while a
//! [`LockFile`] on the final path keeps concurrent processes from fetching the
//! same blob twice, and the blob is only renamed into place once verified.

mod usage;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Error;
use crate::http::HttpClient;
use crate::lockfile::LockFile;

pub use usage::{USAGE_FILE_NAME, UsageStore};

/// Blobs untouched for this many seconds are evicted.
pub const DOWNLOAD_CACHE_EXPIRE: i64 = 86400 * 30;
/// Minimum number of seconds between two eviction sweeps.
pub const DOWNLOAD_CACHE_SWEEP_INTERVAL: i64 = 86400;

const TMP_PREFIX: &str = "_tmp_download";

#[derive(Clone)]
pub struct Downloader {
    http: HttpClient,
    download_dir: PathBuf,
    progress: bool,
}

impl Downloader {
    pub fn new(http: HttpClient, download_dir: PathBuf) -> Self {
        Self {
            http,
            download_dir,
            progress: false,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let http = HttpClient::new(config.http_client()?);
        Ok(Self::new(http, config.download_dir()).with_progress(config.progress))
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn compute_download_path(&self, uri: &str, checksum: Option<&str>) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        hasher.update(checksum.unwrap_or_default().as_bytes());
        self.download_dir.join(hex::encode(hasher.finalize()))
    }

    /// Fetch `uri` into the cache, verifying `checksum` when given, and return
    /// the cached path.
    #[tracing::instrument(skip(self))]
    pub async fn download(&self, uri: &str, checksum: Option<&str>) -> Result<PathBuf> {
        fs::create_dir_all(&self.download_dir)
            .with_context(|| format!("Failed to create {:?}", self.download_dir))?;

        let dl_path = self.compute_download_path(uri, checksum);
        if dl_path.is_file() {
            debug!("Download cache hit for {} at {:?}", uri, dl_path);
            self.set_download_utime(&dl_path);
            return Ok(dl_path);
        }
        if let Some(checksum) = checksum {
            checksum_algorithm(checksum)?;
        }

        let _lock = LockFile::new(&dl_path).acquire_async().await?;
        if dl_path.is_file() {
            debug!("{} was downloaded by another process", uri);
            self.set_download_utime(&dl_path);
            return Ok(dl_path);
        }

        let tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(&self.download_dir)
            .context("Failed to create temporary download file")?;

        info!("Downloading {}", uri);
        let transfer = match self.fetch(uri, tmp.path(), self.progress).await {
            Ok(transfer) => transfer,
            Err(e) if self.progress => {
                warn!("Download with progress failed ({:#}), retrying silently", e);
                self.fetch(uri, tmp.path(), false).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(expected) = transfer.content_length
            && expected != transfer.bytes
        {
            return Err(Error::package(format!(
                "The size ({} bytes) of downloaded file '{}' is not equal to remote size ({} bytes)",
                transfer.bytes, uri, expected
            ))
            .into());
        }
        if let Some(checksum) = checksum {
            verify_checksum(tmp.path(), checksum)?;
        }

        tmp.persist(&dl_path)
            .with_context(|| format!("Failed to move download into {:?}", dl_path))?;
        debug!("Cached {} at {:?}", uri, dl_path);
        self.set_download_utime(&dl_path);
        Ok(dl_path)
    }

    async fn fetch(&self, uri: &str, dest: &Path, with_progress: bool) -> Result<crate::http::Transfer> {
        let bar = with_progress.then(|| {
            let bar = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::with_template(
                "Downloading [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            ) {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        });
        let dest = dest.to_path_buf();
        let result = self
            .http
            .download_file(
                uri,
                || {
                    let file = File::create(&dest)
                        .with_context(|| format!("Failed to open {:?}", dest))?;
                    Ok(BufWriter::new(file))
                },
                bar.as_ref(),
            )
            .await;
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        result
    }

    fn set_download_utime(&self, path: &Path) {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return;
        };
        if let Err(e) = UsageStore::new(&self.download_dir).touch(&name, now()) {
            warn!("Could not record download usage for {:?}: {:#}", path, e);
        }
    }

    /// Evict blobs unused for [`DOWNLOAD_CACHE_EXPIRE`]; no-op when a sweep ran
    /// within [`DOWNLOAD_CACHE_SWEEP_INTERVAL`].
    pub fn cleanup_expired_downloads(&self) -> Result<Vec<PathBuf>> {
        if !self.download_dir.is_dir() {
            return Ok(Vec::new());
        }
        UsageStore::new(&self.download_dir).sweep(
            DOWNLOAD_CACHE_EXPIRE,
            DOWNLOAD_CACHE_SWEEP_INTERVAL,
            now(),
        )
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

fn checksum_algorithm(checksum: &str) -> Result<ChecksumAlgorithm> {
    let algorithm = match checksum.len() {
        32 => Some(ChecksumAlgorithm::Md5),
        40 => Some(ChecksumAlgorithm::Sha1),
        64 => Some(ChecksumAlgorithm::Sha256),
        _ => None,
    };
    match algorithm {
        Some(algorithm) if checksum.bytes().all(|b| b.is_ascii_hexdigit()) => Ok(algorithm),
        _ => Err(Error::package(format!(
            "Could not determine checksum algorithm by {}",
            checksum
        ))
        .into()),
    }
}

/// Compare the digest of `path` against `expected` (case-insensitive hex).
///
/// The algorithm follows from the length of `expected`: md5, sha1 or sha256.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = match checksum_algorithm(expected)? {
        ChecksumAlgorithm::Md5 => file_digest::<Md5>(path)?,
        ChecksumAlgorithm::Sha1 => file_digest::<Sha1>(path)?,
        ChecksumAlgorithm::Sha256 => file_digest::<Sha256>(path)?,
    };
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::package(format!(
            "The checksum '{}' of the downloaded file '{}' does not match to the remote '{}'",
            actual,
            path.display(),
            expected
        ))
        .into());
    }
    Ok(())
}

pub fn file_sha256(path: &Path) -> Result<String> {
    file_digest::<Sha256>(path)
}

fn file_digest<D: Digest>(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).context("Failed to read file for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use reqwest::Client;
    use tempfile::tempdir;

    const BODY: &str = "test content";

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn downloader(dir: &Path) -> Downloader {
        Downloader::new(HttpClient::new(Client::new()), dir.join("downloads"))
    }

    #[test]
    fn test_compute_download_path_is_content_addressed() {
        let dir = tempdir().unwrap();
        let dl = downloader(dir.path());

        let a = dl.compute_download_path("http://host/a.tar.gz", None);
        let b = dl.compute_download_path("http://host/a.tar.gz", Some("ff"));
        assert_ne!(a, b);
        assert_eq!(a, dl.compute_download_path("http://host/a.tar.gz", None));
        assert_eq!(a.parent(), Some(dir.path().join("downloads").as_path()));
        assert_eq!(a.file_name().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_download_reuses_cache() {
        // --- Setup ---
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/pkg.tar.gz")
            .with_status(200)
            .with_body(BODY)
            .expect(1)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let dl = downloader(dir.path());
        let url = format!("{}/pkg.tar.gz", server.url());
        let checksum = sha256_hex(BODY.as_bytes());

        // --- Execute ---
        let first = dl.download(&url, Some(&checksum)).await.unwrap();
        let second = dl.download(&url, Some(&checksum)).await.unwrap();

        // --- Verify ---
        mock.assert_async().await;
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&first).unwrap(), BODY);
        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(
            UsageStore::new(dl.download_dir())
                .last_used(&name)
                .unwrap()
                .is_some()
        );
        assert!(!Path::new(&format!("{}.lock", first.display())).exists());
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/pkg.tar.gz")
            .with_status(200)
            .with_body(BODY)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let dl = downloader(dir.path());
        let url = format!("{}/pkg.tar.gz", server.url());
        let wrong = sha256_hex(b"other");

        let err = dl.download(&url, Some(&wrong)).await.unwrap_err();

        assert!(matches!(classify(&err), Some(Error::Package(msg)) if msg.contains("checksum")));
        assert!(!dl.compute_download_path(&url, Some(&wrong)).exists());
        let leftovers: Vec<_> = fs::read_dir(dl.download_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_download_rejects_unknown_checksum_algorithm() {
        let dir = tempdir().unwrap();
        let dl = downloader(dir.path());

        let err = dl
            .download("http://127.0.0.1:9/pkg.tar.gz", Some("abc123"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not determine checksum algorithm"));
    }

    #[tokio::test]
    async fn test_download_without_checksum() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.zip")
            .with_status(200)
            .with_body(BODY)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let dl = downloader(dir.path());

        let path = dl
            .download(&format!("{}/file.zip", server.url()), None)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), BODY);
    }

    #[test]
    fn test_verify_checksum_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, BODY).unwrap();

        verify_checksum(&path, &sha256_hex(BODY.as_bytes()).to_uppercase()).unwrap();
    }

    #[test]
    fn test_verify_checksum_md5() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, BODY).unwrap();
        let md5 = hex::encode(Md5::digest(BODY.as_bytes()));
        assert_eq!(md5.len(), 32);

        verify_checksum(&path, &md5).unwrap();
        let err = verify_checksum(&path, &hex::encode(Md5::digest(b"other"))).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_verify_checksum_sha1() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, BODY).unwrap();
        let sha1 = hex::encode(Sha1::digest(BODY.as_bytes()));
        assert_eq!(sha1.len(), 40);

        verify_checksum(&path, &sha1).unwrap();
        let err = verify_checksum(&path, &hex::encode(Sha1::digest(b"other"))).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_verify_checksum_rejects_unknown_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, BODY).unwrap();

        let sha256 = sha256_hex(BODY.as_bytes());
        for bad in [&sha256[..48], &sha256[..31], "zz".repeat(16).as_str()] {
            let err = verify_checksum(&path, bad).unwrap_err();
            assert!(matches!(classify(&err), Some(Error::Package(_))));
            assert!(err.to_string().contains("Could not determine checksum algorithm"));
        }
    }

    #[test]
    fn test_cleanup_expired_downloads_without_cache_dir() {
        let dir = tempdir().unwrap();
        let dl = downloader(dir.path());
        assert!(dl.cleanup_expired_downloads().unwrap().is_empty());
    }
}
