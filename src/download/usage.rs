//! Last-use timestamps for cached downloads.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::lockfile::LockFile;

pub const USAGE_FILE_NAME: &str = "usage.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageData {
    #[serde(default)]
    last_sweep: i64,
    #[serde(default)]
    entries: BTreeMap<String, i64>,
}

/// JSON map of cache file name to the epoch second it was last used.
/// Every read-modify-write happens under a [`LockFile`] on the store.
pub struct UsageStore {
    path: PathBuf,
}

impl UsageStore {
    pub fn new(download_dir: &Path) -> Self {
        Self {
            path: download_dir.join(USAGE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn touch(&self, file_name: &str, now: i64) -> Result<()> {
        self.modify(|data| {
            data.entries.insert(file_name.to_string(), now);
        })
    }

    pub fn last_used(&self, file_name: &str) -> Result<Option<i64>> {
        Ok(self.load()?.entries.get(file_name).copied())
    }

    /// Delete blobs untouched for `max_age` seconds. Runs at most once per
    /// `interval` seconds; returns the removed paths.
    pub fn sweep(&self, max_age: i64, interval: i64, now: i64) -> Result<Vec<PathBuf>> {
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut removed = Vec::new();
        self.modify(|data| {
            if now - data.last_sweep < interval {
                debug!("Download cache was swept recently, skipping");
                return;
            }
            data.last_sweep = now;
            data.entries.retain(|file_name, used| {
                if *used > now - max_age {
                    return true;
                }
                let blob = dir.join(file_name);
                if blob.is_file() {
                    match fs::remove_file(&blob) {
                        Ok(()) => removed.push(blob),
                        Err(e) => debug!("Could not remove expired download {:?}: {}", blob, e),
                    }
                }
                false
            });
        })?;
        if !removed.is_empty() {
            info!("Removed {} expired download(s)", removed.len());
        }
        Ok(removed)
    }

    fn load(&self) -> Result<UsageData> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
                debug!("Resetting unreadable usage store {:?}: {}", self.path, e);
                UsageData::default()
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UsageData::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", self.path)),
        }
    }

    fn modify<F: FnOnce(&mut UsageData)>(&self, f: F) -> Result<()> {
        let _lock = LockFile::new(&self.path).acquire()?;
        let mut data = self.load()?;
        f(&mut data);
        let json = serde_json::to_string_pretty(&data)?;
        fs::write(&self.path, json).with_context(|| format!("Failed to write {:?}", self.path))
    }
}
