//! Cross-process exclusive lock scoped to a filesystem path.
//!
//! Locking `/root/packages` creates `/root/packages.lock`. On Unix the lock is
//! an `flock(2)` on that file; elsewhere the file's existence is the lock and
//! a lock file older than [`STALE_LOCK_AGE`] is considered abandoned.

use anyhow::{Context, Result};
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::Error;

pub const LOCKFILE_TIMEOUT: Duration = Duration::from_secs(3600);
pub const LOCKFILE_DELAY: Duration = Duration::from_millis(200);
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

#[cfg(unix)]
type Handle = nix::fcntl::Flock<File>;
#[cfg(not(unix))]
type Handle = File;

pub struct LockFile {
    lock_path: PathBuf,
    timeout: Duration,
    delay: Duration,
    handle: Option<Handle>,
}

impl LockFile {
    pub fn new(path: &Path) -> Self {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
            timeout: LOCKFILE_TIMEOUT,
            delay: LOCKFILE_DELAY,
            handle: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration, delay: Duration) -> Self {
        self.timeout = timeout;
        self.delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_locked(&self) -> bool {
        self.handle.is_some()
    }

    /// Block the current thread until the lock is held.
    pub fn acquire(mut self) -> Result<Self> {
        let started = Instant::now();
        while !self.try_lock()? {
            if started.elapsed() >= self.timeout {
                return Err(Error::LockTimeout(self.lock_path.clone()).into());
            }
            std::thread::sleep(self.delay);
        }
        Ok(self)
    }

    /// Wait for the lock without blocking the async runtime.
    pub async fn acquire_async(mut self) -> Result<Self> {
        let started = Instant::now();
        while !self.try_lock()? {
            if started.elapsed() >= self.timeout {
                return Err(Error::LockTimeout(self.lock_path.clone()).into());
            }
            tokio::time::sleep(self.delay).await;
        }
        Ok(self)
    }

    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Unlink while still holding the lock so no waiter can lock a dead inode
            if let Err(e) = fs::remove_file(&self.lock_path) {
                debug!("Could not remove lock file {:?}: {}", self.lock_path, e);
            }
            drop(handle);
            debug!("Released lock {:?}", self.lock_path);
        }
    }

    #[cfg(unix)]
    fn try_lock(&mut self) -> Result<bool> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};
        use std::os::unix::fs::MetadataExt;

        if self.handle.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).context("Failed to create lock directory")?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file {:?}", self.lock_path))?;

        let flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(false),
            Err((_, errno)) => {
                return Err(anyhow::Error::from(errno)
                    .context(format!("Failed to lock {:?}", self.lock_path)));
            }
        };

        // The previous holder may have unlinked the file between our open and lock
        let held = flock.metadata().context("Failed to stat lock file")?;
        match fs::metadata(&self.lock_path) {
            Ok(current) if current.ino() == held.ino() && current.dev() == held.dev() => {
                debug!("Acquired lock {:?}", self.lock_path);
                self.handle = Some(flock);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[cfg(not(unix))]
    fn try_lock(&mut self) -> Result<bool> {
        if self.handle.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).context("Failed to create lock directory")?;
        }
        if is_stale(&self.lock_path, STALE_LOCK_AGE) {
            log::warn!("Removing stale lock file {:?}", self.lock_path);
            let _ = fs::remove_file(&self.lock_path);
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => {
                debug!("Acquired lock {:?}", self.lock_path);
                self.handle = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("Failed to create lock file {:?}", self.lock_path))),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether a lock file exists and has not been touched for longer than `max_age`.
pub fn is_stale(path: &Path, max_age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > max_age)
}
