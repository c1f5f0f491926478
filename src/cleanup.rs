use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Temp files and staging directories to remove if the process is interrupted.
#[derive(Debug, Default)]
pub struct CleanupContext {
    paths: Vec<PathBuf>,
}

impl CleanupContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn remove(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Remove every registered path, newest first, and forget them.
    pub fn cleanup(&mut self) {
        for path in self.paths.drain(..).rev() {
            debug!("Cleaning up {:?}", path);
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Could not remove {:?}: {}", path, e);
            }
        }
    }
}

pub type SharedCleanupContext = Arc<Mutex<CleanupContext>>;

pub fn new_shared() -> SharedCleanupContext {
    Arc::new(Mutex::new(CleanupContext::new()))
}

/// Remove everything registered in `ctx`. Used by the interrupt handler.
pub fn run(ctx: &SharedCleanupContext) {
    match ctx.lock() {
        Ok(mut guard) => guard.cleanup(),
        Err(poisoned) => poisoned.into_inner().cleanup(),
    }
}

/// Keeps a path registered for interrupt cleanup until [`CleanupGuard::success`]
/// or until the guard is dropped after the owner removed the path itself.
pub struct CleanupGuard {
    ctx: SharedCleanupContext,
    path: PathBuf,
}

impl CleanupGuard {
    pub fn new(ctx: SharedCleanupContext, path: PathBuf) -> Self {
        if let Ok(mut guard) = ctx.lock() {
            guard.add(path.clone());
        }
        Self { ctx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path was promoted or consumed; stop tracking it.
    pub fn success(self) {
        // Drop does the unregistering
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.ctx.lock() {
            guard.remove(&self.path);
        }
    }
}
