//! Runtime abstraction for system operations.
//!
//! The package manager touches the filesystem and the environment only through
//! this trait, so storage-tree logic can be exercised against a mock.
//!
//! # Structure
//!
//! - `path` - Lexical path helpers (normalize, is_path_under, expand_user)
//! - `env` - Environment variables and well-known directories
//! - `fs` - File system operations (read, write, directory trees)

mod env;
mod fs;
pub mod path;

use anyhow::Result;
use std::env as std_env;
use std::path::{Path, PathBuf};

pub use path::{is_path_under, normalize_path};

#[cfg_attr(test, mockall::automock)]
pub trait Runtime: Send + Sync {
    // Environment
    fn env_var(&self, key: &str) -> Result<String, std_env::VarError>;
    fn home_dir(&self) -> Option<PathBuf>;
    fn current_dir(&self) -> Result<PathBuf>;

    // File System
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn is_symlink(&self, path: &Path) -> bool;

    /// Directory entries sorted by file name.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Canonicalize a path by resolving all symlinks.
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Recursively copy a directory tree, recreating symlinks instead of following them.
    fn copy_dir(&self, from: &Path, to: &Path) -> Result<()>;

    /// Move a directory, falling back to copy-and-delete across filesystems.
    fn move_dir(&self, from: &Path, to: &Path) -> Result<()>;
}

pub struct RealRuntime;

impl Runtime for RealRuntime {
    fn env_var(&self, key: &str) -> Result<String, std_env::VarError> {
        self.env_var_impl(key)
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.home_dir_impl()
    }

    fn current_dir(&self) -> Result<PathBuf> {
        self.current_dir_impl()
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.write_impl(path, contents)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        self.read_to_string_impl(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.rename_impl(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.create_dir_all_impl(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.remove_file_impl(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.remove_dir_all_impl(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.exists_impl(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.is_dir_impl(path)
    }

    fn is_symlink(&self, path: &Path) -> bool {
        self.is_symlink_impl(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.read_dir_impl(path)
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        self.canonicalize_impl(path)
    }

    fn copy_dir(&self, from: &Path, to: &Path) -> Result<()> {
        self.copy_dir_impl(from, to)
    }

    fn move_dir(&self, from: &Path, to: &Path) -> Result<()> {
        self.move_dir_impl(from, to)
    }
}
