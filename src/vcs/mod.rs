//! Version-control checkouts used as package sources.
//!
//! Sources look like `git+https://host/repo.git#v1.0`: the scheme prefix picks
//! the tool and an optional `#fragment` pins a branch, tag or revision.

mod git;
mod hg;
mod svn;

use anyhow::Result;
use log::debug;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::Error;

pub use git::GitClient;
pub use hg::HgClient;
pub use svn::SvnClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsKind {
    Git,
    Hg,
    Svn,
}

impl VcsKind {
    pub fn command(&self) -> &'static str {
        match self {
            VcsKind::Git => "git",
            VcsKind::Hg => "hg",
            VcsKind::Svn => "svn",
        }
    }
}

impl fmt::Display for VcsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// A checkout of one remote into one local directory.
#[cfg_attr(test, mockall::automock)]
pub trait VcsClient: Send + Sync {
    fn kind(&self) -> VcsKind;

    /// Clone or check out the remote into the source directory.
    fn export(&self) -> Result<()>;

    /// Pull the latest changes of the tracked branch.
    fn update(&self) -> Result<()>;

    /// False once pinned to an exact revision.
    fn can_be_updated(&self) -> bool;

    fn current_revision(&self) -> Result<String>;

    /// Newest revision available upstream; pinned checkouts report their own.
    fn latest_revision(&self) -> Result<Option<String>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait VcsFactory: Send + Sync {
    fn new_client(&self, src_dir: &Path, remote_url: &str) -> Result<Box<dyn VcsClient>>;
}

/// Creates clients that shell out to the installed `git`, `hg` and `svn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandVcsFactory;

impl VcsFactory for CommandVcsFactory {
    fn new_client(&self, src_dir: &Path, remote_url: &str) -> Result<Box<dyn VcsClient>> {
        let remote = VcsRemote::parse(remote_url)?;
        let src_dir = src_dir.to_path_buf();
        Ok(match remote.kind {
            VcsKind::Git => Box::new(GitClient::new(src_dir, remote.url, remote.tag)),
            VcsKind::Hg => Box::new(HgClient::new(src_dir, remote.url, remote.tag)),
            VcsKind::Svn => Box::new(SvnClient::new(src_dir, remote.url, remote.tag)),
        })
    }
}

/// A parsed `<kind>+<url>[#tag]` source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsRemote {
    pub kind: VcsKind,
    pub url: String,
    pub tag: Option<String>,
}

impl VcsRemote {
    pub fn parse(remote_url: &str) -> Result<Self> {
        let unknown = || Error::vcs(format!("Unknown repository type {}", remote_url));
        let (prefix, rest) = remote_url.split_once('+').ok_or_else(unknown)?;
        if prefix.contains([':', '/']) {
            return Err(unknown().into());
        }
        let kind = match prefix {
            "git" => VcsKind::Git,
            "hg" => VcsKind::Hg,
            "svn" => VcsKind::Svn,
            _ => return Err(unknown().into()),
        };
        let (url, tag) = match rest.rsplit_once('#') {
            Some((url, tag)) if !tag.is_empty() => (url.to_string(), Some(tag.to_string())),
            Some((url, _)) => (url.to_string(), None),
            None => (rest.to_string(), None),
        };
        Ok(Self { kind, url, tag })
    }

    pub fn is_vcs_uri(uri: &str) -> bool {
        Self::parse(uri).is_ok()
    }
}

/// Abbreviated or full hex commit hash.
pub fn is_commit_id(text: &str) -> bool {
    text.len() >= 7 && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Runs one VCS tool against one working directory.
pub(crate) struct CommandRunner {
    kind: VcsKind,
    cwd: PathBuf,
}

impl CommandRunner {
    pub(crate) fn new(kind: VcsKind, cwd: PathBuf) -> Self {
        Self { kind, cwd }
    }

    pub(crate) fn src_dir(&self) -> &Path {
        &self.cwd
    }

    /// Run with inherited output; `cwd` overrides the working directory.
    pub(crate) fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<()> {
        let cwd = cwd.unwrap_or(&self.cwd);
        debug!("Running {} {:?} in {:?}", self.kind, args, cwd);
        let status = Command::new(self.kind.command())
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| self.spawn_error(e))?;
        if !status.success() {
            return Err(Error::vcs(format!(
                "Could not process command {} {}",
                self.kind,
                args.join(" ")
            ))
            .into());
        }
        Ok(())
    }

    /// Run and return trimmed stdout.
    pub(crate) fn output(&self, args: &[&str]) -> Result<String> {
        debug!("Reading {} {:?} in {:?}", self.kind, args, self.cwd);
        let output = Command::new(self.kind.command())
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(Error::vcs(format!(
                "Could not receive an output from `{} {}` command ({})",
                self.kind,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spawn_error(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::vcs(format!("`{}` client is not installed in your system", self.kind)).into()
        } else {
            anyhow::Error::from(e).context(format!("Failed to run {}", self.kind))
        }
    }
}
