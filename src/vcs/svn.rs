use anyhow::Result;
use std::path::PathBuf;

use super::{CommandRunner, VcsClient, VcsKind};
use crate::error::Error;

pub struct SvnClient {
    runner: CommandRunner,
    remote_url: String,
    tag: Option<String>,
}

impl SvnClient {
    pub fn new(src_dir: PathBuf, remote_url: String, tag: Option<String>) -> Self {
        Self {
            runner: CommandRunner::new(VcsKind::Svn, src_dir),
            remote_url,
            tag,
        }
    }

    fn info_revision(&self, extra: &[&str]) -> Result<String> {
        let mut args = vec!["info", "--non-interactive", "--trust-server-cert"];
        args.extend_from_slice(extra);
        let output = self.runner.output(&args)?;
        parse_revision(&output)
            .ok_or_else(|| Error::vcs("Could not detect current SVN revision").into())
    }
}

fn parse_revision(info: &str) -> Option<String> {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("Revision:"))
        .map(|rev| rev.trim().to_string())
        .next()
}

impl VcsClient for SvnClient {
    fn kind(&self) -> VcsKind {
        VcsKind::Svn
    }

    fn export(&self) -> Result<()> {
        let src_dir = self.runner.src_dir().to_string_lossy().to_string();
        let mut args = vec!["checkout"];
        if let Some(tag) = &self.tag {
            args.extend(["--revision", tag.as_str()]);
        }
        args.extend([self.remote_url.as_str(), src_dir.as_str()]);
        self.runner.run(&args, self.runner.src_dir().parent())
    }

    fn update(&self) -> Result<()> {
        self.runner.run(&["update"], None)
    }

    fn can_be_updated(&self) -> bool {
        self.tag.is_none()
    }

    fn current_revision(&self) -> Result<String> {
        self.info_revision(&[])
    }

    fn latest_revision(&self) -> Result<Option<String>> {
        if !self.can_be_updated() {
            return self.current_revision().map(Some);
        }
        self.info_revision(&["-r", "HEAD", &self.remote_url]).map(Some)
    }
}
