use anyhow::Result;
use std::path::PathBuf;

use super::{CommandRunner, VcsClient, VcsKind};

/// Mercurial checkout; any `#fragment` pins the revision.
pub struct HgClient {
    runner: CommandRunner,
    remote_url: String,
    tag: Option<String>,
}

impl HgClient {
    pub fn new(src_dir: PathBuf, remote_url: String, tag: Option<String>) -> Self {
        Self {
            runner: CommandRunner::new(VcsKind::Hg, src_dir),
            remote_url,
            tag,
        }
    }
}

impl VcsClient for HgClient {
    fn kind(&self) -> VcsKind {
        VcsKind::Hg
    }

    fn export(&self) -> Result<()> {
        let src_dir = self.runner.src_dir().to_string_lossy().to_string();
        let mut args = vec!["clone"];
        if let Some(tag) = &self.tag {
            args.extend(["--updaterev", tag.as_str()]);
        }
        args.extend([self.remote_url.as_str(), src_dir.as_str()]);
        self.runner.run(&args, self.runner.src_dir().parent())
    }

    fn update(&self) -> Result<()> {
        self.runner.run(&["pull", "--update"], None)
    }

    fn can_be_updated(&self) -> bool {
        self.tag.is_none()
    }

    fn current_revision(&self) -> Result<String> {
        self.runner.output(&["identify", "--id"])
    }

    fn latest_revision(&self) -> Result<Option<String>> {
        if !self.can_be_updated() {
            return self.current_revision().map(Some);
        }
        let id = self.runner.output(&["identify", "--id", &self.remote_url])?;
        Ok((!id.is_empty()).then_some(id))
    }
}
