use anyhow::Result;
use std::path::PathBuf;

use super::{CommandRunner, VcsClient, VcsKind, is_commit_id};

pub struct GitClient {
    runner: CommandRunner,
    remote_url: String,
    tag: Option<String>,
}

impl GitClient {
    pub fn new(src_dir: PathBuf, remote_url: String, tag: Option<String>) -> Self {
        Self {
            runner: CommandRunner::new(VcsKind::Git, src_dir),
            remote_url,
            tag,
        }
    }

    fn pinned_commit(&self) -> Option<&str> {
        self.tag.as_deref().filter(|tag| is_commit_id(tag))
    }

    fn current_branch(&self) -> Result<Option<String>> {
        let branch = self.runner.output(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok((!branch.is_empty() && branch != "HEAD").then_some(branch))
    }
}

impl VcsClient for GitClient {
    fn kind(&self) -> VcsKind {
        VcsKind::Git
    }

    fn export(&self) -> Result<()> {
        let src_dir = self.runner.src_dir().to_string_lossy().to_string();
        let parent = self.runner.src_dir().parent();
        let mut args = vec!["clone", "--recursive"];
        if self.pinned_commit().is_none() {
            args.extend(["--depth", "1"]);
            if let Some(tag) = &self.tag {
                args.extend(["--branch", tag.as_str()]);
            }
        }
        args.extend([self.remote_url.as_str(), src_dir.as_str()]);
        self.runner.run(&args, parent)?;

        if let Some(commit) = self.pinned_commit() {
            self.runner.run(&["reset", "--hard", commit], None)?;
            self.runner
                .run(&["submodule", "update", "--init", "--recursive", "--force"], None)?;
        }
        Ok(())
    }

    fn update(&self) -> Result<()> {
        self.runner.run(&["pull", "--recurse-submodules"], None)
    }

    fn can_be_updated(&self) -> bool {
        self.pinned_commit().is_none()
    }

    fn current_revision(&self) -> Result<String> {
        self.runner.output(&["rev-parse", "--short", "HEAD"])
    }

    fn latest_revision(&self) -> Result<Option<String>> {
        if !self.can_be_updated() {
            return self.current_revision().map(Some);
        }
        let Some(branch) = self.current_branch()? else {
            return Ok(None);
        };
        let branch_ref = format!("refs/heads/{}", branch);
        let listing = self
            .runner
            .output(&["ls-remote", &self.remote_url, &branch_ref])?;
        Ok(listing.lines().find_map(|line| {
            let (sha, reference) = line.trim().split_once('\t')?;
            (reference == branch_ref).then(|| sha.chars().take(7).collect())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command;
    use tempfile::tempdir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "fwpm")
            .env("GIT_AUTHOR_EMAIL", "fwpm@example.com")
            .env("GIT_COMMITTER_NAME", "fwpm")
            .env("GIT_COMMITTER_EMAIL", "fwpm@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {:?}", args);
    }

    #[test]
    fn test_pinned_commit_cannot_be_updated() {
        let pinned = GitClient::new("/tmp/x".into(), "https://h/r.git".into(), Some("1a2b3c4d".into()));
        assert!(!pinned.can_be_updated());

        let branch = GitClient::new("/tmp/x".into(), "https://h/r.git".into(), Some("develop".into()));
        assert!(branch.can_be_updated());

        let head = GitClient::new("/tmp/x".into(), "https://h/r.git".into(), None);
        assert!(head.can_be_updated());
    }

    #[test]
    fn test_export_and_revisions_against_local_repo() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        std::fs::create_dir(&upstream).unwrap();
        git(&upstream, &["init", "--quiet"]);
        git(&upstream, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(upstream.join("library.json"), r#"{"name": "foo"}"#).unwrap();
        git(&upstream, &["add", "."]);
        git(&upstream, &["commit", "--quiet", "-m", "init"]);

        let checkout = dir.path().join("checkout");
        let url = format!("file://{}", upstream.display());
        let client = GitClient::new(checkout.clone(), url, None);
        client.export().unwrap();

        assert!(checkout.join("library.json").is_file());
        let current = client.current_revision().unwrap();
        assert!(current.len() >= 7);
        assert_eq!(client.latest_revision().unwrap(), Some(current[..7].to_string()));

        std::fs::write(upstream.join("README"), "more").unwrap();
        git(&upstream, &["add", "."]);
        git(&upstream, &["commit", "--quiet", "-m", "second"]);

        let latest = client.latest_revision().unwrap().unwrap();
        assert_ne!(latest, current[..7]);
        client.update().unwrap();
        assert!(checkout.join("README").is_file());
    }

    #[test]
    fn test_export_failure_is_vcs_error() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let client = GitClient::new(
            dir.path().join("checkout"),
            format!("file://{}", dir.path().join("missing").display()),
            None,
        );
        let err = client.export().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::Error>(),
            Some(crate::error::Error::Vcs(_))
        ));
    }
}
