//! The handful of git operations the grader needs: clone, update, look up the
//! remote, and commit-and-push a file.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use itertools::Itertools;

use crate::{
    config,
    constants::{DEFAULT_REPO_URL, PUBLISH_AUTHOR_EMAIL, PUBLISH_AUTHOR_NAME},
    error::GitError,
    process::Invocation,
    util,
};

/// Expands an `owner/name` shorthand into a clone URL; anything that already
/// looks like a URL or a path is returned as is.
pub fn resolve_repo_url(locator: &str) -> String {
    let locator = locator.trim();
    let looks_like_shorthand = !locator.contains("://")
        && !locator.contains('@')
        && !locator.starts_with('.')
        && !locator.starts_with('/')
        && locator.split('/').count() == 2
        && locator.split('/').all(|part| !part.is_empty());

    if looks_like_shorthand {
        DEFAULT_REPO_URL.replace("{}", locator)
    } else {
        locator.to_string()
    }
}

/// Name of a repository, eg. `TPAutoCorrect` for
/// `https://github.com/JeremieGince/TPAutoCorrect.git`.
pub fn repo_name(url: &str) -> String {
    let last = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(url);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

/// A local git working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    /// Root of the working tree.
    dir: PathBuf,
}

impl GitRepo {
    /// Wraps an existing working tree (or any directory inside one).
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Clones `url` at `branch` into `dest`.
    pub async fn clone_from(url: &str, dest: &Path, branch: &str) -> Result<Self> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }
        let args: Vec<OsString> = vec![
            "clone".into(),
            "--branch".into(),
            branch.into(),
            url.into(),
            dest.as_os_str().to_os_string(),
        ];
        run_git(&args, dest.parent()).await?;
        Ok(Self::open(dest))
    }

    /// The working tree containing `dir`, found with
    /// `git rev-parse --show-toplevel`.
    pub async fn discover(dir: &Path) -> Result<Self> {
        let top = run_git(&[OsString::from("rev-parse"), "--show-toplevel".into()], Some(dir))
            .await
            .with_context(|| format!("{} is not inside a git working tree", dir.display()))?;
        Ok(Self::open(top.trim()))
    }

    /// Root of the working tree.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs git in this working tree and returns its stdout.
    async fn git(&self, args: &[&str]) -> Result<String> {
        let args: Vec<OsString> = args.iter().map(OsString::from).collect();
        run_git(&args, Some(&self.dir)).await
    }

    /// Switches to `branch`.
    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", branch]).await.map(|_| ())
    }

    /// Fetches and merges the upstream of the current branch.
    pub async fn pull(&self) -> Result<()> {
        self.git(&["pull"]).await.map(|_| ())
    }

    /// URL of the `origin` remote.
    pub async fn remote_url(&self) -> Result<String> {
        let url = self
            .git(&["remote", "get-url", "origin"])
            .await
            .map_err(|_| GitError::NoRemote(self.dir.clone()))?;
        let url = url.trim();
        if url.is_empty() {
            return Err(GitError::NoRemote(self.dir.clone()).into());
        }
        Ok(url.to_string())
    }

    /// Stages `path` (relative to the working tree).
    pub async fn add(&self, path: &Path) -> Result<()> {
        let args = [OsString::from("add"), path.as_os_str().to_os_string()];
        run_git(&args, Some(&self.dir)).await.map(|_| ())
    }

    /// Commits staged changes. Returns `false` when there was nothing to
    /// commit.
    pub async fn commit(&self, message: &str) -> Result<bool> {
        let staged = self.git(&["diff", "--cached", "--name-only"]).await?;
        if staged.trim().is_empty() {
            return Ok(false);
        }
        if self.has_identity().await {
            self.git(&["commit", "-m", message]).await?;
        } else {
            tracing::debug!("No git identity configured, committing as {PUBLISH_AUTHOR_NAME}.");
            let name = format!("user.name={PUBLISH_AUTHOR_NAME}");
            let email = format!("user.email={PUBLISH_AUTHOR_EMAIL}");
            self.git(&["-c", name.as_str(), "-c", email.as_str(), "commit", "-m", message])
                .await?;
        }
        Ok(true)
    }

    /// Whether git knows who commits here.
    async fn has_identity(&self) -> bool {
        for key in ["user.name", "user.email"] {
            match self.git(&["config", key]).await {
                Ok(value) if !value.trim().is_empty() => {}
                _ => return false,
            }
        }
        true
    }

    /// Pushes `branch` to `origin`.
    pub async fn push(&self, branch: &str) -> Result<()> {
        self.git(&["push", "origin", branch]).await.map(|_| ())
    }
}

/// Runs git with `args` in `cwd`, failing with [`GitError::CommandFailed`] on
/// a non-zero exit.
async fn run_git(args: &[OsString], cwd: Option<&Path>) -> Result<String> {
    let mut invocation =
        Invocation::new(util::git_path()?, args.to_vec()).with_deadline(config::git_timeout());
    if let Some(dir) = cwd {
        invocation = invocation.in_dir(dir);
    }

    let collected = invocation.run().await?;
    if !collected.success() {
        let args = args.iter().map(|a| a.to_string_lossy()).join(" ");
        return Err(GitError::CommandFailed {
            args,
            stderr: collected.stderr_lossy().trim().to_string(),
        }
        .into());
    }
    Ok(collected.stdout_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_expands_to_github_url() {
        assert_eq!(
            resolve_repo_url("JeremieGince/TPAutoCorrect"),
            "https://github.com/JeremieGince/TPAutoCorrect.git"
        );
    }

    #[test]
    fn full_urls_and_paths_are_untouched() {
        for locator in [
            "https://github.com/a/b.git",
            "git@github.com:a/b.git",
            "/srv/git/b.git",
            "./b",
        ] {
            assert_eq!(resolve_repo_url(locator), locator);
        }
    }

    #[test]
    fn repo_name_strips_git_suffix() {
        assert_eq!(repo_name("https://github.com/a/TPAutoCorrect.git"), "TPAutoCorrect");
        assert_eq!(repo_name("git@github.com:a/b.git"), "b");
        assert_eq!(repo_name("/srv/git/plain/"), "plain");
    }
}
