//! Version-control adapter.
//!
//! The orchestration core only needs four things from a VCS: clone a
//! repository into a directory it owns, list remote branch tips, check out a
//! revision, and read the checked-out changeset. `GitVcs` does this by
//! shelling out to `git`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::VcsError;

/// Identity of a checked-out revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub id: String,
    pub message: String,
}

/// A cloned repository. The caller owns the directory and its lifetime.
#[derive(Debug, Clone)]
pub struct RepoHandle {
    path: PathBuf,
}

impl RepoHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone `uri` into the existing, empty directory `dest`.
    async fn clone_repo(&self, uri: &str, dest: &Path) -> Result<RepoHandle, VcsError>;

    /// Map of branch name to tip revision, read from the remote.
    async fn remote_branches(&self, uri: &str) -> Result<BTreeMap<String, String>, VcsError>;

    /// Check out an exact revision into the working tree.
    async fn checkout(&self, repo: &RepoHandle, revision: &str) -> Result<(), VcsError>;

    /// Check out the remote tip of `branch`.
    async fn checkout_branch(&self, repo: &RepoHandle, branch: &str) -> Result<(), VcsError>;

    /// Changeset currently checked out.
    async fn changeset(&self, repo: &RepoHandle) -> Result<Changeset, VcsError>;
}

/// `Vcs` backed by the `git` command-line tool.
#[derive(Debug, Clone)]
pub struct GitVcs {
    program: String,
}

impl Default for GitVcs {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitVcs {
    pub fn new() -> Self {
        Self::default()
    }

    async fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, VcsError> {
        let command = format!("{} {}", self.program, args.join(" "));
        tracing::debug!(cwd = ?cwd, %command, "Executing VCS command");

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|source| VcsError::Spawn {
            command: command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn clone_repo(&self, uri: &str, dest: &Path) -> Result<RepoHandle, VcsError> {
        let dest_str = dest.to_string_lossy().into_owned();
        self.git(None, &["clone", "--quiet", "--no-checkout", uri, dest_str.as_str()])
            .await?;
        Ok(RepoHandle::new(dest))
    }

    async fn remote_branches(&self, uri: &str) -> Result<BTreeMap<String, String>, VcsError> {
        let stdout = self.git(None, &["ls-remote", "--heads", uri]).await?;
        parse_ls_remote(&stdout).map_err(|line| VcsError::Parse {
            command: format!("{} ls-remote --heads {uri}", self.program),
            output: line,
        })
    }

    async fn checkout(&self, repo: &RepoHandle, revision: &str) -> Result<(), VcsError> {
        self.git(
            Some(repo.path()),
            &["checkout", "--quiet", "--force", "--detach", revision],
        )
        .await?;
        Ok(())
    }

    async fn checkout_branch(&self, repo: &RepoHandle, branch: &str) -> Result<(), VcsError> {
        let remote_ref = format!("origin/{branch}");
        self.git(
            Some(repo.path()),
            &["rev-parse", "--verify", "--quiet", remote_ref.as_str()],
        )
        .await
        .map_err(|_| VcsError::UnknownBranch(branch.to_string()))?;
        self.checkout(repo, &remote_ref).await
    }

    async fn changeset(&self, repo: &RepoHandle) -> Result<Changeset, VcsError> {
        let stdout = self
            .git(Some(repo.path()), &["log", "-1", "--format=%H%n%B"])
            .await?;
        let (id, message) = stdout.split_once('\n').unwrap_or((stdout.as_str(), ""));
        let id = id.trim();
        if id.is_empty() {
            return Err(VcsError::Parse {
                command: format!("{} log -1", self.program),
                output: stdout.clone(),
            });
        }
        Ok(Changeset {
            id: id.to_string(),
            message: message.trim().to_string(),
        })
    }
}

/// Parse `git ls-remote --heads` output. Returns the offending line on error.
pub fn parse_ls_remote(stdout: &str) -> Result<BTreeMap<String, String>, String> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(sha), Some(refspec)) => {
                    let branch = refspec.strip_prefix("refs/heads/").unwrap_or(refspec);
                    Ok((branch.to_string(), sha.to_string()))
                }
                _ => Err(line.to_string()),
            }
        })
        .collect()
}
