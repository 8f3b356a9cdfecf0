//! In-memory fakes for the VCS adapter and the build queue (testing only)
//!
//! `FakeVcs` serves named repositories whose commits are plain file maps,
//! writing them into the workspace on checkout. `RecordingQueue` keeps every
//! enqueued job instead of running it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{QueueClosed, VcsError};
use crate::services::queue::{BuildJob, BuildQueue};
use crate::services::vcs::{Changeset, RepoHandle, Vcs};

// ---------------------------------------------------------------------------
// FakeVcs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeCommit {
    message: String,
    files: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct FakeRepo {
    branches: BTreeMap<String, String>,
    commits: HashMap<String, FakeCommit>,
}

#[derive(Debug, Default)]
struct VcsState {
    repos: HashMap<String, FakeRepo>,
    /// Clone destination -> repository uri.
    clones: HashMap<PathBuf, String>,
    /// Clone destination -> checked-out revision.
    heads: HashMap<PathBuf, String>,
    workspaces: Vec<PathBuf>,
    fail_listing: bool,
    counter: u64,
}

/// VCS double keyed by repository uri.
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, VcsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a commit on top of `branch` (creating repo and branch as needed)
    /// and return its revision id. `files` are written on checkout.
    pub fn push_commit(&self, uri: &str, branch: &str, message: &str, files: &[(&str, &str)]) -> String {
        let mut state = self.state();
        state.counter += 1;
        let revision = format!("{:040x}", state.counter);
        let repo = state.repos.entry(uri.to_string()).or_default();
        repo.commits.insert(
            revision.clone(),
            FakeCommit {
                message: message.to_string(),
                files: files
                    .iter()
                    .map(|(name, body)| (name.to_string(), body.to_string()))
                    .collect(),
            },
        );
        repo.branches.insert(branch.to_string(), revision.clone());
        revision
    }

    /// Make `remote_branches` fail until reset.
    pub fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    /// Every directory a repository was cloned into, in clone order.
    pub fn workspaces(&self) -> Vec<PathBuf> {
        self.state().workspaces.clone()
    }
}

fn failed(command: &str, stderr: impl ToString) -> VcsError {
    VcsError::CommandFailed {
        command: command.to_string(),
        status: "exit status: 128".to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn clone_repo(&self, uri: &str, dest: &Path) -> Result<RepoHandle, VcsError> {
        let mut state = self.state();
        if !state.repos.contains_key(uri) {
            return Err(failed("clone", format!("repository '{uri}' does not exist")));
        }
        state.clones.insert(dest.to_path_buf(), uri.to_string());
        state.workspaces.push(dest.to_path_buf());
        Ok(RepoHandle::new(dest))
    }

    async fn remote_branches(&self, uri: &str) -> Result<BTreeMap<String, String>, VcsError> {
        let state = self.state();
        if state.fail_listing {
            return Err(failed("ls-remote", "connection refused"));
        }
        state
            .repos
            .get(uri)
            .map(|repo| repo.branches.clone())
            .ok_or_else(|| failed("ls-remote", format!("repository '{uri}' does not exist")))
    }

    async fn checkout(&self, repo: &RepoHandle, revision: &str) -> Result<(), VcsError> {
        let mut state = self.state();
        let uri = state
            .clones
            .get(repo.path())
            .cloned()
            .ok_or_else(|| failed("checkout", "not a repository"))?;
        let commit = state
            .repos
            .get(&uri)
            .and_then(|r| r.commits.get(revision))
            .cloned()
            .ok_or_else(|| failed("checkout", format!("reference is not a tree: {revision}")))?;
        for (name, body) in &commit.files {
            std::fs::write(repo.path().join(name), body).map_err(|e| failed("checkout", e))?;
        }
        state.heads.insert(repo.path().to_path_buf(), revision.to_string());
        Ok(())
    }

    async fn checkout_branch(&self, repo: &RepoHandle, branch: &str) -> Result<(), VcsError> {
        let tip = {
            let state = self.state();
            state
                .clones
                .get(repo.path())
                .and_then(|uri| state.repos.get(uri))
                .and_then(|r| r.branches.get(branch))
                .cloned()
        };
        match tip {
            Some(revision) => self.checkout(repo, &revision).await,
            None => Err(VcsError::UnknownBranch(branch.to_string())),
        }
    }

    async fn changeset(&self, repo: &RepoHandle) -> Result<Changeset, VcsError> {
        let state = self.state();
        let revision = state
            .heads
            .get(repo.path())
            .ok_or_else(|| failed("log", "nothing checked out"))?;
        let message = state
            .clones
            .get(repo.path())
            .and_then(|uri| state.repos.get(uri))
            .and_then(|r| r.commits.get(revision))
            .map(|c| c.message.clone())
            .unwrap_or_default();
        Ok(Changeset {
            id: revision.clone(),
            message,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingQueue
// ---------------------------------------------------------------------------

/// Queue that records jobs without running them.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<BuildJob>>,
    closed: Mutex<bool>,
    rejections: Mutex<usize>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<BuildJob> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reject every later `enqueue`.
    pub fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Reject only the next `count` enqueues.
    pub fn reject_next(&self, count: usize) {
        *self.rejections.lock().unwrap_or_else(PoisonError::into_inner) = count;
    }
}

impl BuildQueue for RecordingQueue {
    fn enqueue(&self, job: BuildJob) -> Result<(), QueueClosed> {
        if *self.closed.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(QueueClosed);
        }
        let mut rejections = self.rejections.lock().unwrap_or_else(PoisonError::into_inner);
        if *rejections > 0 {
            *rejections -= 1;
            return Err(QueueClosed);
        }
        drop(rejections);
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).push(job);
        Ok(())
    }
}
