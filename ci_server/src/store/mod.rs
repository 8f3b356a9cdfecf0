//! Persisted CI state.
//!
//! `BuildStore` holds the Project/Configuration/Commit/Build records and
//! `LogStore` the per-build stdout/stderr blobs. Every method is one atomic
//! unit against the backend; `finish_build` couples the finishing write with
//! the commit verdict recomputation.

pub mod logs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::events::build::BuildEvent;
use crate::models::build::Build;
use crate::models::build_configuration::{BuildConfiguration, NewBuildConfiguration};
use crate::models::commit::{Commit, NewCommit};
use crate::models::project::{NewProject, Project};

pub use logs::{FsLogStore, LogStore, LogStream, MemoryLogStore};
pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a verdict recomputation.
#[derive(Debug, Clone)]
pub struct VerdictUpdate {
    pub commit: Commit,
    /// True only for the call that moved the commit to a terminal verdict.
    pub transitioned: bool,
}

/// Result of recording a build's final outcome.
#[derive(Debug, Clone)]
pub struct FinishedBuild {
    pub build: Build,
    pub verdict: VerdictUpdate,
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    // Projects

    async fn insert_project(&self, new_project: NewProject) -> StoreResult<Project>;

    async fn get_project(&self, project_id: i64) -> StoreResult<Project>;

    async fn find_project_by_slug(&self, slug: &str) -> StoreResult<Option<Project>>;

    async fn list_projects(&self) -> StoreResult<Vec<Project>>;

    /// Delete a project together with its configurations, commits and builds.
    async fn delete_project(&self, project_id: i64) -> StoreResult<()>;

    // Configurations

    async fn insert_configuration(
        &self,
        project_id: i64,
        new_configuration: NewBuildConfiguration,
    ) -> StoreResult<BuildConfiguration>;

    async fn get_configuration(&self, configuration_id: i64) -> StoreResult<BuildConfiguration>;

    async fn configurations_for(&self, project_id: i64) -> StoreResult<Vec<BuildConfiguration>>;

    // Commits

    async fn insert_commit(&self, new_commit: NewCommit) -> StoreResult<Commit>;

    async fn get_commit(&self, commit_id: i64) -> StoreResult<Commit>;

    /// Look up the commit for `(branch, vcs_id)` and insert it if absent, as
    /// one unit. The flag is true when this call created the commit. A commit
    /// without a revision is always inserted.
    async fn find_or_insert_commit(&self, new_commit: NewCommit) -> StoreResult<(Commit, bool)>;

    /// Most recently created commit on a branch whose revision is known.
    async fn latest_commit_for_branch(
        &self,
        project_id: i64,
        branch: &str,
    ) -> StoreResult<Option<Commit>>;

    /// All commits of a project, newest first.
    async fn commits_for_project(&self, project_id: i64) -> StoreResult<Vec<Commit>>;

    /// Back-fill the revision (if unresolved) and short message (if empty).
    async fn update_changeset(
        &self,
        commit_id: i64,
        vcs_id: &str,
        short_message: &str,
    ) -> StoreResult<Commit>;

    /// Delete the commit if no build refers to it. Returns whether it was deleted.
    async fn delete_commit_if_empty(&self, commit_id: i64) -> StoreResult<bool>;

    // Builds

    /// Insert a pending build. Fails with `StoreError::DuplicateBuild` when the
    /// (configuration, commit) pair already has one.
    async fn insert_build(&self, commit_id: i64, configuration_id: i64) -> StoreResult<Build>;

    async fn get_build(&self, build_id: i64) -> StoreResult<Build>;

    /// Remove a build that never started and recompute its commit's verdict.
    /// Fails with `StoreError::InvalidTransition` once the build has started.
    async fn delete_pending_build(&self, build_id: i64) -> StoreResult<VerdictUpdate>;

    async fn builds_for_commit(&self, commit_id: i64) -> StoreResult<Vec<Build>>;

    async fn builds_for_project(&self, project_id: i64) -> StoreResult<Vec<Build>>;

    async fn apply_build_event(&self, build_id: i64, event: BuildEvent) -> StoreResult<Build>;

    /// Mark a build finished and recompute its commit's verdict in one unit.
    async fn finish_build(
        &self,
        build_id: i64,
        at: DateTime<Utc>,
        successful: bool,
    ) -> StoreResult<FinishedBuild>;

    /// Idempotent: an unfinished set is a no-op, a finished set always yields
    /// the same verdict.
    async fn recompute_verdict(&self, commit_id: i64) -> StoreResult<VerdictUpdate>;
}
