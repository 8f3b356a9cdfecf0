//! Error taxonomy for the build orchestration core.

use thiserror::Error;

use crate::events::build::TransitionError;

/// Failures surfaced by the version-control adapter.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The VCS tool ran but exited non-zero.
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The VCS tool could not be started at all.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool succeeded but its output could not be understood.
    #[error("unexpected output from `{command}`: {output}")]
    Parse { command: String, output: String },

    #[error("branch `{0}` does not exist in the remote repository")]
    UnknownBranch(String),
}

/// Failures of the persisted Project/Commit/Build state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// At most one build may exist per (configuration, commit) pair.
    #[error("configuration {configuration_id} already has a build for commit {commit_id}")]
    DuplicateBuild {
        configuration_id: i64,
        commit_id: i64,
    },

    #[error("project slug `{0}` is already taken")]
    DuplicateSlug(String),

    #[error("build {build_id}: {source}")]
    InvalidTransition {
        build_id: i64,
        #[source]
        source: TransitionError,
    },

    #[error("log storage failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Lookups in the plugin registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no builder registered under `{0}`")]
    UnknownBuilder(String),

    #[error("no build hook registered under `{0}`")]
    UnknownHook(String),

    #[error("no plugin named `{0}`")]
    UnknownPlugin(String),

    #[error("the process-wide plugin registry is already installed")]
    AlreadyInstalled,
}

/// Faults of the build runner itself, as opposed to a failing build command.
#[derive(Debug, Error)]
pub enum BuilderFault {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O failure while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("builder misconfigured: {0}")]
    Misconfigured(String),
}

/// Failures while a change-notification source resolves its branch list.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("webhook signature validation failed")]
    Unauthorized,

    #[error("malformed hook request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of a single build execution.
///
/// Expected build failures (the command exited non-zero) are not errors; they
/// are recorded as `was_successful = false` and the executor returns `Ok`.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The workspace could not be prepared.
    #[error("workspace preparation failed: {0}")]
    Vcs(#[from] VcsError),

    /// The disposable workspace could not be created.
    #[error("workspace allocation failed: {0}")]
    Workspace(#[source] std::io::Error),

    /// The builder itself broke (I/O failure, panic, missing tool).
    #[error("builder crashed: {0}")]
    Crash(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The execution queue stopped accepting jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("build queue is closed")]
pub struct QueueClosed;

/// Failures of a whole build-hook invocation.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("project `{0}` not found")]
    ProjectNotFound(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Hook(#[from] HookError),

    /// Listing remote branches failed; no branch of this invocation was dispatched.
    #[error("listing remote branches failed: {0}")]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueClosed),
}
