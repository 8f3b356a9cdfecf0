//! Build executor: runs one queued build in a disposable workspace.
//!
//! Records the start, clones and checks out the commit, runs the resolved
//! builder, appends both output streams to the log store and records the
//! result. Every build that was started is finished exactly once, and the
//! workspace is removed whatever happened in between.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BuilderFault, ExecuteError, StoreError};
use crate::metrics;
use crate::models::build::Build;
use crate::services::builders::{BuildContext, BuildOutput};
use crate::services::queue::BuildJob;
use crate::services::registry::PluginRegistry;
use crate::services::tracker;
use crate::services::vcs::Vcs;
use crate::store::{BuildStore, LogStore, LogStream};

/// First line of the diagnostic appended to stderr when the runner itself fails.
pub const CRASH_BANNER: &str = "*** Internal build runner error ***";

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Parent directory for per-build workspaces.
    pub workspace_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            workspace_dir: std::env::temp_dir(),
            timeout: None,
        }
    }
}

pub struct BuildExecutor {
    store: Arc<dyn BuildStore>,
    logs: Arc<dyn LogStore>,
    vcs: Arc<dyn Vcs>,
    registry: Arc<PluginRegistry>,
    settings: ExecutorSettings,
}

impl BuildExecutor {
    pub fn new(
        store: Arc<dyn BuildStore>,
        logs: Arc<dyn LogStore>,
        vcs: Arc<dyn Vcs>,
        registry: Arc<PluginRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            logs,
            vcs,
            registry,
            settings,
        }
    }

    /// Execute a pending build.
    ///
    /// A command that runs and fails is `Ok` with `was_successful = false`.
    /// Anything that keeps the command from producing a verdict is recorded
    /// as a failed build and then returned as `Err`.
    pub async fn execute_build(&self, job: &BuildJob) -> Result<Build, ExecuteError> {
        let build = tracker::record_build_start(self.store.as_ref(), job.build_id).await?;
        let clock = Instant::now();

        let outcome = match self.run(&build, &job.builder).await {
            Ok(output) => self
                .write_output(build.id, &output)
                .await
                .map(|()| output.succeeded())
                .map_err(ExecuteError::from),
            Err(e) => Err(e),
        };
        let (successful, failure) = match outcome {
            Ok(successful) => (successful, None),
            Err(e) => {
                let diagnostic = format!("\n{CRASH_BANNER}\n{e}\n");
                if let Err(log_err) = self.logs.append(build.id, LogStream::Stderr, &diagnostic).await {
                    tracing::error!(build_id = build.id, "Failed to store crash diagnostic: {log_err}");
                }
                (false, Some(e))
            }
        };

        let finished = tracker::record_build_result(self.store.as_ref(), build.id, successful).await?;
        tracing::info!(
            build_id = build.id,
            successful,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "Build execution complete"
        );

        match failure {
            Some(e) => {
                metrics::error_recorded(error_category(&e));
                tracing::error!(build_id = build.id, builder = %job.builder, "Build execution failed: {e}");
                Err(e)
            }
            None => Ok(finished.build),
        }
    }

    async fn run(&self, build: &Build, builder_name: &str) -> Result<BuildOutput, ExecuteError> {
        let commit = self.store.get_commit(build.commit_id).await?;
        let project = self.store.get_project(commit.project_id).await?;
        let configuration = self.store.get_configuration(build.configuration_id).await?;
        let builder = self.registry.resolve_builder(builder_name)?;

        tokio::fs::create_dir_all(&self.settings.workspace_dir)
            .await
            .map_err(ExecuteError::Workspace)?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("build-{}-", build.id))
            .tempdir_in(&self.settings.workspace_dir)
            .map_err(ExecuteError::Workspace)?;
        let path = workspace.path().to_path_buf();
        tracing::debug!(build_id = build.id, workspace = %path.display(), "Workspace allocated");

        let result: Result<BuildOutput, ExecuteError> = async {
            let repo = self.vcs.clone_repo(&project.repo_uri, &path).await?;
            match commit.vcs_id.as_deref() {
                Some(revision) => self.vcs.checkout(&repo, revision).await?,
                None => self.vcs.checkout_branch(&repo, &commit.branch).await?,
            }
            let changeset = self.vcs.changeset(&repo).await?;
            let commit = tracker::record_changeset(self.store.as_ref(), commit.id, &changeset).await?;

            let timeout = self.settings.timeout;
            let build_id = build.id;
            let workspace = path.clone();
            let task = tokio::spawn(async move {
                let ctx = BuildContext {
                    build_id,
                    branch: &commit.branch,
                    revision: commit.vcs_id.as_deref(),
                    workspace: &workspace,
                    configuration: &configuration,
                    timeout,
                };
                builder.execute(&ctx).await
            });

            match task.await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(fault)) => Err(crash(fault)),
                Err(join_err) if join_err.is_panic() => Err(ExecuteError::Crash(format!(
                    "builder panicked: {}",
                    panic_message(join_err.into_panic())
                ))),
                Err(join_err) => Err(ExecuteError::Crash(join_err.to_string())),
            }
        }
        .await;

        if let Err(e) = workspace.close() {
            tracing::warn!(build_id = build.id, workspace = %path.display(), "Failed to remove workspace: {e}");
        }
        result
    }

    async fn write_output(&self, build_id: i64, output: &BuildOutput) -> Result<(), StoreError> {
        self.logs.append(build_id, LogStream::Stdout, &output.stdout).await?;
        self.logs.append(build_id, LogStream::Stderr, &output.stderr).await
    }
}

fn crash(fault: BuilderFault) -> ExecuteError {
    ExecuteError::Crash(fault.to_string())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn error_category(error: &ExecuteError) -> &'static str {
    match error {
        ExecuteError::Vcs(_) => "vcs",
        ExecuteError::Workspace(_) => "workspace",
        ExecuteError::Crash(_) => "builder_crash",
        ExecuteError::Registry(_) => "registry",
        ExecuteError::Store(_) => "store",
    }
}
