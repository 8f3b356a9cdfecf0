//! Asynchronous build execution substrate.
//!
//! Dispatch hands jobs to a `BuildQueue` and returns immediately. `TaskQueue`
//! runs them on the tokio runtime, bounded by a semaphore.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::QueueClosed;
use crate::metrics;
use crate::services::executor::BuildExecutor;

/// One build waiting to run, with the builder name it was dispatched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    pub build_id: i64,
    pub builder: String,
}

/// Fire-and-forget submission of build jobs.
pub trait BuildQueue: Send + Sync {
    fn enqueue(&self, job: BuildJob) -> Result<(), QueueClosed>;
}

/// What the worker did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub executed: usize,
    /// Builds whose runner fault was re-raised by the executor.
    pub faults: usize,
}

/// `BuildQueue` backed by a worker task on the current runtime.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<BuildJob>,
}

impl TaskQueue {
    /// Start the worker. It drains outstanding jobs and exits once every
    /// `TaskQueue` clone has been dropped.
    pub fn spawn(
        executor: Arc<BuildExecutor>,
        max_concurrent: usize,
    ) -> (Self, JoinHandle<WorkerSummary>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(rx, executor, max_concurrent.max(1)));
        (Self { tx }, handle)
    }
}

impl BuildQueue for TaskQueue {
    fn enqueue(&self, job: BuildJob) -> Result<(), QueueClosed> {
        tracing::debug!(build_id = job.build_id, builder = %job.builder, "Build enqueued");
        self.tx.send(job).map_err(|_| QueueClosed)
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<BuildJob>,
    executor: Arc<BuildExecutor>,
    max_concurrent: usize,
) -> WorkerSummary {
    tracing::info!(max_concurrent, "Build worker started");
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut running = JoinSet::new();
    let mut summary = WorkerSummary::default();

    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        metrics::active_builds(max_concurrent - permits.available_permits());

        let executor = Arc::clone(&executor);
        let gauge = Arc::clone(&permits);
        running.spawn(async move {
            let faulted = match executor.execute_build(&job).await {
                Ok(_) => false,
                Err(e) => {
                    metrics::runner_fault(&job.builder);
                    tracing::warn!(build_id = job.build_id, builder = %job.builder, "Build runner fault: {e}");
                    true
                }
            };
            drop(permit);
            metrics::active_builds(max_concurrent - gauge.available_permits());
            faulted
        });

        while let Some(joined) = running.try_join_next() {
            summary.record(joined);
        }
    }

    tracing::info!(outstanding = running.len(), "Build queue closed, draining");
    while let Some(joined) = running.join_next().await {
        summary.record(joined);
    }
    tracing::info!(executed = summary.executed, faults = summary.faults, "Build worker stopped");
    summary
}

impl WorkerSummary {
    fn record(&mut self, joined: Result<bool, tokio::task::JoinError>) {
        self.executed += 1;
        match joined {
            Ok(false) => {}
            Ok(true) => self.faults += 1,
            Err(e) => {
                self.faults += 1;
                metrics::error_recorded("worker");
                tracing::error!("Build worker task failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fakes::FakeVcs;
    use crate::models::build_configuration::NewBuildConfiguration;
    use crate::models::commit::{NewCommit, Verdict};
    use crate::models::project::NewProject;
    use crate::services::builders::ShellBuilder;
    use crate::services::executor::ExecutorSettings;
    use crate::services::registry::PluginRegistry;
    use crate::store::{BuildStore, MemoryLogStore, MemoryStore};

    #[tokio::test]
    async fn queued_builds_run_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let vcs = Arc::new(FakeVcs::new());
        vcs.push_commit("fake://q", "master", "initial", &[]);
        let registry = Arc::new(PluginRegistry::new());
        registry.register_builder("shell", || Arc::new(ShellBuilder::new("/bin/sh")));
        let workspaces = tempfile::tempdir().unwrap();
        let executor = Arc::new(BuildExecutor::new(
            store.clone(),
            Arc::new(MemoryLogStore::new()),
            vcs,
            registry,
            ExecutorSettings {
                workspace_dir: workspaces.path().to_path_buf(),
                timeout: Some(Duration::from_secs(30)),
            },
        ));

        let project = store
            .insert_project(NewProject {
                name: "q".into(),
                slug: "q".into(),
                repo_uri: "fake://q".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let commit = store
            .insert_commit(NewCommit {
                project_id: project.id,
                branch: "master".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let (queue, worker) = TaskQueue::spawn(executor, 2);
        for name in ["a", "b", "c"] {
            let configuration = store
                .insert_configuration(
                    project.id,
                    NewBuildConfiguration {
                        name: name.into(),
                        builder: "shell".into(),
                        parameters: Some("true".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let build = store.insert_build(commit.id, configuration.id).await.unwrap();
            queue
                .enqueue(BuildJob {
                    build_id: build.id,
                    builder: "shell".into(),
                })
                .unwrap();
        }

        drop(queue);
        let summary = tokio::time::timeout(Duration::from_secs(30), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, WorkerSummary { executed: 3, faults: 0 });

        let builds = store.builds_for_commit(commit.id).await.unwrap();
        assert_eq!(builds.len(), 3);
        assert!(builds.iter().all(|b| b.was_successful == Some(true)));
        assert_eq!(
            store.get_commit(commit.id).await.unwrap().verdict,
            Some(Verdict::Successful)
        );
    }

    #[tokio::test]
    async fn runner_faults_reach_the_worker() {
        let store = Arc::new(MemoryStore::new());
        let vcs = Arc::new(FakeVcs::new());
        vcs.push_commit("fake://q", "master", "initial", &[]);
        let workspaces = tempfile::tempdir().unwrap();
        let executor = Arc::new(BuildExecutor::new(
            store.clone(),
            Arc::new(MemoryLogStore::new()),
            vcs,
            Arc::new(PluginRegistry::new()),
            ExecutorSettings {
                workspace_dir: workspaces.path().to_path_buf(),
                timeout: None,
            },
        ));

        let project = store
            .insert_project(NewProject {
                name: "q".into(),
                slug: "q".into(),
                repo_uri: "fake://q".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let configuration = store
            .insert_configuration(
                project.id,
                NewBuildConfiguration {
                    name: "unregistered".into(),
                    builder: "nobody".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let commit = store
            .insert_commit(NewCommit {
                project_id: project.id,
                branch: "master".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let build = store.insert_build(commit.id, configuration.id).await.unwrap();

        let (queue, worker) = TaskQueue::spawn(executor, 1);
        queue
            .enqueue(BuildJob {
                build_id: build.id,
                builder: "nobody".into(),
            })
            .unwrap();
        drop(queue);

        let summary = worker.await.unwrap();
        assert_eq!(summary, WorkerSummary { executed: 1, faults: 1 });
        assert_eq!(
            store.get_build(build.id).await.unwrap().was_successful,
            Some(false)
        );
    }
}
