//! Build hook handling: from "branches changed" to queued builds.
//!
//! For every changed branch the dispatcher records a commit at the remote
//! tip, creates one pending build per matching configuration and enqueues it.
//! Commits that end up without builds are discarded again.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{DispatchError, StoreError};
use crate::metrics;
use crate::services::hooks::{HookContext, HookRequest};
use crate::services::queue::{BuildJob, BuildQueue};
use crate::services::registry::PluginRegistry;
use crate::services::tracker;
use crate::services::vcs::Vcs;
use crate::store::BuildStore;

/// A build created by one hook invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedBuild {
    pub build_id: i64,
    pub commit_id: i64,
    pub branch: String,
    pub configuration: String,
}

/// What one hook invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Branches the hook source reported as changed.
    pub branches: Vec<String>,
    pub builds: Vec<DispatchedBuild>,
    /// (configuration, commit) pairs that already had a build.
    pub already_built: usize,
    /// Branches ignored because they are not important or not on the remote.
    pub skipped: Vec<String>,
}

pub struct Dispatcher {
    store: Arc<dyn BuildStore>,
    vcs: Arc<dyn Vcs>,
    registry: Arc<PluginRegistry>,
    queue: Arc<dyn BuildQueue>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn BuildStore>,
        vcs: Arc<dyn Vcs>,
        registry: Arc<PluginRegistry>,
        queue: Arc<dyn BuildQueue>,
    ) -> Self {
        Self {
            store,
            vcs,
            registry,
            queue,
        }
    }

    pub async fn handle_hook(
        &self,
        slug: &str,
        hook_type: &str,
        request: &HookRequest,
    ) -> Result<DispatchReport, DispatchError> {
        metrics::hook_received(hook_type);

        let project = self
            .store
            .find_project_by_slug(slug)
            .await?
            .ok_or_else(|| DispatchError::ProjectNotFound(slug.to_string()))?;
        let source = self.registry.resolve_build_hook(hook_type)?;

        let mut changed = source
            .changed_branches(&HookContext {
                project: &project,
                request,
                vcs: self.vcs.as_ref(),
                store: self.store.as_ref(),
            })
            .await?;
        let mut seen = std::collections::HashSet::new();
        changed.retain(|branch| seen.insert(branch.clone()));

        let mut report = DispatchReport {
            branches: changed.clone(),
            ..Default::default()
        };
        if changed.is_empty() {
            tracing::debug!(project = %project.slug, hook = hook_type, "Hook reported no changed branches");
            return Ok(report);
        }

        let tips = self.vcs.remote_branches(&project.repo_uri).await.map_err(|e| {
            metrics::error_recorded("vcs");
            tracing::error!(project = %project.slug, "Listing remote branches failed: {e}");
            e
        })?;
        let configurations = self.store.configurations_for(project.id).await?;

        for branch in changed {
            if !project.accepts_branch(&branch) {
                tracing::debug!(project = %project.slug, branch = %branch, "Ignoring unimportant branch");
                report.skipped.push(branch);
                continue;
            }
            let Some(tip) = tips.get(&branch) else {
                tracing::warn!(project = %project.slug, branch = %branch, "Branch not found on remote");
                report.skipped.push(branch);
                continue;
            };

            let commit =
                tracker::create_commit(self.store.as_ref(), &project, &branch, Some(tip)).await?;

            for configuration in configurations.iter().filter(|c| c.should_build_branch(&branch)) {
                let build = match tracker::create_build(self.store.as_ref(), &commit, configuration).await {
                    Ok(build) => build,
                    Err(StoreError::DuplicateBuild { .. }) => {
                        tracing::info!(
                            commit_id = commit.id,
                            branch = %branch,
                            configuration = %configuration.name,
                            "Revision already built"
                        );
                        report.already_built += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let job = BuildJob {
                    build_id: build.id,
                    builder: configuration.builder.clone(),
                };
                if let Err(closed) = self.queue.enqueue(job) {
                    // An unqueued build would keep the commit open forever.
                    tracker::withdraw_build(self.store.as_ref(), build.id).await?;
                    tracker::discard_if_empty(self.store.as_ref(), &commit).await?;
                    metrics::error_recorded("queue");
                    return Err(closed.into());
                }
                report.builds.push(DispatchedBuild {
                    build_id: build.id,
                    commit_id: commit.id,
                    branch: branch.clone(),
                    configuration: configuration.name.clone(),
                });
            }

            tracker::discard_if_empty(self.store.as_ref(), &commit).await?;
        }

        tracing::info!(
            project = %project.slug,
            hook = hook_type,
            builds = report.builds.len(),
            already_built = report.already_built,
            "Build hook handled"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::fakes::{FakeVcs, RecordingQueue};
    use crate::models::build_configuration::NewBuildConfiguration;
    use crate::models::project::NewProject;
    use crate::services::hooks::DebugHook;
    use crate::store::MemoryStore;

    struct Setup {
        store: Arc<MemoryStore>,
        vcs: Arc<FakeVcs>,
        queue: Arc<RecordingQueue>,
        dispatcher: Dispatcher,
    }

    async fn setup(important: &[&str], configurations: &[(&str, &[&str])]) -> Setup {
        let store = Arc::new(MemoryStore::new());
        let vcs = Arc::new(FakeVcs::new());
        let queue = Arc::new(RecordingQueue::new());
        let registry = Arc::new(PluginRegistry::new());
        registry.register_build_hook_source("debug", || Arc::new(DebugHook));

        let project = store
            .insert_project(NewProject {
                name: "Demo".into(),
                slug: "demo".into(),
                repo_uri: "fake://demo".into(),
                important_branches: important.iter().map(|b| b.to_string()).collect(),
                ..Default::default()
            })
            .await
            .unwrap();
        for (name, branches) in configurations {
            store
                .insert_configuration(
                    project.id,
                    NewBuildConfiguration {
                        name: name.to_string(),
                        builder: "shell".into(),
                        branches: branches.iter().map(|b| b.to_string()).collect(),
                        parameters: Some("true".into()),
                    },
                )
                .await
                .unwrap();
        }

        let dispatcher = Dispatcher::new(store.clone(), vcs.clone(), registry, queue.clone());
        Setup {
            store,
            vcs,
            queue,
            dispatcher,
        }
    }

    fn debug_request(branches: &str) -> HookRequest {
        HookRequest::new(
            [],
            HashMap::from([("branches".to_string(), branches.to_string())]),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn unknown_project_and_hook_are_errors() {
        let s = setup(&[], &[]).await;
        assert!(matches!(
            s.dispatcher.handle_hook("nope", "debug", &debug_request("main")).await,
            Err(DispatchError::ProjectNotFound(_))
        ));
        assert!(matches!(
            s.dispatcher.handle_hook("demo", "nope", &debug_request("main")).await,
            Err(DispatchError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn repeat_notification_is_already_built() {
        let s = setup(&[], &[("tests", &[])]).await;
        s.vcs.push_commit("fake://demo", "main", "one", &[]);

        let first = s.dispatcher.handle_hook("demo", "debug", &debug_request("main")).await.unwrap();
        assert_eq!(first.builds.len(), 1);

        let second = s.dispatcher.handle_hook("demo", "debug", &debug_request("main")).await.unwrap();
        assert!(second.builds.is_empty());
        assert_eq!(second.already_built, 1);
        assert_eq!(s.queue.jobs().len(), 1);

        let project = s.store.find_project_by_slug("demo").await.unwrap().unwrap();
        assert_eq!(s.store.commits_for_project(project.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_tip_gets_a_new_commit() {
        let s = setup(&[], &[("tests", &[])]).await;
        s.vcs.push_commit("fake://demo", "main", "one", &[]);
        s.dispatcher.handle_hook("demo", "debug", &debug_request("main")).await.unwrap();
        let tip = s.vcs.push_commit("fake://demo", "main", "two", &[]);
        let report = s.dispatcher.handle_hook("demo", "debug", &debug_request("main")).await.unwrap();

        assert_eq!(report.builds.len(), 1);
        let commit = s.store.get_commit(report.builds[0].commit_id).await.unwrap();
        assert_eq!(commit.vcs_id.as_deref(), Some(tip.as_str()));
    }

    #[tokio::test]
    async fn missing_and_unimportant_branches_are_skipped() {
        let s = setup(&["main", "ghost"], &[("tests", &[])]).await;
        s.vcs.push_commit("fake://demo", "main", "one", &[]);
        s.vcs.push_commit("fake://demo", "feature", "wip", &[]);

        let report = s
            .dispatcher
            .handle_hook("demo", "debug", &debug_request("main,feature,ghost"))
            .await
            .unwrap();
        assert_eq!(report.builds.len(), 1);
        assert_eq!(report.builds[0].branch, "main");
        assert_eq!(report.skipped, vec!["feature", "ghost"]);
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_invocation() {
        let s = setup(&[], &[("tests", &[])]).await;
        s.vcs.push_commit("fake://demo", "main", "one", &[]);
        s.vcs.fail_listing(true);

        let err = s
            .dispatcher
            .handle_hook("demo", "debug", &debug_request("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Vcs(_)));
        assert!(s.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn closed_queue_is_an_error() {
        let s = setup(&[], &[("tests", &[])]).await;
        s.vcs.push_commit("fake://demo", "main", "one", &[]);
        s.queue.close();

        assert!(matches!(
            s.dispatcher.handle_hook("demo", "debug", &debug_request("main")).await,
            Err(DispatchError::Queue(_))
        ));
        let project = s.store.find_project_by_slug("demo").await.unwrap().unwrap();
        assert!(s.store.commits_for_project(project.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_after_rejected_enqueue_builds_again() {
        let s = setup(&[], &[("tests", &[])]).await;
        s.vcs.push_commit("fake://demo", "main", "one", &[]);
        s.queue.reject_next(1);

        let err = s
            .dispatcher
            .handle_hook("demo", "debug", &debug_request("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Queue(_)));

        let retry = s.dispatcher.handle_hook("demo", "debug", &debug_request("main")).await.unwrap();
        assert_eq!(retry.builds.len(), 1);
        assert_eq!(retry.already_built, 0);
        assert_eq!(s.queue.jobs().len(), 1);

        let builds = s.store.builds_for_commit(retry.builds[0].commit_id).await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].id, s.queue.jobs()[0].build_id);
    }
}
