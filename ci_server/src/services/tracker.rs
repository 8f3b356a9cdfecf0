//! Commit/build lifecycle recording.
//!
//! Every state change of a Commit or Build goes through here so that metrics
//! and logs stay in step with the store.

use chrono::Utc;

use crate::events::build::BuildEvent;
use crate::metrics;
use crate::models::build::Build;
use crate::models::build_configuration::BuildConfiguration;
use crate::models::commit::{short_message, Commit, NewCommit};
use crate::models::project::Project;
use crate::services::vcs::Changeset;
use crate::store::{BuildStore, FinishedBuild, StoreResult, VerdictUpdate};

/// Record a commit on `branch`. `vcs_id` may be unknown until checkout.
///
/// A revision already recorded on the branch returns the existing commit, so
/// overlapping notifications for one tip share a single commit.
pub async fn create_commit(
    store: &dyn BuildStore,
    project: &Project,
    branch: &str,
    vcs_id: Option<&str>,
) -> StoreResult<Commit> {
    let (commit, created) = store
        .find_or_insert_commit(NewCommit {
            project_id: project.id,
            branch: branch.to_string(),
            vcs_id: vcs_id.map(str::to_string),
            short_message: String::new(),
        })
        .await?;
    if !created {
        tracing::debug!(commit_id = commit.id, branch = %commit.branch, "Commit already recorded");
        return Ok(commit);
    }

    tracing::info!(
        commit_id = commit.id,
        project = %project.slug,
        branch = %commit.branch,
        vcs_id = ?commit.vcs_id,
        "Commit recorded"
    );
    Ok(commit)
}

/// Insert a pending build. A repeat for the same (configuration, commit)
/// fails with `StoreError::DuplicateBuild`.
pub async fn create_build(
    store: &dyn BuildStore,
    commit: &Commit,
    configuration: &BuildConfiguration,
) -> StoreResult<Build> {
    let build = store.insert_build(commit.id, configuration.id).await?;

    metrics::build_status_changed("pending");
    tracing::info!(
        build_id = build.id,
        commit_id = commit.id,
        configuration = %configuration.name,
        branch = %commit.branch,
        "Build created"
    );
    Ok(build)
}

/// Take back a build that never started, e.g. because it could not be
/// enqueued. The pair may be built again afterwards.
pub async fn withdraw_build(store: &dyn BuildStore, build_id: i64) -> StoreResult<VerdictUpdate> {
    let update = store.delete_pending_build(build_id).await?;
    tracing::warn!(build_id, commit_id = update.commit.id, "Build withdrawn before it started");
    Ok(update)
}

pub async fn record_build_start(store: &dyn BuildStore, build_id: i64) -> StoreResult<Build> {
    let build = store
        .apply_build_event(build_id, BuildEvent::Started { at: Utc::now() })
        .await?;
    metrics::build_status_changed("active");
    tracing::info!(build_id, commit_id = build.commit_id, "Build started");
    Ok(build)
}

/// Back-fill the commit's revision and subject from the checked-out changeset.
pub async fn record_changeset(
    store: &dyn BuildStore,
    commit_id: i64,
    changeset: &Changeset,
) -> StoreResult<Commit> {
    let commit = store
        .update_changeset(commit_id, &changeset.id, &short_message(&changeset.message))
        .await?;
    if commit.vcs_id.as_deref() != Some(changeset.id.as_str()) {
        tracing::warn!(
            commit_id,
            recorded = ?commit.vcs_id,
            checked_out = %changeset.id,
            "Checked-out revision differs from the recorded one"
        );
    }
    Ok(commit)
}

/// Record the outcome of a build and recompute its commit's verdict in the
/// same store unit.
pub async fn record_build_result(
    store: &dyn BuildStore,
    build_id: i64,
    successful: bool,
) -> StoreResult<FinishedBuild> {
    let finished = store.finish_build(build_id, Utc::now(), successful).await?;
    let build = &finished.build;

    metrics::build_status_changed(build.state().as_str());
    if let Some(duration) = build.duration() {
        metrics::build_duration(duration.num_milliseconds().max(0) as u64);
    }
    tracing::info!(
        build_id,
        commit_id = build.commit_id,
        successful,
        "Build finished"
    );
    report_verdict(&finished.verdict);
    Ok(finished)
}

/// Recompute a commit's verdict from its builds. Idempotent.
pub async fn recompute_commit_verdict(
    store: &dyn BuildStore,
    commit_id: i64,
) -> StoreResult<VerdictUpdate> {
    let update = store.recompute_verdict(commit_id).await?;
    report_verdict(&update);
    Ok(update)
}

fn report_verdict(update: &VerdictUpdate) {
    if !update.transitioned {
        return;
    }
    if let Some(verdict) = update.commit.verdict {
        metrics::commit_verdict(verdict.as_str());
        tracing::info!(
            commit_id = update.commit.id,
            branch = %update.commit.branch,
            verdict = verdict.as_str(),
            "Commit finished"
        );
    }
}

/// Delete a commit that ended up with no builds attached.
pub async fn discard_if_empty(store: &dyn BuildStore, commit: &Commit) -> StoreResult<bool> {
    let deleted = store.delete_commit_if_empty(commit.id).await?;
    if deleted {
        tracing::debug!(commit_id = commit.id, branch = %commit.branch, "Discarded commit without builds");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::build_configuration::NewBuildConfiguration;
    use crate::models::commit::Verdict;
    use crate::models::project::NewProject;
    use crate::store::MemoryStore;

    async fn setup(configurations: &[&str]) -> (MemoryStore, Project, Vec<BuildConfiguration>) {
        let store = MemoryStore::new();
        let project = store
            .insert_project(NewProject {
                name: "Project".into(),
                slug: "project".into(),
                repo_uri: "fake://project".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut created = Vec::new();
        for name in configurations {
            created.push(
                store
                    .insert_configuration(
                        project.id,
                        NewBuildConfiguration {
                            name: name.to_string(),
                            builder: "shell".into(),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap(),
            );
        }
        (store, project, created)
    }

    #[tokio::test]
    async fn duplicate_build_creation_fails() {
        let (store, project, configurations) = setup(&["tests"]).await;
        let commit = create_commit(&store, &project, "main", Some("abc")).await.unwrap();
        create_build(&store, &commit, &configurations[0]).await.unwrap();

        let err = create_build(&store, &commit, &configurations[0]).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateBuild { .. }));
        assert_eq!(store.builds_for_commit(commit.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn known_revision_reuses_the_commit() {
        let (store, project, _) = setup(&[]).await;
        let first = create_commit(&store, &project, "main", Some("abc")).await.unwrap();
        let again = create_commit(&store, &project, "main", Some("abc")).await.unwrap();
        assert_eq!(first.id, again.id);

        let unresolved = create_commit(&store, &project, "main", None).await.unwrap();
        assert_ne!(unresolved.id, first.id);
        assert_eq!(store.commits_for_project(project.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn withdrawn_build_frees_the_pair() {
        let (store, project, configurations) = setup(&["tests"]).await;
        let commit = create_commit(&store, &project, "main", Some("abc")).await.unwrap();
        let build = create_build(&store, &commit, &configurations[0]).await.unwrap();

        withdraw_build(&store, build.id).await.unwrap();
        assert!(store.builds_for_commit(commit.id).await.unwrap().is_empty());
        create_build(&store, &commit, &configurations[0]).await.unwrap();
    }

    #[tokio::test]
    async fn verdict_waits_for_all_builds() {
        let (store, project, configurations) = setup(&["a", "b"]).await;
        let commit = create_commit(&store, &project, "main", Some("abc")).await.unwrap();
        let a = create_build(&store, &commit, &configurations[0]).await.unwrap();
        let b = create_build(&store, &commit, &configurations[1]).await.unwrap();

        record_build_start(&store, a.id).await.unwrap();
        record_build_start(&store, b.id).await.unwrap();

        let first = record_build_result(&store, a.id, true).await.unwrap();
        assert_eq!(first.verdict.commit.verdict, None);
        assert!(!first.verdict.transitioned);

        let second = record_build_result(&store, b.id, false).await.unwrap();
        assert_eq!(second.verdict.commit.verdict, Some(Verdict::Failed));
        assert!(second.verdict.transitioned);

        let again = recompute_commit_verdict(&store, commit.id).await.unwrap();
        assert_eq!(again.commit.verdict, Some(Verdict::Failed));
        assert!(!again.transitioned);
    }

    #[tokio::test]
    async fn empty_commits_are_discarded_and_built_ones_kept() {
        let (store, project, configurations) = setup(&["tests"]).await;
        let empty = create_commit(&store, &project, "docs", None).await.unwrap();
        assert!(discard_if_empty(&store, &empty).await.unwrap());

        let built = create_commit(&store, &project, "main", None).await.unwrap();
        create_build(&store, &built, &configurations[0]).await.unwrap();
        assert!(!discard_if_empty(&store, &built).await.unwrap());
        assert_eq!(store.commits_for_project(project.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changeset_fills_unknown_revision_and_subject() {
        let (store, project, _) = setup(&[]).await;
        let commit = create_commit(&store, &project, "main", None).await.unwrap();
        let changeset = Changeset {
            id: "0123456789abcdef".into(),
            message: "Fix the thing\n\nLonger explanation".into(),
        };
        let updated = record_changeset(&store, commit.id, &changeset).await.unwrap();
        assert_eq!(updated.vcs_id.as_deref(), Some("0123456789abcdef"));
        assert_eq!(updated.short_message, "Fix the thing");
    }
}
