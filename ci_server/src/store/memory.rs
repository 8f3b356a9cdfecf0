//! In-process `BuildStore`.
//!
//! All records live behind one mutex, so every trait method is a single
//! atomic unit, including the finish-and-recompute step.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BuildStore, FinishedBuild, StoreResult, VerdictUpdate};
use crate::error::StoreError;
use crate::events::build::{BuildEvent, TransitionError};
use crate::models::build::Build;
use crate::models::build_configuration::{BuildConfiguration, NewBuildConfiguration};
use crate::models::commit::{Commit, NewCommit, Verdict};
use crate::models::project::{NewProject, Project};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    projects: BTreeMap<i64, Project>,
    configurations: BTreeMap<i64, BuildConfiguration>,
    commits: BTreeMap<i64, Commit>,
    builds: BTreeMap<i64, Build>,
    build_keys: HashSet<(i64, i64)>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn project(&self, id: i64) -> StoreResult<&Project> {
        self.projects
            .get(&id)
            .ok_or_else(|| StoreError::not_found("project", id))
    }

    fn commit_mut(&mut self, id: i64) -> StoreResult<&mut Commit> {
        self.commits
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("commit", id))
    }

    fn build_mut(&mut self, id: i64) -> StoreResult<&mut Build> {
        self.builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("build", id))
    }

    fn apply(&mut self, build_id: i64, event: &BuildEvent) -> StoreResult<Build> {
        let build = self.build_mut(build_id)?;
        build
            .apply(event)
            .map_err(|source| StoreError::InvalidTransition { build_id, source })?;
        Ok(build.clone())
    }

    fn recompute(&mut self, commit_id: i64) -> StoreResult<VerdictUpdate> {
        let verdict = Verdict::from_builds(self.builds.values().filter(|b| b.commit_id == commit_id));
        let commit = self.commit_mut(commit_id)?;
        let transitioned = match verdict {
            Some(verdict) if commit.verdict != Some(verdict) => {
                commit.verdict = Some(verdict);
                true
            }
            _ => false,
        };
        Ok(VerdictUpdate {
            commit: commit.clone(),
            transitioned,
        })
    }

    fn insert_commit(&mut self, new_commit: NewCommit) -> StoreResult<Commit> {
        self.project(new_commit.project_id)?;
        let commit = Commit {
            id: self.next_id(),
            project_id: new_commit.project_id,
            created_at: Utc::now(),
            branch: new_commit.branch,
            vcs_id: new_commit.vcs_id,
            short_message: new_commit.short_message,
            verdict: None,
        };
        self.commits.insert(commit.id, commit.clone());
        Ok(commit)
    }

    fn find_commit(&self, project_id: i64, branch: &str, vcs_id: &str) -> Option<Commit> {
        self.commits_newest_first(project_id)
            .into_iter()
            .find(|c| c.branch == branch && c.vcs_id.as_deref() == Some(vcs_id))
    }

    fn commits_newest_first(&self, project_id: i64) -> Vec<Commit> {
        let mut commits: Vec<Commit> = self
            .commits
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        commits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        commits
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn insert_project(&self, new_project: NewProject) -> StoreResult<Project> {
        let mut state = self.state();
        if state.projects.values().any(|p| p.slug == new_project.slug) {
            return Err(StoreError::DuplicateSlug(new_project.slug));
        }
        let project = Project {
            id: state.next_id(),
            name: new_project.name,
            slug: new_project.slug,
            vcs_kind: new_project.vcs_kind,
            repo_uri: new_project.repo_uri,
            important_branches: new_project.important_branches,
            created_at: Utc::now(),
        };
        state.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, project_id: i64) -> StoreResult<Project> {
        self.state().project(project_id).cloned()
    }

    async fn find_project_by_slug(&self, slug: &str) -> StoreResult<Option<Project>> {
        Ok(self
            .state()
            .projects
            .values()
            .find(|p| p.slug == slug)
            .cloned())
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        Ok(self.state().projects.values().cloned().collect())
    }

    async fn delete_project(&self, project_id: i64) -> StoreResult<()> {
        let mut state = self.state();
        state
            .projects
            .remove(&project_id)
            .ok_or_else(|| StoreError::not_found("project", project_id))?;

        let commit_ids: HashSet<i64> = state
            .commits
            .values()
            .filter(|c| c.project_id == project_id)
            .map(|c| c.id)
            .collect();
        state.commits.retain(|id, _| !commit_ids.contains(id));
        state.builds.retain(|_, b| !commit_ids.contains(&b.commit_id));
        state.build_keys.retain(|(_, commit_id)| !commit_ids.contains(commit_id));
        state.configurations.retain(|_, c| c.project_id != project_id);
        Ok(())
    }

    async fn insert_configuration(
        &self,
        project_id: i64,
        new_configuration: NewBuildConfiguration,
    ) -> StoreResult<BuildConfiguration> {
        let mut state = self.state();
        state.project(project_id)?;
        let configuration = BuildConfiguration {
            id: state.next_id(),
            project_id,
            name: new_configuration.name,
            builder: new_configuration.builder,
            branches: new_configuration.branches,
            parameters: new_configuration.parameters,
        };
        state
            .configurations
            .insert(configuration.id, configuration.clone());
        Ok(configuration)
    }

    async fn get_configuration(&self, configuration_id: i64) -> StoreResult<BuildConfiguration> {
        self.state()
            .configurations
            .get(&configuration_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("configuration", configuration_id))
    }

    async fn configurations_for(&self, project_id: i64) -> StoreResult<Vec<BuildConfiguration>> {
        Ok(self
            .state()
            .configurations
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_commit(&self, new_commit: NewCommit) -> StoreResult<Commit> {
        self.state().insert_commit(new_commit)
    }

    async fn find_or_insert_commit(&self, new_commit: NewCommit) -> StoreResult<(Commit, bool)> {
        let mut state = self.state();
        if let Some(vcs_id) = new_commit.vcs_id.as_deref() {
            if let Some(commit) = state.find_commit(new_commit.project_id, &new_commit.branch, vcs_id) {
                return Ok((commit, false));
            }
        }
        Ok((state.insert_commit(new_commit)?, true))
    }

    async fn get_commit(&self, commit_id: i64) -> StoreResult<Commit> {
        self.state()
            .commits
            .get(&commit_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("commit", commit_id))
    }

    async fn latest_commit_for_branch(
        &self,
        project_id: i64,
        branch: &str,
    ) -> StoreResult<Option<Commit>> {
        Ok(self
            .state()
            .commits_newest_first(project_id)
            .into_iter()
            .find(|c| c.branch == branch && c.vcs_id.is_some()))
    }

    async fn commits_for_project(&self, project_id: i64) -> StoreResult<Vec<Commit>> {
        Ok(self.state().commits_newest_first(project_id))
    }

    async fn update_changeset(
        &self,
        commit_id: i64,
        vcs_id: &str,
        short_message: &str,
    ) -> StoreResult<Commit> {
        let mut state = self.state();
        let commit = state.commit_mut(commit_id)?;
        if commit.vcs_id.is_none() {
            commit.vcs_id = Some(vcs_id.to_string());
        }
        if commit.short_message.is_empty() {
            commit.short_message = short_message.to_string();
        }
        Ok(commit.clone())
    }

    async fn delete_commit_if_empty(&self, commit_id: i64) -> StoreResult<bool> {
        let mut state = self.state();
        if state.builds.values().any(|b| b.commit_id == commit_id) {
            return Ok(false);
        }
        Ok(state.commits.remove(&commit_id).is_some())
    }

    async fn insert_build(&self, commit_id: i64, configuration_id: i64) -> StoreResult<Build> {
        let mut state = self.state();
        if !state.configurations.contains_key(&configuration_id) {
            return Err(StoreError::not_found("configuration", configuration_id));
        }
        state.commit_mut(commit_id)?;
        if !state.build_keys.insert((configuration_id, commit_id)) {
            return Err(StoreError::DuplicateBuild {
                configuration_id,
                commit_id,
            });
        }
        let build = Build {
            id: state.next_id(),
            commit_id,
            configuration_id,
            started: None,
            finished: None,
            was_successful: None,
        };
        state.builds.insert(build.id, build.clone());
        // A new outstanding build reopens the commit.
        state.commit_mut(commit_id)?.verdict = None;
        Ok(build)
    }

    async fn get_build(&self, build_id: i64) -> StoreResult<Build> {
        self.state()
            .builds
            .get(&build_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("build", build_id))
    }

    async fn delete_pending_build(&self, build_id: i64) -> StoreResult<VerdictUpdate> {
        let mut state = self.state();
        let build = state.build_mut(build_id)?.clone();
        if build.started.is_some() {
            return Err(StoreError::InvalidTransition {
                build_id,
                source: TransitionError::AlreadyStarted,
            });
        }
        state.builds.remove(&build_id);
        state
            .build_keys
            .remove(&(build.configuration_id, build.commit_id));
        state.recompute(build.commit_id)
    }

    async fn builds_for_commit(&self, commit_id: i64) -> StoreResult<Vec<Build>> {
        Ok(self
            .state()
            .builds
            .values()
            .filter(|b| b.commit_id == commit_id)
            .cloned()
            .collect())
    }

    async fn builds_for_project(&self, project_id: i64) -> StoreResult<Vec<Build>> {
        let state = self.state();
        Ok(state
            .builds
            .values()
            .filter(|b| {
                state
                    .commits
                    .get(&b.commit_id)
                    .is_some_and(|c| c.project_id == project_id)
            })
            .cloned()
            .collect())
    }

    async fn apply_build_event(&self, build_id: i64, event: BuildEvent) -> StoreResult<Build> {
        self.state().apply(build_id, &event)
    }

    async fn finish_build(
        &self,
        build_id: i64,
        at: DateTime<Utc>,
        successful: bool,
    ) -> StoreResult<FinishedBuild> {
        let mut state = self.state();
        let build = state.apply(build_id, &BuildEvent::Finished { at, successful })?;
        let verdict = state.recompute(build.commit_id)?;
        Ok(FinishedBuild { build, verdict })
    }

    async fn recompute_verdict(&self, commit_id: i64) -> StoreResult<VerdictUpdate> {
        self.state().recompute(commit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryStore, Project, BuildConfiguration, Commit) {
        let store = MemoryStore::new();
        let project = store
            .insert_project(NewProject {
                name: "p1".into(),
                slug: "p1".into(),
                repo_uri: "/srv/p1.git".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let configuration = store
            .insert_configuration(
                project.id,
                NewBuildConfiguration {
                    name: "tests".into(),
                    builder: "shell".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let commit = store
            .insert_commit(NewCommit {
                project_id: project.id,
                branch: "main".into(),
                vcs_id: Some("abc".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        (store, project, configuration, commit)
    }

    #[tokio::test]
    async fn slugs_are_unique() {
        let (store, _, _, _) = seeded().await;
        let err = store
            .insert_project(NewProject {
                slug: "p1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSlug(slug) if slug == "p1"));
    }

    #[tokio::test]
    async fn second_build_for_same_pair_is_rejected() {
        let (store, _, configuration, commit) = seeded().await;
        store.insert_build(commit.id, configuration.id).await.unwrap();
        let err = store
            .insert_build(commit.id, configuration.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateBuild { .. }));
        assert_eq!(store.builds_for_commit(commit.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn find_or_insert_reuses_a_known_revision() {
        let (store, project, _, commit) = seeded().await;
        let (found, created) = store
            .find_or_insert_commit(NewCommit {
                project_id: project.id,
                branch: "main".into(),
                vcs_id: Some("abc".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(found.id, commit.id);

        let (other_branch, created) = store
            .find_or_insert_commit(NewCommit {
                project_id: project.id,
                branch: "release".into(),
                vcs_id: Some("abc".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(created);
        assert_ne!(other_branch.id, commit.id);
        assert_eq!(store.commits_for_project(project.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pending_build_can_be_withdrawn() {
        let (store, project, configuration, commit) = seeded().await;
        let other = store
            .insert_configuration(
                project.id,
                NewBuildConfiguration {
                    name: "docs".into(),
                    builder: "shell".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let done = store.insert_build(commit.id, configuration.id).await.unwrap();
        let now = Utc::now();
        store
            .apply_build_event(done.id, BuildEvent::Started { at: now })
            .await
            .unwrap();
        store.finish_build(done.id, now, true).await.unwrap();

        // A later build reopens the commit; withdrawing it restores the verdict.
        let late = store.insert_build(commit.id, other.id).await.unwrap();
        assert_eq!(store.get_commit(commit.id).await.unwrap().verdict, None);
        let update = store.delete_pending_build(late.id).await.unwrap();
        assert_eq!(update.commit.verdict, Some(Verdict::Successful));
        assert!(store.get_build(late.id).await.is_err());

        // The pair is free again.
        store.insert_build(commit.id, other.id).await.unwrap();

        let err = store.delete_pending_build(done.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn only_empty_commits_are_deleted() {
        let (store, project, configuration, commit) = seeded().await;
        let empty = store
            .insert_commit(NewCommit {
                project_id: project.id,
                branch: "feature".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.insert_build(commit.id, configuration.id).await.unwrap();

        assert!(!store.delete_commit_if_empty(commit.id).await.unwrap());
        assert!(store.delete_commit_if_empty(empty.id).await.unwrap());
        assert_eq!(store.commits_for_project(project.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changeset_backfill_keeps_resolved_values() {
        let (store, project, _, commit) = seeded().await;
        let updated = store.update_changeset(commit.id, "def", "subject").await.unwrap();
        assert_eq!(updated.vcs_id.as_deref(), Some("abc"));
        assert_eq!(updated.short_message, "subject");

        let lazy = store
            .insert_commit(NewCommit {
                project_id: project.id,
                branch: "main".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let updated = store.update_changeset(lazy.id, "def", "other").await.unwrap();
        assert_eq!(updated.vcs_id.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn finishing_the_last_build_transitions_once() {
        let (store, project, configuration, commit) = seeded().await;
        let other = store
            .insert_configuration(
                project.id,
                NewBuildConfiguration {
                    name: "docs".into(),
                    builder: "shell".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = store.insert_build(commit.id, configuration.id).await.unwrap();
        let second = store.insert_build(commit.id, other.id).await.unwrap();
        let now = Utc::now();
        for id in [first.id, second.id] {
            store
                .apply_build_event(id, BuildEvent::Started { at: now })
                .await
                .unwrap();
        }

        let finished = store.finish_build(first.id, now, true).await.unwrap();
        assert!(!finished.verdict.transitioned);
        assert_eq!(finished.verdict.commit.verdict, None);

        let finished = store.finish_build(second.id, now, false).await.unwrap();
        assert!(finished.verdict.transitioned);
        assert_eq!(finished.verdict.commit.verdict, Some(Verdict::Failed));

        let again = store.recompute_verdict(commit.id).await.unwrap();
        assert!(!again.transitioned);
        assert_eq!(again.commit.verdict, Some(Verdict::Failed));
    }

    #[tokio::test]
    async fn finishing_twice_is_rejected() {
        let (store, _, configuration, commit) = seeded().await;
        let build = store.insert_build(commit.id, configuration.id).await.unwrap();
        let now = Utc::now();
        store
            .apply_build_event(build.id, BuildEvent::Started { at: now })
            .await
            .unwrap();
        store.finish_build(build.id, now, true).await.unwrap();
        let err = store.finish_build(build.id, now, false).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(
            store.get_build(build.id).await.unwrap().was_successful,
            Some(true)
        );
    }

    #[tokio::test]
    async fn deleting_a_project_cascades() {
        let (store, project, configuration, commit) = seeded().await;
        store.insert_build(commit.id, configuration.id).await.unwrap();
        store.delete_project(project.id).await.unwrap();

        assert!(store.list_projects().await.unwrap().is_empty());
        assert!(store.configurations_for(project.id).await.unwrap().is_empty());
        assert!(store.commits_for_project(project.id).await.unwrap().is_empty());
        assert!(store.get_commit(commit.id).await.is_err());
    }
}
