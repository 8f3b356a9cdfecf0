//! Project overview for the dashboard API.
//!
//! The project state is taken from the builds of the latest finished commit
//! on each considered branch. Considered branches are the important branches
//! when the project names any, otherwise every branch with commits.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::models::build::{Build, BuildState};
use crate::models::commit::{Commit, Verdict};
use crate::models::project::Project;
use crate::store::{BuildStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Unknown,
    Successful,
    Failed,
}

/// Commits of one branch, as shown on the project page.
#[derive(Debug, Clone, Serialize)]
pub struct BranchSummary {
    pub branch: String,
    /// Newest commit with a verdict.
    pub latest: Option<Commit>,
    /// Newest successful commit.
    pub latest_stable: Option<Commit>,
    /// Commits with a known revision and no verdict yet, oldest first.
    pub unfinished: Vec<Commit>,
    /// Build counts per state over `unfinished`.
    pub unfinished_builds: BTreeMap<BuildState, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectOverview {
    pub project: String,
    pub name: String,
    pub state: ProjectState,
    pub summary: String,
    pub failed_builds: usize,
    pub total_builds: usize,
    pub active_builds: usize,
    pub pending_builds: usize,
    pub branches: Vec<BranchSummary>,
}

/// Distinct branches with at least one commit, sorted by name.
pub fn all_branches(commits: &[Commit]) -> Vec<String> {
    commits
        .iter()
        .map(|c| c.branch.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Branches in display order: the project's branch order first (where they
/// have commits), then the rest.
pub fn branches_ordered(project: &Project, commits: &[Commit]) -> Vec<String> {
    let mut rest = all_branches(commits);
    let mut ordered = Vec::with_capacity(rest.len());
    for branch in project.branch_order() {
        if let Some(pos) = rest.iter().position(|b| *b == branch) {
            ordered.push(rest.remove(pos));
        }
    }
    ordered.extend(rest);
    ordered
}

/// Newest finished commit of every considered branch.
///
/// `commits` must be newest first, as returned by the store.
pub fn latest_branch_commits<'a>(project: &Project, commits: &'a [Commit]) -> Vec<&'a Commit> {
    let branches = if project.important_branches.is_empty() {
        all_branches(commits)
    } else {
        project.important_branches.clone()
    };
    branches
        .iter()
        .filter_map(|branch| {
            commits
                .iter()
                .find(|c| c.branch == *branch && c.is_finished())
        })
        .collect()
}

/// Per-branch summaries in display order. `commits` must be newest first.
pub fn branch_summaries(project: &Project, commits: &[Commit], builds: &[Build]) -> Vec<BranchSummary> {
    let mut by_commit: HashMap<i64, Vec<&Build>> = HashMap::new();
    for build in builds {
        by_commit.entry(build.commit_id).or_default().push(build);
    }

    branches_ordered(project, commits)
        .into_iter()
        .map(|branch| {
            let on_branch: Vec<&Commit> = commits.iter().filter(|c| c.branch == branch).collect();
            let latest = on_branch.iter().find(|c| c.is_finished()).map(|c| (*c).clone());
            let latest_stable = on_branch
                .iter()
                .find(|c| c.verdict == Some(Verdict::Successful))
                .map(|c| (*c).clone());
            let unfinished: Vec<Commit> = on_branch
                .iter()
                .rev()
                .filter(|c| c.vcs_id.is_some() && !c.is_finished())
                .map(|c| (*c).clone())
                .collect();

            let mut unfinished_builds = BTreeMap::new();
            for commit in &unfinished {
                for build in by_commit.get(&commit.id).into_iter().flatten() {
                    *unfinished_builds.entry(build.state()).or_insert(0) += 1;
                }
            }

            BranchSummary {
                branch,
                latest,
                latest_stable,
                unfinished,
                unfinished_builds,
            }
        })
        .collect()
}

/// State and summary text over the given builds.
pub fn summarize<'a>(builds: impl IntoIterator<Item = &'a Build>) -> (ProjectState, String, usize, usize) {
    let (mut failed, mut total) = (0, 0);
    for build in builds {
        total += 1;
        if build.was_successful != Some(true) {
            failed += 1;
        }
    }
    let (state, text) = match (failed, total) {
        (_, 0) => (ProjectState::Unknown, "No builds".to_string()),
        (0, _) => (ProjectState::Successful, "all builds successful".to_string()),
        (f, t) => (ProjectState::Failed, format!("{f}/{t} build(s) failed")),
    };
    (state, text, failed, total)
}

pub fn overview(project: &Project, commits: &[Commit], builds: &[Build]) -> ProjectOverview {
    let latest: BTreeSet<i64> = latest_branch_commits(project, commits)
        .into_iter()
        .map(|c| c.id)
        .collect();
    let (state, summary, failed_builds, total_builds) =
        summarize(builds.iter().filter(|b| latest.contains(&b.commit_id)));

    ProjectOverview {
        project: project.slug.clone(),
        name: project.name.clone(),
        state,
        summary,
        failed_builds,
        total_builds,
        active_builds: builds.iter().filter(|b| b.state() == BuildState::Active).count(),
        pending_builds: builds.iter().filter(|b| b.state() == BuildState::Pending).count(),
        branches: branch_summaries(project, commits, builds),
    }
}

/// Load a project's commits and builds and build its overview.
pub async fn project_overview(store: &dyn BuildStore, project: &Project) -> StoreResult<ProjectOverview> {
    let commits = store.commits_for_project(project.id).await?;
    let builds = store.builds_for_project(project.id).await?;
    Ok(overview(project, &commits, &builds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::models::project::VcsKind;

    fn project(important: &[&str]) -> Project {
        Project {
            id: 1,
            name: "P1".into(),
            slug: "p1".into(),
            vcs_kind: VcsKind::Git,
            repo_uri: String::new(),
            important_branches: important.iter().map(|b| b.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    /// Fixture: b1 and b2 each with a finished commit of builds, newest first.
    struct Fixture {
        commits: Vec<Commit>,
        builds: Vec<Build>,
        next: i64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                commits: Vec::new(),
                builds: Vec::new(),
                next: 0,
            }
        }

        fn commit(&mut self, branch: &str, vcs_id: Option<&str>, verdict: Option<Verdict>) -> i64 {
            self.next += 1;
            let commit = Commit {
                id: self.next,
                project_id: 1,
                created_at: Utc::now() + Duration::seconds(self.next),
                branch: branch.into(),
                vcs_id: vcs_id.map(str::to_string),
                short_message: String::new(),
                verdict,
            };
            // Newest first.
            self.commits.insert(0, commit);
            self.next
        }

        fn build(&mut self, commit_id: i64, started: bool, outcome: Option<bool>) {
            self.next += 1;
            let now = Utc::now();
            self.builds.push(Build {
                id: self.next,
                commit_id,
                configuration_id: 1,
                started: started.then_some(now),
                finished: outcome.map(|_| now),
                was_successful: outcome,
            });
        }

        fn standard() -> Self {
            let mut f = Self::new();
            let b1 = f.commit("b1", Some("c1"), Some(Verdict::Successful));
            f.build(b1, true, Some(true));
            f.build(b1, true, Some(true));
            let b2 = f.commit("b2", Some("c1"), Some(Verdict::Successful));
            f.build(b2, true, Some(true));
            f
        }
    }

    #[test]
    fn no_commits_means_no_builds() {
        let o = overview(&project(&[]), &[], &[]);
        assert_eq!(o.state, ProjectState::Unknown);
        assert_eq!(o.summary, "No builds");
    }

    #[test]
    fn all_successful() {
        let f = Fixture::standard();
        let o = overview(&project(&[]), &f.commits, &f.builds);
        assert_eq!(o.state, ProjectState::Successful);
        assert_eq!(o.summary, "all builds successful");
        assert_eq!((o.failed_builds, o.total_builds), (0, 3));
    }

    #[test]
    fn failures_are_counted_over_latest_commits() {
        let mut f = Fixture::standard();
        for build in f.builds.iter_mut().filter(|b| b.commit_id == 1) {
            build.was_successful = Some(false);
        }
        let o = overview(&project(&[]), &f.commits, &f.builds);
        assert_eq!(o.state, ProjectState::Failed);
        assert_eq!(o.summary, "2/3 build(s) failed");
    }

    #[test]
    fn important_branches_narrow_the_selection() {
        let mut f = Fixture::standard();
        let b3 = f.commit("b3", Some("c1"), Some(Verdict::Failed));
        f.build(b3, true, Some(false));

        let o = overview(&project(&[]), &f.commits, &f.builds);
        assert_eq!(o.summary, "1/4 build(s) failed");

        let o = overview(&project(&["b1", "b2"]), &f.commits, &f.builds);
        assert_eq!(o.summary, "all builds successful");

        let o = overview(&project(&["b3"]), &f.commits, &f.builds);
        assert_eq!(o.summary, "1/1 build(s) failed");
    }

    #[test]
    fn running_and_pending_builds_are_counted_project_wide() {
        let mut f = Fixture::standard();
        let building = f.commit("b2", Some("c2"), None);
        f.build(building, true, None);
        f.build(building, true, None);
        let pending = f.commit("c3", None, None);
        f.build(pending, false, None);

        let o = overview(&project(&[]), &f.commits, &f.builds);
        assert_eq!(o.summary, "all builds successful");
        assert_eq!(o.active_builds, 2);
        assert_eq!(o.pending_builds, 1);
    }

    #[test]
    fn branches_follow_branch_order_then_the_rest() {
        let mut f = Fixture::new();
        for branch in ["zeta", "master", "alpha"] {
            f.commit(branch, Some("c"), None);
        }
        assert_eq!(
            branches_ordered(&project(&[]), &f.commits),
            vec!["master", "alpha", "zeta"]
        );
        assert_eq!(
            branches_ordered(&project(&["zeta", "missing"]), &f.commits),
            vec!["zeta", "alpha", "master"]
        );
    }

    #[test]
    fn branch_summary_tracks_latest_stable_and_unfinished() {
        let mut f = Fixture::new();
        let good = f.commit("master", Some("c1"), Some(Verdict::Successful));
        f.build(good, true, Some(true));
        let bad = f.commit("master", Some("c2"), Some(Verdict::Failed));
        f.build(bad, true, Some(false));
        let running = f.commit("master", Some("c3"), None);
        f.build(running, true, None);
        f.build(running, false, None);
        // Revision not yet resolved: not listed as unfinished.
        f.commit("master", None, None);

        let summaries = branch_summaries(&project(&[]), &f.commits, &f.builds);
        assert_eq!(summaries.len(), 1);
        let master = &summaries[0];
        assert_eq!(master.latest.as_ref().map(|c| c.id), Some(bad));
        assert_eq!(master.latest_stable.as_ref().map(|c| c.id), Some(good));
        assert_eq!(master.unfinished.iter().map(|c| c.id).collect::<Vec<_>>(), vec![running]);
        assert_eq!(master.unfinished_builds.get(&BuildState::Active), Some(&1));
        assert_eq!(master.unfinished_builds.get(&BuildState::Pending), Some(&1));
    }
}
