//! Read-only JSON API for projects and builds.

use serde::Serialize;

use crate::models::build::{Build, BuildState};
use crate::models::build_configuration::BuildConfiguration;
use crate::models::commit::Commit;
use crate::models::project::Project;
use crate::store::{BuildStore, LogStore, LogStream, StoreResult};

/// JSON response for a project with its configurations.
#[derive(Debug, Serialize)]
pub struct ProjectJson {
    #[serde(flatten)]
    pub project: Project,
    pub configurations: Vec<BuildConfiguration>,
}

/// JSON response for a build with its logs.
#[derive(Debug, Serialize)]
pub struct BuildJson {
    #[serde(flatten)]
    pub build: Build,
    pub state: BuildState,
    pub duration_ms: Option<i64>,
    pub configuration: String,
    pub commit: Commit,
    pub stdout: String,
    pub stderr: String,
}

pub async fn list_projects(store: &dyn BuildStore) -> StoreResult<Vec<ProjectJson>> {
    let mut projects = Vec::new();
    for project in store.list_projects().await? {
        let configurations = store.configurations_for(project.id).await?;
        projects.push(ProjectJson {
            project,
            configurations,
        });
    }
    Ok(projects)
}

/// Get a build by ID with its commit and both output streams.
pub async fn get_build(
    store: &dyn BuildStore,
    logs: &dyn LogStore,
    build_id: i64,
) -> StoreResult<BuildJson> {
    let build = store.get_build(build_id).await?;
    let commit = store.get_commit(build.commit_id).await?;
    let configuration = store.get_configuration(build.configuration_id).await?;

    Ok(BuildJson {
        state: build.state(),
        duration_ms: build.duration().map(|d| d.num_milliseconds()),
        configuration: configuration.name,
        commit,
        stdout: logs.read(build.id, LogStream::Stdout).await?,
        stderr: logs.read(build.id, LogStream::Stderr).await?,
        build,
    })
}
