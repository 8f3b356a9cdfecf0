//! Project seeder: loads projects and their build configurations from JSON.
//!
//! The file holds a list of projects, each with an optional
//! `configurations` list. Seeding is idempotent: a project whose slug is
//! already taken is left alone.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::models::build_configuration::NewBuildConfiguration;
use crate::models::project::NewProject;
use crate::services::registry::PluginRegistry;
use crate::store::BuildStore;

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSeed {
    #[serde(flatten)]
    pub project: NewProject,
    #[serde(default)]
    pub configurations: Vec<NewBuildConfiguration>,
}

/// Insert every seed whose slug is not yet known. Returns how many projects
/// were created.
pub async fn seed_projects(
    store: &dyn BuildStore,
    registry: &PluginRegistry,
    seeds: Vec<ProjectSeed>,
) -> anyhow::Result<usize> {
    let builders = registry.builder_names();
    let mut created = 0;

    for seed in seeds {
        if store.find_project_by_slug(&seed.project.slug).await?.is_some() {
            tracing::debug!(project = %seed.project.slug, "Project already present, skipping seed");
            continue;
        }

        let project = store
            .insert_project(seed.project)
            .await
            .context("inserting seeded project")?;
        for configuration in seed.configurations {
            if !builders.contains(&configuration.builder) {
                tracing::warn!(
                    project = %project.slug,
                    configuration = %configuration.name,
                    builder = %configuration.builder,
                    "Configuration refers to an unregistered builder"
                );
            }
            store.insert_configuration(project.id, configuration).await?;
        }

        tracing::info!(project = %project.slug, repo = %project.repo_uri, "Project seeded");
        created += 1;
    }

    Ok(created)
}

pub async fn seed_from_file(
    store: &dyn BuildStore,
    registry: &PluginRegistry,
    path: &Path,
) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading projects file {}", path.display()))?;
    let seeds: Vec<ProjectSeed> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing projects file {}", path.display()))?;
    seed_projects(store, registry, seeds).await
}
