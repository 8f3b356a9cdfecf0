//! ci.build.configuration: A named build definition owned by a project.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfiguration {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    /// Key into the builder registry.
    pub builder: String,
    /// Branch allowlist; empty matches every branch.
    pub branches: Vec<String>,
    /// Builder-specific input, e.g. the script body for the shell builder.
    pub parameters: Option<String>,
}

impl BuildConfiguration {
    /// Decide whether this configuration applies to `branch`.
    pub fn should_build_branch(&self, branch: &str) -> bool {
        self.branches.is_empty() || self.branches.iter().any(|b| b == branch)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewBuildConfiguration {
    pub name: String,
    pub builder: String,
    #[serde(default, deserialize_with = "super::project::branch_list")]
    pub branches: Vec<String>,
    #[serde(default)]
    pub parameters: Option<String>,
}
