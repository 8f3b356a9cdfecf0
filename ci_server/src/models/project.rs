//! ci.project: A tracked repository and the branches that matter for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Version-control backend a project is hosted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    #[default]
    Git,
}

impl VcsKind {
    /// Branch assumed to be the main line when a project names no important branches.
    pub fn default_branch(self) -> &'static str {
        match self {
            VcsKind::Git => "master",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub vcs_kind: VcsKind,
    pub repo_uri: String,
    /// Ordered priority list; restricts triggering and drives branch ordering.
    pub important_branches: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Branches listed first when ordering a project's branches.
    pub fn branch_order(&self) -> Vec<String> {
        if self.important_branches.is_empty() {
            vec![self.vcs_kind.default_branch().to_string()]
        } else {
            self.important_branches.clone()
        }
    }

    /// Whether a change on `branch` may trigger builds for this project.
    pub fn accepts_branch(&self, branch: &str) -> bool {
        self.important_branches.is_empty() || self.important_branches.iter().any(|b| b == branch)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub vcs_kind: VcsKind,
    pub repo_uri: String,
    #[serde(default, deserialize_with = "branch_list")]
    pub important_branches: Vec<String>,
}

/// Accepts either a JSON list or a comma separated string (`"main, release"`).
pub(crate) fn branch_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        List(Vec<String>),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::Text(text)) => parse_branch_list(&text),
        Some(Raw::List(list)) => list
            .into_iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect(),
    })
}

/// Split a comma separated branch list, dropping blanks.
pub fn parse_branch_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}
