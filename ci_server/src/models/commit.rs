//! ci.commit: One observed revision on one branch, and its aggregated verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::Build;

/// Maximum length of a stored commit subject.
pub const SHORT_MESSAGE_LEN: usize = 100;

/// Terminal outcome of a commit. `None` on the commit means unfinished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Successful,
    Failed,
}

impl Verdict {
    /// Roll build outcomes up into a commit verdict.
    ///
    /// Returns `None` while any build is unfinished, and for an empty set.
    pub fn from_builds<'a>(builds: impl IntoIterator<Item = &'a Build>) -> Option<Verdict> {
        let mut any = false;
        let mut failed = false;
        for build in builds {
            any = true;
            match build.was_successful {
                _ if build.finished.is_none() => return None,
                Some(true) => {}
                _ => failed = true,
            }
        }
        match (any, failed) {
            (false, _) => None,
            (true, true) => Some(Verdict::Failed),
            (true, false) => Some(Verdict::Successful),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Successful => "successful",
            Verdict::Failed => "failed",
        }
    }
}

/// Lifecycle position of a commit, derived from its verdict and builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Active,
    Successful,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: i64,
    pub project_id: i64,
    pub created_at: DateTime<Utc>,
    pub branch: String,
    pub vcs_id: Option<String>,
    pub short_message: String,
    pub verdict: Option<Verdict>,
}

impl Commit {
    pub fn is_finished(&self) -> bool {
        self.verdict.is_some()
    }

    pub fn short_vcs_id(&self) -> Option<&str> {
        self.vcs_id.as_deref().map(|id| match id.char_indices().nth(7) {
            Some((end, _)) => &id[..end],
            None => id,
        })
    }

    pub fn state<'a>(&self, builds: impl IntoIterator<Item = &'a Build>) -> CommitState {
        match self.verdict {
            Some(Verdict::Successful) => CommitState::Successful,
            Some(Verdict::Failed) => CommitState::Failed,
            None if builds.into_iter().any(|b| b.started.is_some()) => CommitState::Active,
            None => CommitState::Pending,
        }
    }
}

impl std::fmt::Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.branch, self.vcs_id.as_deref().unwrap_or("(unknown)"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewCommit {
    pub project_id: i64,
    pub branch: String,
    pub vcs_id: Option<String>,
    pub short_message: String,
}

/// First line of a commit message, cut to [`SHORT_MESSAGE_LEN`] characters.
pub fn short_message(message: &str) -> String {
    message
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .chars()
        .take(SHORT_MESSAGE_LEN)
        .collect()
}
