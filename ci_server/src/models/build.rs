//! ci.build: One execution of one configuration against one commit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Derived lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Pending,
    Active,
    Successful,
    Failed,
}

impl BuildState {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Active => "active",
            BuildState::Successful => "successful",
            BuildState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub commit_id: i64,
    pub configuration_id: i64,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Meaningful only once `finished` is set.
    pub was_successful: Option<bool>,
}

impl Build {
    pub fn state(&self) -> BuildState {
        match (self.started, self.finished, self.was_successful) {
            (_, Some(_), Some(true)) => BuildState::Successful,
            (_, Some(_), _) => BuildState::Failed,
            (Some(_), None, _) => BuildState::Active,
            (None, None, _) => BuildState::Pending,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn duration(&self) -> Option<Duration> {
        Some(self.finished? - self.started?)
    }
}
