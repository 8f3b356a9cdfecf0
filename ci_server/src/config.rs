//! CI orchestrator configuration: loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::models::project::parse_branch_list;

#[derive(Clone, Debug)]
pub struct CiConfig {
    /// GitHub webhook secret for HMAC validation. Empty disables validation.
    pub github_webhook_secret: String,
    /// Parent directory for disposable build workspaces.
    pub workspace_dir: PathBuf,
    /// Root directory of the build log blobs.
    pub log_dir: PathBuf,
    /// Upper bound on one build command. `None` waits indefinitely.
    pub build_timeout: Option<Duration>,
    /// Maximum number of builds executing at once.
    pub max_concurrent_builds: usize,
    /// Shell used by the `shell` builder.
    pub shell: String,
    /// Plugins to register at start. Empty means every built-in plugin.
    pub plugins: Vec<String>,
    /// Optional JSON file with projects to load at start.
    pub projects_file: Option<PathBuf>,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            github_webhook_secret: String::new(),
            workspace_dir: std::env::temp_dir(),
            log_dir: PathBuf::from("./build-logs"),
            build_timeout: Some(Duration::from_secs(3600)),
            max_concurrent_builds: 4,
            shell: "/bin/sh".to_string(),
            plugins: Vec::new(),
            projects_file: None,
        }
    }
}

impl CiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let github_webhook_secret = var("CI_WEBHOOK_SECRET").unwrap_or_default();
        let workspace_dir = var("CI_WORKSPACE_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_dir);
        let log_dir = var("CI_LOG_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);
        let build_timeout = match var("CI_BUILD_TIMEOUT").and_then(|s| s.parse::<u64>().ok()) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.build_timeout,
        };
        let max_concurrent_builds = var("CI_MAX_CONCURRENT")
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.max_concurrent_builds);
        let shell = var("CI_SHELL")
            .or_else(|| var("SHELL"))
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.shell);
        let plugins = var("CI_PLUGINS")
            .map(|s| parse_branch_list(&s))
            .unwrap_or_default();
        let projects_file = var("CI_PROJECTS_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        if github_webhook_secret.is_empty() {
            tracing::warn!("CI_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if build_timeout.is_none() {
            tracing::warn!("CI_BUILD_TIMEOUT is 0 -- build commands may run forever");
        }

        Self {
            github_webhook_secret,
            workspace_dir,
            log_dir,
            build_timeout,
            max_concurrent_builds,
            shell,
            plugins,
            projects_file,
        }
    }
}
