//! Built-in plugins and the start-up registration list.
//!
//! Each plugin contributes one builder or one build hook source to the
//! registry. `CI_PLUGINS` selects a subset; by default all are loaded.

use std::sync::Arc;

use crate::config::CiConfig;
use crate::error::RegistryError;
use crate::services::builders::{CommandBuilder, ShellBuilder};
use crate::services::hooks::{DebugHook, GitHubPushHook, PollHook};
use crate::services::registry::PluginRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: &'static str,
    pub summary: &'static str,
}

pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    fn register(&self, registry: &PluginRegistry);
}

/// `shell`: runs the configuration parameters as a script.
struct ShellPlugin {
    shell: String,
}

impl Plugin for ShellPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "shell",
            summary: "Run the configuration parameters as a shell script",
        }
    }

    fn register(&self, registry: &PluginRegistry) {
        let shell = self.shell.clone();
        registry.register_builder("shell", move || Arc::new(ShellBuilder::new(shell.clone())));
    }
}

/// Builders running a fixed command line (`tox`, `unittest2`).
struct CommandPlugin {
    name: &'static str,
    summary: &'static str,
    argv: &'static [&'static str],
}

impl Plugin for CommandPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name,
            summary: self.summary,
        }
    }

    fn register(&self, registry: &PluginRegistry) {
        let argv = self.argv;
        registry.register_builder(self.name, move || Arc::new(CommandBuilder::new(argv.iter().copied())));
    }
}

struct GitHubPlugin {
    secret: String,
}

impl Plugin for GitHubPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "github",
            summary: "GitHub push webhooks",
        }
    }

    fn register(&self, registry: &PluginRegistry) {
        let secret = self.secret.clone();
        registry.register_build_hook_source("github", move || Arc::new(GitHubPushHook::new(secret.clone())));
    }
}

struct DebugPlugin;

impl Plugin for DebugPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "debug",
            summary: "Trigger branches named in the `branches` query parameter",
        }
    }

    fn register(&self, registry: &PluginRegistry) {
        registry.register_build_hook_source("debug", || Arc::new(DebugHook));
    }
}

struct PollPlugin;

impl Plugin for PollPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "poll",
            summary: "Build every branch whose remote tip moved",
        }
    }

    fn register(&self, registry: &PluginRegistry) {
        registry.register_build_hook_source("poll", || Arc::new(PollHook));
    }
}

/// Every plugin shipped with the server, in registration order.
pub fn builtin_plugins(config: &CiConfig) -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(ShellPlugin {
            shell: config.shell.clone(),
        }),
        Box::new(CommandPlugin {
            name: "tox",
            summary: "Run tox in the workspace",
            argv: &["tox"],
        }),
        Box::new(CommandPlugin {
            name: "unittest2",
            summary: "Run Python unittest discovery in the workspace",
            argv: &["python", "-m", "unittest", "discover"],
        }),
        Box::new(GitHubPlugin {
            secret: config.github_webhook_secret.clone(),
        }),
        Box::new(DebugPlugin),
        Box::new(PollPlugin),
    ]
}

/// Build a registry from the plugins selected in `config.plugins`.
pub fn load(config: &CiConfig) -> Result<PluginRegistry, RegistryError> {
    let available = builtin_plugins(config);
    if let Some(unknown) = config
        .plugins
        .iter()
        .find(|name| !available.iter().any(|p| p.info().name == name.as_str()))
    {
        return Err(RegistryError::UnknownPlugin(unknown.clone()));
    }

    let registry = PluginRegistry::new();
    for plugin in available {
        let info = plugin.info();
        if !config.plugins.is_empty() && !config.plugins.iter().any(|n| n == info.name) {
            continue;
        }
        plugin.register(&registry);
        tracing::info!(plugin = info.name, "{}", info.summary);
    }
    tracing::info!(
        builders = ?registry.builder_names(),
        hooks = ?registry.hook_names(),
        "Plugins loaded"
    );
    Ok(registry)
}
