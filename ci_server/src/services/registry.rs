//! Name-keyed registry of builders and build-hook sources.
//!
//! Plugins register factories at startup; projects refer to them by name in
//! their configurations and hook URLs.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::RegistryError;
use crate::services::builders::Builder;
use crate::services::hooks::BuildHookSource;

pub type BuilderFactory = Arc<dyn Fn() -> Arc<dyn Builder> + Send + Sync>;
pub type HookFactory = Arc<dyn Fn() -> Arc<dyn BuildHookSource> + Send + Sync>;

static INSTALLED: OnceLock<Arc<PluginRegistry>> = OnceLock::new();

#[derive(Default)]
pub struct PluginRegistry {
    builders: RwLock<HashMap<String, BuilderFactory>>,
    hooks: RwLock<HashMap<String, HookFactory>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("builders", &self.builder_names())
            .field("hooks", &self.hook_names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder factory, returning whatever it replaced.
    pub fn register_builder<F>(&self, name: impl Into<String>, factory: F) -> Option<BuilderFactory>
    where
        F: Fn() -> Arc<dyn Builder> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(builder = %name, "Registering builder");
        self.builders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(factory))
    }

    pub fn register_build_hook_source<F>(
        &self,
        name: impl Into<String>,
        factory: F,
    ) -> Option<HookFactory>
    where
        F: Fn() -> Arc<dyn BuildHookSource> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(hook = %name, "Registering build hook source");
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(factory))
    }

    pub fn resolve_builder(&self, name: &str) -> Result<Arc<dyn Builder>, RegistryError> {
        let factory = self
            .builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBuilder(name.to_string()))?;
        Ok(factory())
    }

    pub fn resolve_build_hook(&self, name: &str) -> Result<Arc<dyn BuildHookSource>, RegistryError> {
        let factory = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownHook(name.to_string()))?;
        Ok(factory())
    }

    pub fn builder_names(&self) -> Vec<String> {
        sorted_keys(&self.builders)
    }

    pub fn hook_names(&self) -> Vec<String> {
        sorted_keys(&self.hooks)
    }

    /// Register a builder until the returned guard drops, then restore the
    /// previous entry (or remove the name if there was none).
    pub fn scoped_builder<F>(&self, name: &str, factory: F) -> ScopedRegistration<'_>
    where
        F: Fn() -> Arc<dyn Builder> + Send + Sync + 'static,
    {
        let previous = self.register_builder(name, factory);
        ScopedRegistration {
            registry: self,
            name: name.to_string(),
            previous: Previous::Builder(previous),
        }
    }

    pub fn scoped_build_hook<F>(&self, name: &str, factory: F) -> ScopedRegistration<'_>
    where
        F: Fn() -> Arc<dyn BuildHookSource> + Send + Sync + 'static,
    {
        let previous = self.register_build_hook_source(name, factory);
        ScopedRegistration {
            registry: self,
            name: name.to_string(),
            previous: Previous::Hook(previous),
        }
    }

    /// Install `self` as the process-wide registry. Succeeds once per process.
    pub fn install(self) -> Result<Arc<PluginRegistry>, RegistryError> {
        let registry = Arc::new(self);
        INSTALLED
            .set(Arc::clone(&registry))
            .map_err(|_| RegistryError::AlreadyInstalled)?;
        Ok(registry)
    }

    pub fn installed() -> Option<Arc<PluginRegistry>> {
        INSTALLED.get().cloned()
    }
}

fn sorted_keys<V>(map: &RwLock<HashMap<String, V>>) -> Vec<String> {
    let mut names: Vec<String> = map
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

enum Previous {
    Builder(Option<BuilderFactory>),
    Hook(Option<HookFactory>),
}

/// Undoes a scoped registration when dropped.
#[must_use = "the registration is undone as soon as the guard drops"]
pub struct ScopedRegistration<'a> {
    registry: &'a PluginRegistry,
    name: String,
    previous: Previous,
}

impl Drop for ScopedRegistration<'_> {
    fn drop(&mut self) {
        let name = std::mem::take(&mut self.name);
        match std::mem::replace(&mut self.previous, Previous::Builder(None)) {
            Previous::Builder(previous) => {
                let mut builders = self
                    .registry
                    .builders
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                match previous {
                    Some(factory) => builders.insert(name, factory),
                    None => builders.remove(&name),
                };
            }
            Previous::Hook(previous) => {
                let mut hooks = self
                    .registry
                    .hooks
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                match previous {
                    Some(factory) => hooks.insert(name, factory),
                    None => hooks.remove(&name),
                };
            }
        }
    }
}
