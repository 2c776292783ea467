//! Plugin capability registry.
//!
//! Optional, independently-versioned behavior per job kind, exposed as
//! `(plugin name, feature name) -> capability` lookups. The core never
//! depends on a specific plugin at build time: plugins hand the registry a
//! [`CapabilityTable`] at startup, and absence of a plugin (or of a
//! feature within one) degrades gracefully to "feature unavailable" - it
//! is never an error, and a panic inside plugin code is recovered at this
//! boundary.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use dashmap::DashMap;

use crate::error::{CradleResult, ValidationError};

/// The fixed set of plugin names the daemon recognizes. Several of these
/// are declared but have no in-tree implementation; lookups against them
/// simply report the feature unavailable.
pub const KNOWN_PLUGINS: &[&str] = &["runc", "containerd", "crio", "kata", "slurm", "gpu"];

/// A named, typed feature a plugin may export.
pub struct Feature<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Feature<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// The capabilities one plugin exports, keyed by feature name. A value
/// stored under the wrong type is indistinguishable from an absent one at
/// lookup time, which is exactly the graceful degradation we want.
#[derive(Default)]
pub struct CapabilityTable {
    entries: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: export `value` under `feature`.
    pub fn provide<T: Send + Sync + 'static>(mut self, feature: &Feature<T>, value: T) -> Self {
        self.entries.insert(feature.name, Box::new(value));
        self
    }

    fn get<T: 'static>(&self, feature: &Feature<T>) -> Option<&T> {
        self.entries.get(feature.name)?.downcast_ref::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Loads a capability table from a discovered plugin module. The symbol
/// resolution mechanism (dlopen, static linkage, test stubs) stays behind
/// this trait so the core and its tests never depend on it.
pub trait PluginLoader: Send + Sync {
    fn load(&self, name: &str, path: &Path) -> CradleResult<CapabilityTable>;
}

/// Registry of loaded plugins. Built once at startup; read-mostly after.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, CapabilityTable>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin's capability table. Only recognized plugin
    /// names are accepted.
    pub fn register(&self, name: &str, table: CapabilityTable) -> CradleResult<()> {
        if !KNOWN_PLUGINS.contains(&name) {
            return Err(ValidationError::UnrecognizedPlugin {
                name: name.to_string(),
            }
            .into());
        }
        tracing::info!(plugin = name, "plugin registered");
        self.plugins.insert(name.to_string(), table);
        Ok(())
    }

    /// Discover plugin modules under `dir` and load them. Discovery
    /// failures (missing file, load error) leave that plugin absent and
    /// are never fatal to the daemon.
    pub fn discover(&self, loader: &dyn PluginLoader, dir: &Path) {
        for name in KNOWN_PLUGINS {
            let path = dir.join(format!("libcradle-{name}.so"));
            if !path.exists() {
                tracing::debug!(plugin = name, "plugin module not present");
                continue;
            }
            match loader.load(name, &path) {
                Ok(table) => {
                    if let Err(e) = self.register(name, table) {
                        tracing::warn!(plugin = name, error = %e, "plugin registration failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(plugin = name, error = %e, "plugin load failed, leaving absent");
                }
            }
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|r| r.key().clone()).collect()
    }

    /// Look up a feature in a specific plugin. `None` means the plugin is
    /// absent, exports no such feature, or exports it under a different
    /// type - all equivalent to "unavailable". Never panics.
    pub fn lookup<T: Clone + 'static>(&self, plugin: &str, feature: &Feature<T>) -> Option<T> {
        self.plugins.get(plugin)?.value().get(feature).cloned()
    }

    /// Invoke `fn` with the first matching plugin's capability, if any.
    /// `filter` restricts which plugins are consulted (empty = all).
    /// Returns `Ok(None)` when the feature is unavailable - including
    /// when the plugin's own code panics, which is recovered here rather
    /// than crashing the daemon.
    pub fn if_available<T, R, F>(
        &self,
        feature: &Feature<T>,
        f: F,
        filter: &[&str],
    ) -> CradleResult<Option<R>>
    where
        T: Clone + 'static,
        F: FnOnce(&str, T) -> CradleResult<R>,
    {
        let found = self
            .plugins
            .iter()
            .filter(|r| filter.is_empty() || filter.contains(&r.key().as_str()))
            .find_map(|r| {
                let cap = r.value().get(feature).cloned()?;
                Some((r.key().clone(), cap))
            });

        let Some((name, cap)) = found else {
            return Ok(None);
        };

        match catch_unwind(AssertUnwindSafe(|| f(&name, cap))) {
            Ok(result) => result.map(Some),
            Err(_) => {
                tracing::warn!(
                    plugin = %name,
                    feature = feature.name(),
                    "plugin panicked; treating feature as unavailable"
                );
                Ok(None)
            }
        }
    }
}
