//! Registry of constructed plugin instances.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use haven_common::Metadata;

use crate::contract::{ArchiverPlugin, PluginInfo};

enum PluginState {
    Registered,
    Initialized,
    /// `initialize` failed; the plugin stays unavailable and discovery is
    /// never attempted against it.
    Failed,
}

struct PluginEntry {
    plugin: Arc<dyn ArchiverPlugin>,
    state: PluginState,
}

/// Holds every registered plugin, keyed by `PluginInfo.name`, and drives
/// their initialize/configure/shutdown lifecycle.
#[derive(Default)]
pub struct PluginManager {
    plugins: Mutex<HashMap<String, PluginEntry>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin instance, optionally applying configuration first.
    /// Re-registering a name replaces the previous instance.
    pub async fn register(&self, plugin: Arc<dyn ArchiverPlugin>, config: Option<Metadata>) {
        let name = plugin.info().name;
        if let Some(config) = config {
            plugin.configure(config).await;
        }
        let mut plugins = self.plugins.lock().await;
        if plugins
            .insert(
                name.clone(),
                PluginEntry {
                    plugin,
                    state: PluginState::Registered,
                },
            )
            .is_some()
        {
            warn!(plugin = %name, "Replaced already-registered plugin");
        } else {
            info!(plugin = %name, "Registered plugin");
        }
    }

    /// Get an initialized plugin by name. Initializes lazily on first use;
    /// returns None for unknown plugins and for plugins whose
    /// initialization failed.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn ArchiverPlugin>> {
        let mut plugins = self.plugins.lock().await;
        let entry = plugins.get_mut(name)?;

        match entry.state {
            PluginState::Initialized => Some(entry.plugin.clone()),
            PluginState::Failed => None,
            PluginState::Registered => match entry.plugin.initialize().await {
                Ok(()) => {
                    entry.state = PluginState::Initialized;
                    Some(entry.plugin.clone())
                }
                Err(e) => {
                    error!(plugin = name, error = %e, "Plugin initialization failed");
                    entry.state = PluginState::Failed;
                    None
                }
            },
        }
    }

    /// Merge configuration into an already-registered plugin.
    pub async fn configure(&self, name: &str, config: Metadata) -> bool {
        let plugin = {
            let plugins = self.plugins.lock().await;
            match plugins.get(name) {
                Some(entry) => entry.plugin.clone(),
                None => return false,
            }
        };
        plugin.configure(config).await;
        true
    }

    pub async fn list(&self) -> Vec<PluginInfo> {
        let plugins = self.plugins.lock().await;
        plugins.values().map(|entry| entry.plugin.info()).collect()
    }

    /// Best-effort shutdown of every initialized plugin.
    pub async fn shutdown_all(&self) {
        let mut plugins = self.plugins.lock().await;
        for (name, entry) in plugins.iter_mut() {
            if matches!(entry.state, PluginState::Initialized) {
                entry.plugin.shutdown().await;
                entry.state = PluginState::Registered;
                info!(plugin = %name, "Plugin shut down");
            }
        }
    }
}
