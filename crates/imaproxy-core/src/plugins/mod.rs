//! Plugin system
//!
//! Plugins observe and rewrite proxied traffic by subscribing to the two
//! per-connection event buses. The built-in plugins are compiled in and
//! selected by name in the configuration; a name that does not resolve is
//! logged and skipped.

pub mod capability;
pub mod folder_filter;

use crate::bus::EventBus;
use crate::session::Session;
use imaproxy_common::config::PluginConfig;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use capability::CapabilityRewriter;
pub use folder_filter::FolderFilter;

/// Plugin error types
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),
}

/// What a plugin gets to work with for one accepted connection
pub struct PluginContext {
    /// Bus for client-to-server traffic
    pub client_bus: Arc<EventBus>,
    /// Bus for server-to-client traffic
    pub server_bus: Arc<EventBus>,
    /// Let plugins log internal state
    pub debug_log: bool,
}

/// A traffic-rewriting plugin.
///
/// `attach` runs once per accepted connection, before any bytes flow, and
/// registers the plugin's listeners on the buses. Everything a plugin
/// keeps per session lives in the session's extension bag or in state the
/// registered closures capture.
pub trait ProxyPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn attach(&self, ctx: &PluginContext, session: &mut Session);
}

/// The plugins attached to every accepted connection, in order
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn ProxyPlugin>>,
}

impl PluginRegistry {
    /// Resolve the configured plugin names against the built-in set.
    /// Unresolvable names are logged and skipped.
    pub fn from_config(config: &PluginConfig) -> Self {
        let mut plugins: Vec<Arc<dyn ProxyPlugin>> = Vec::new();
        for name in &config.enabled {
            match Self::resolve(name) {
                Ok(plugin) => {
                    info!("Loaded plugin {}", plugin.name());
                    plugins.push(plugin);
                }
                Err(e) => warn!("Skipping plugin: {}", e),
            }
        }
        Self { plugins }
    }

    fn resolve(name: &str) -> Result<Arc<dyn ProxyPlugin>, PluginError> {
        match name {
            "capability-rewriter" => Ok(Arc::new(CapabilityRewriter)),
            "folder-filter" => Ok(Arc::new(FolderFilter)),
            other => Err(PluginError::NotFound(other.to_string())),
        }
    }

    /// Attach every plugin to a fresh connection's buses
    pub fn attach_all(&self, ctx: &PluginContext, session: &mut Session) {
        for plugin in &self.plugins {
            plugin.attach(ctx, session);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}
