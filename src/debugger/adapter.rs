//! Contract with the external adapter manager.
//!
//! Discovery and installation of debug adapters live outside the core; the
//! core only asks "how do I reach an adapter of this type" and receives a
//! launcher.

use crate::debugger::error::Error;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// How to obtain a live adapter connection.
#[derive(Debug, Clone)]
pub enum AdapterLauncher {
    /// Spawn a local adapter process and talk DAP over its stdio.
    Spawn {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    },
    /// Connect to an adapter already listening on `host:port`.
    Tcp { host: String, port: u16 },
}

/// Adapter lookup, implemented by the embedding application.
pub trait AdapterRegistry: Send + Sync {
    /// Launcher for a debugger type, or `None` when no such adapter is
    /// installed.
    fn launcher(&self, adapter_type: &str) -> Option<AdapterLauncher>;
}

/// Fixed map of adapter types, enough for embedders with a static adapter
/// set and for tests.
#[derive(Default)]
pub struct StaticAdapterRegistry {
    launchers: Mutex<IndexMap<String, AdapterLauncher>>,
}

impl StaticAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter_type: &str, launcher: AdapterLauncher) {
        self.launchers
            .lock()
            .unwrap()
            .insert(adapter_type.to_string(), launcher);
    }
}

impl AdapterRegistry for StaticAdapterRegistry {
    fn launcher(&self, adapter_type: &str) -> Option<AdapterLauncher> {
        self.launchers.lock().unwrap().get(adapter_type).cloned()
    }
}

pub(crate) fn resolve_launcher(
    registry: &dyn AdapterRegistry,
    adapter_type: &str,
) -> Result<AdapterLauncher, Error> {
    registry
        .launcher(adapter_type)
        .ok_or_else(|| Error::AdapterNotFound(adapter_type.to_string()))
}
