//! Per-child bridge configuration.
//!
//! The configuration UI lives in a separate process and persists a JSON list
//! of [`ChildConfig`] records; the core consumes that list through an
//! in-memory handoff (or, for the CLI, [`load_configs`]). A config is
//! immutable for the lifetime of a running bridge.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// A tool advertised by a child, as captured by discovery.
///
/// `parameters` flattens the tool's `inputSchema.properties` into a
/// `name -> type` map; properties without a usable `type` are recorded as
/// `"any"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Configuration for one bridged child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildConfig {
    /// Unique identifier, assigned by the configuration layer.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Command token: absolute path, relative path, or bare executable name.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child, tilde-expanded at spawn time.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Host the HTTP listener binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Desired listener port; 0 requests an ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// Optional opaque bearer token; when set, GET/POST requests must carry
    /// `Authorization: Bearer <token>`.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Tool set cached from a previous discovery run. When non-empty the
    /// bridge skips the startup discovery handshake.
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    /// Tool names the user has switched off in the UI. Carried for the
    /// configuration layer; the bridge forwards traffic untouched.
    #[serde(default)]
    pub disabled_tools: HashSet<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl ChildConfig {
    /// Minimal config for the given id and command, suitable for tests and
    /// programmatic embedding.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            host: default_host(),
            port: 0,
            bearer_token: None,
            tools: Vec::new(),
            disabled_tools: HashSet::new(),
        }
    }

    /// Validate the fields a bridge depends on.
    ///
    /// The command must be non-empty and the port must be 0 (ephemeral) or
    /// at least 1024; system ports are rejected here, before any bind.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::InvalidConfig {
                id: self.id.clone(),
                reason: "command must not be empty".to_string(),
            });
        }
        if self.port > 0 && self.port < 1024 {
            return Err(BridgeError::PortRestricted { port: self.port });
        }
        Ok(())
    }
}

/// Load a JSON array of [`ChildConfig`] records from disk.
pub fn load_configs(path: &Path) -> Result<Vec<ChildConfig>, BridgeError> {
    let bytes = std::fs::read(path).map_err(|e| BridgeError::ConfigLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let configs: Vec<ChildConfig> =
        serde_json::from_slice(&bytes).map_err(|e| BridgeError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    for config in &configs {
        config.validate()?;
    }
    Ok(configs)
}
