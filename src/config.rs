//! MCP server configuration
//!
//! A JSON file mapping server identifiers to launch descriptions. Loaded
//! from `.mcplink/mcp.json` in the project, falling back to
//! `~/.mcplink/mcp.json`. The runtime treats parsed configurations as
//! read-only.

use crate::codec::Framing;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Full MCP configuration file
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// One server's launch description
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, resolved relative to the configured root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Overlay merged onto the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
pub struct TransportConfig {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub framing: Framing,
}

/// stdio is the only supported transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
}

impl McpConfig {
    /// Load config from file
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load from default locations
    pub fn load() -> Self {
        // Try project-local first
        let local = Path::new(".mcplink/mcp.json");
        if local.exists() {
            if let Ok(config) = Self::load_from_file(local) {
                return config;
            }
        }

        // Try global
        if let Some(home) = dirs::home_dir() {
            let global = home.join(".mcplink/mcp.json");
            if global.exists() {
                if let Ok(config) = Self::load_from_file(&global) {
                    return config;
                }
            }
        }

        Self::default()
    }
}
