//! Registry of named MCP server supervisors.
//!
//! Built from a configuration map; one supervisor per entry, none started
//! at construction time. Aggregate operations iterate servers in
//! lexicographic identifier order.

use crate::config::McpConfig;
use crate::protocol::{ToolCallResult, ToolDef};
use crate::server::{McpServer, ServerOptions};
use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::collections::BTreeMap;

pub struct McpRegistry {
    servers: BTreeMap<String, McpServer>,
    opts: ServerOptions,
}

impl McpRegistry {
    /// Build one supervisor per configured server. Nothing is spawned here.
    pub fn new(config: McpConfig, opts: ServerOptions) -> Self {
        let servers = config
            .servers
            .into_iter()
            .map(|(name, server_config)| {
                let server = McpServer::new(name.clone(), server_config, opts.clone());
                (name, server)
            })
            .collect();
        Self { servers, opts }
    }

    /// Build a registry loading config from the default locations.
    pub fn from_default_config(opts: ServerOptions) -> Self {
        Self::new(McpConfig::load(), opts)
    }

    /// Configured server identifiers, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&McpServer> {
        self.servers.get(name)
    }

    /// Start every server in identifier order.
    ///
    /// With `continue_on_error` false the first failure aborts the call.
    /// With it true every server is attempted and failures come back as
    /// `(identifier, message)` pairs.
    pub async fn start_all(&self, continue_on_error: bool) -> Result<Vec<(String, String)>> {
        let mut failures = Vec::new();
        for (name, server) in &self.servers {
            if let Err(e) = server.start().await {
                let message = format!("{e:#}");
                crate::logging::error(&format!(
                    "failed to start MCP server '{}': {}",
                    name, message
                ));
                if !continue_on_error {
                    return Err(e.context(format!("failed to start MCP server '{}'", name)));
                }
                failures.push((name.clone(), message));
            }
        }
        Ok(failures)
    }

    /// Stop every server concurrently. Stop never fails, so neither can this.
    pub async fn stop_all(&self) {
        futures::future::join_all(self.servers.values().map(|server| server.stop())).await;
    }

    /// List tools for every server, in identifier order.
    ///
    /// Any server's discovery failure fails the aggregate; the error names
    /// every failing server and its underlying message.
    pub async fn list_all_tools(&self) -> Result<BTreeMap<String, Vec<ToolDef>>> {
        let mut all = BTreeMap::new();
        let mut failures: Vec<(String, String)> = Vec::new();
        for (name, server) in &self.servers {
            match server.list_tools().await {
                Ok(tools) => {
                    all.insert(name.clone(), tools);
                }
                Err(e) => failures.push((name.clone(), format!("{e:#}"))),
            }
        }
        if failures.is_empty() {
            Ok(all)
        } else {
            let detail: Vec<String> = failures
                .iter()
                .map(|(name, message)| format!("'{}': {}", name, message))
                .collect();
            bail!("tool discovery failed for {}", detail.join("; "));
        }
    }

    /// List tools for one server.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDef>> {
        self.must_get(server)?.list_tools().await
    }

    /// Invoke a tool on a named server.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        args: Option<Value>,
    ) -> Result<ToolCallResult> {
        self.must_get(server)?.call_tool(tool, args).await
    }

    /// Stop everything, re-read the default config locations, and rebuild.
    pub async fn reload(&mut self) {
        self.stop_all().await;
        let config = McpConfig::load();
        self.servers = config
            .servers
            .into_iter()
            .map(|(name, server_config)| {
                let server = McpServer::new(name.clone(), server_config, self.opts.clone());
                (name, server)
            })
            .collect();
    }

    fn must_get(&self, name: &str) -> Result<&McpServer> {
        self.servers
            .get(name)
            .ok_or_else(|| anyhow!("unknown MCP server '{}'", name))
    }
}
