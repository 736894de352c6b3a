//! Supervisor for a single MCP server subprocess.
//!
//! Owns the process lifecycle: spawn, initialize handshake, tool
//! discovery/invocation, forcible stop. `start()` is single-flight:
//! concurrent callers join one in-flight attempt. The handshake races
//! against spawn failure, premature exit, and a fixed deadline; the first
//! to settle wins.

use crate::channel::{MessageObserver, RpcChannel};
use crate::config::ServerConfig;
use crate::logging::LogSink;
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, ServerCapabilities,
    ServerInfo, ToolCallParams, ToolCallResult, ToolDef, ToolsListResult,
};
use anyhow::{anyhow, Context, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};

/// Protocol version sent in the initialize handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Deadline for the whole initialize handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Options shared by every supervisor a registry builds.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Root against which a server's `cwd` is resolved. Defaults to the
    /// process working directory.
    pub root_dir: Option<PathBuf>,
    /// Client identification sent during the handshake.
    pub client_info: Option<ClientInfo>,
    /// Diagnostic sink for wire traffic, stderr, and lifecycle lines.
    pub sink: Option<LogSink>,
}

type SharedStart = Shared<BoxFuture<'static, Result<(), String>>>;

#[derive(Default)]
struct StartSlot {
    generation: u64,
    in_flight: Option<SharedStart>,
}

/// Live process state. Dropping it drops `kill_tx`, which makes the reaper
/// task terminate the subprocess.
struct Active {
    rpc: Arc<RpcChannel>,
    server_info: Option<ServerInfo>,
    capabilities: ServerCapabilities,
    #[allow(dead_code)]
    kill_tx: oneshot::Sender<()>,
}

/// Supervises one MCP server subprocess.
pub struct McpServer {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: ServerConfig,
    opts: ServerOptions,
    start: std::sync::Mutex<StartSlot>,
    active: Mutex<Option<Active>>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, config: ServerConfig, opts: ServerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                opts,
                start: std::sync::Mutex::new(StartSlot::default()),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the subprocess and complete the handshake.
    ///
    /// Idempotent and safe to call concurrently: callers arriving while a
    /// start is in flight await the same attempt. After a successful start
    /// this resolves immediately; after a failed one the slate is wiped and
    /// the next call begins a fresh lifecycle.
    pub async fn start(&self) -> Result<()> {
        let (fut, generation) = {
            let mut slot = self.start_slot();
            match &slot.in_flight {
                Some(fut) => (fut.clone(), slot.generation),
                None => {
                    slot.generation += 1;
                    let generation = slot.generation;
                    let inner = Arc::clone(&self.inner);
                    let fut = async move { start_impl(inner).await.map_err(|e| format!("{e:#}")) }
                        .boxed()
                        .shared();
                    slot.in_flight = Some(fut.clone());
                    (fut, generation)
                }
            }
        };

        match fut.await {
            Ok(()) => Ok(()),
            Err(message) => {
                let mut slot = self.start_slot();
                // A failed attempt unlatches so a later start can retry;
                // don't clear an attempt newer than the one that failed.
                if slot.generation == generation {
                    slot.in_flight = None;
                }
                Err(anyhow!(message))
            }
        }
    }

    /// Whether the last start attempt completed its handshake.
    pub fn is_ready(&self) -> bool {
        let slot = self.start_slot();
        slot.in_flight
            .as_ref()
            .and_then(|fut| fut.peek())
            .is_some_and(|outcome| outcome.is_ok())
    }

    /// Stop the subprocess and reset state. Never fails, including on a
    /// supervisor that was never started or is already stopped.
    pub async fn stop(&self) {
        {
            let mut slot = self.start_slot();
            slot.in_flight = None;
            slot.generation += 1;
        }
        let active = self.inner.active.lock().await.take();
        if let Some(active) = active {
            active.rpc.clear_observers();
            // Dropping the handle terminates the subprocess via the reaper.
            drop(active);
        }
    }

    /// Info the server reported during the handshake, if started.
    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .and_then(|active| active.server_info.clone())
    }

    /// Capabilities the server reported during the handshake.
    pub async fn capabilities(&self) -> ServerCapabilities {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.capabilities.clone())
            .unwrap_or_default()
    }

    /// Register an observer for unsolicited messages from this server.
    pub async fn observe(&self, observer: MessageObserver) -> Result<()> {
        self.rpc().await?.observe(observer);
        Ok(())
    }

    /// List every tool the server exposes, following cursor paging.
    pub async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        self.start().await?;
        let rpc = self.rpc().await?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = rpc
                .request("tools/list", Some(params))
                .await
                .with_context(|| {
                    format!("tools/list failed for MCP server '{}'", self.inner.name)
                })?;
            let page: ToolsListResult = serde_json::from_value(result).with_context(|| {
                format!(
                    "malformed tools/list response from MCP server '{}'",
                    self.inner.name
                )
            })?;
            tools.extend(page.tools);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(tools)
    }

    /// Invoke a named tool. Absent arguments are sent as `{}`; the result is
    /// returned as the server produced it, `isError` flag and all.
    pub async fn call_tool(&self, tool: &str, arguments: Option<Value>) -> Result<ToolCallResult> {
        self.start().await?;
        let rpc = self.rpc().await?;
        let params = ToolCallParams {
            name: tool.to_string(),
            arguments: arguments.unwrap_or_else(|| json!({})),
        };
        let result = rpc
            .request("tools/call", Some(serde_json::to_value(&params)?))
            .await
            .with_context(|| {
                format!(
                    "tools/call '{}' failed on MCP server '{}'",
                    tool, self.inner.name
                )
            })?;
        let parsed: ToolCallResult = serde_json::from_value(result).with_context(|| {
            format!(
                "malformed tools/call response from MCP server '{}'",
                self.inner.name
            )
        })?;
        Ok(parsed)
    }

    async fn rpc(&self) -> Result<Arc<RpcChannel>> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.rpc))
            .ok_or_else(|| anyhow!("MCP server '{}' is not started", self.inner.name))
    }

    fn start_slot(&self) -> std::sync::MutexGuard<'_, StartSlot> {
        match self.inner.start.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn sink_line(sink: &Option<LogSink>, line: &str) {
    if let Some(sink) = sink {
        sink(line);
    }
}

async fn start_impl(inner: Arc<Inner>) -> Result<()> {
    let name = inner.name.clone();
    let config = &inner.config;
    let sink = inner.opts.sink.clone();

    let root = match &inner.opts.root_dir {
        Some(root) => root.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let cwd = match &config.cwd {
        Some(rel) => root.join(rel),
        None => root,
    };

    sink_line(
        &sink,
        &format!(
            "[{}] spawn: {}{} (cwd={})",
            name,
            config.command,
            if config.args.is_empty() {
                String::new()
            } else {
                format!(" {}", config.args.join(" "))
            },
            cwd.display()
        ),
    );

    // Inherited environment plus the per-server overlay
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(config.env.clone());

    let spawned = Command::new(&config.command)
        .args(&config.args)
        .current_dir(&cwd)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if sink.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            sink_line(&sink, &format!("[{}] spawn error: {}", name, e));
            return Err(e).with_context(|| {
                format!("failed to spawn MCP server '{}': {}", name, config.command)
            });
        }
    };

    let stdin = child
        .stdin
        .take()
        .with_context(|| format!("MCP server '{}' has no stdin pipe", name))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("MCP server '{}' has no stdout pipe", name))?;

    // Forward stderr lines to the diagnostic sink
    if let (Some(sink), Some(stderr)) = (sink.clone(), child.stderr.take()) {
        let stderr_name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink(&format!("[{} stderr] {}", stderr_name, line.trim_end()));
            }
        });
    }

    let rpc_sink: Option<LogSink> = sink.clone().map(|sink| {
        let rpc_name = name.clone();
        Arc::new(move |line: &str| sink(&format!("[{} rpc] {}", rpc_name, line))) as LogSink
    });
    let rpc = Arc::new(RpcChannel::new(
        stdout,
        stdin,
        config.transport.framing,
        rpc_sink,
    ));

    // The reaper owns the child: it reports a natural exit, and kills the
    // process when the Active handle is dropped.
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel::<String>();
    {
        let reaper_sink = sink.clone();
        let reaper_name = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let detail = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => format!("wait failed: {e}"),
                    };
                    sink_line(&reaper_sink, &format!("[{}] exited ({})", reaper_name, detail));
                    let _ = exit_tx.send(detail);
                }
                _ = &mut kill_rx => {
                    let _ = child.kill().await;
                    sink_line(&reaper_sink, &format!("[{}] killed", reaper_name));
                }
            }
        });
    }

    // Park the handle before the handshake so stop() can reap the process
    // even if the handshake never completes.
    {
        let mut active = inner.active.lock().await;
        *active = Some(Active {
            rpc: Arc::clone(&rpc),
            server_info: None,
            capabilities: ServerCapabilities::default(),
            kill_tx,
        });
    }

    let outcome = tokio::select! {
        // An exit that has already been observed beats the handshake's own
        // stream-closed rejection for error clarity.
        biased;
        exited = exit_rx => {
            let detail = exited.unwrap_or_else(|_| "unknown".to_string());
            Err(anyhow!("MCP server '{}' exited before ready ({})", name, detail))
        }
        init = handshake(&inner, &rpc) => init,
        _ = tokio::time::sleep(HANDSHAKE_TIMEOUT) => {
            Err(anyhow!(
                "MCP server '{}' initialize timeout after {}s",
                name,
                HANDSHAKE_TIMEOUT.as_secs()
            ))
        }
    };

    match outcome {
        Ok(init) => {
            let mut active = inner.active.lock().await;
            if let Some(active) = active.as_mut() {
                active.server_info = init.server_info;
                active.capabilities = init.capabilities;
            }
            Ok(())
        }
        // The process (live or not) stays parked for stop() to reap.
        Err(e) => Err(e),
    }
}

async fn handshake(inner: &Inner, rpc: &RpcChannel) -> Result<InitializeResult> {
    let client_info = inner.opts.client_info.clone().unwrap_or_else(|| ClientInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });
    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info,
    };

    let result = rpc
        .request("initialize", Some(serde_json::to_value(&params)?))
        .await
        .with_context(|| format!("MCP server '{}' initialize failed", inner.name))?;

    // Acknowledge before any other traffic
    rpc.notify("initialized", Some(json!({}))).await?;

    Ok(serde_json::from_value(result).unwrap_or_default())
}
