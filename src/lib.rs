//! mcplink: MCP (Model Context Protocol) client runtime.
//!
//! Supervises tool-providing subprocesses that speak JSON-RPC 2.0 over
//! stdio and exposes typed tool discovery and invocation on top. Two wire
//! framings are supported (LSP-style Content-Length headers and
//! newline-delimited JSON); the decoder accepts both opportunistically so a
//! server that misidentifies its framing still works.
//!
//! One supervisor owns one subprocess; a registry aggregates supervisors
//! under string identifiers with bulk start/stop and partial-failure
//! reporting. A misbehaving server never destabilizes its neighbors.

pub mod channel;
pub mod codec;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;

pub use channel::{RpcChannel, RpcError};
pub use codec::Framing;
pub use config::{McpConfig, ServerConfig, TransportConfig, TransportKind};
pub use protocol::{ClientInfo, ContentBlock, ServerInfo, ToolCallResult, ToolDef};
pub use registry::McpRegistry;
pub use server::{McpServer, ServerOptions};
