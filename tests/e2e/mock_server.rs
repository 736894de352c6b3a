//! Mock MCP servers for end-to-end tests.
//!
//! Each mock is a POSIX sh script written to a temp directory. Request ids
//! are allocated deterministically (starting at 1), so a script can reply
//! positionally: read a line, print the canned response for that point in
//! the exchange.

use mcplink::config::{ServerConfig, TransportConfig};
use mcplink::Framing;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const INIT_RESULT: &str = r#"{"protocolVersion":"2024-11-05","capabilities":{"tools":{"listChanged":true}},"serverInfo":{"name":"mock-mcp","version":"0.0.1"}}"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Config launching a script through `sh` (no exec bit needed).
pub fn sh_config(script: &Path, framing: Framing) -> ServerConfig {
    ServerConfig {
        command: "sh".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
        cwd: None,
        env: HashMap::new(),
        transport: TransportConfig {
            kind: Default::default(),
            framing,
        },
    }
}

/// Config for a command that does not exist anywhere.
pub fn missing_command_config() -> ServerConfig {
    ServerConfig {
        command: "definitely-not-a-real-command-12345".to_string(),
        args: Vec::new(),
        cwd: None,
        env: HashMap::new(),
        transport: TransportConfig::default(),
    }
}

/// ndjson server exposing `mock_echo` and `mock_sum`; `tools/call` answers
/// with the text "5".
pub fn tool_server_script() -> String {
    let tools = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"mock_echo","description":"Echo back the provided message","inputSchema":{"type":"object","properties":{"message":{"type":"string"}},"required":["message"]}},{"name":"mock_sum","description":"Sum two numbers","inputSchema":{"type":"object","properties":{"a":{"type":"number"},"b":{"type":"number"}},"required":["a","b"]}}]}}"#;
    let call = r#"{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"5"}]}}"#;
    format!(
        "#!/bin/sh\n\
         read -r line\n\
         printf '%s\\n' '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{INIT_RESULT}}}'\n\
         read -r line\n\
         read -r line\n\
         printf '%s\\n' '{tools}'\n\
         read -r line\n\
         printf '%s\\n' '{call}'\n\
         read -r line\n"
    )
}

/// ndjson server whose `tools/list` pages across two cursor-linked calls.
pub fn paging_server_script() -> String {
    let page_one =
        r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"page_one_tool"}],"nextCursor":"page-2"}}"#;
    let page_two = r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"page_two_tool"}]}}"#;
    format!(
        "#!/bin/sh\n\
         read -r line\n\
         printf '%s\\n' '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{INIT_RESULT}}}'\n\
         read -r line\n\
         read -r line\n\
         printf '%s\\n' '{page_one}'\n\
         read -r line\n\
         printf '%s\\n' '{page_two}'\n\
         read -r line\n"
    )
}

/// ndjson server that completes the handshake, then swallows every later
/// request without answering.
pub fn silent_after_handshake_script() -> String {
    format!(
        "#!/bin/sh\n\
         read -r line\n\
         printf '%s\\n' '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{INIT_RESULT}}}'\n\
         read -r line\n\
         while read -r line; do :; done\n"
    )
}

/// Server answering the handshake only; enough for start()/start_all tests.
pub fn handshake_only_script() -> String {
    format!(
        "#!/bin/sh\n\
         read -r line\n\
         printf '%s\\n' '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{INIT_RESULT}}}'\n\
         while read -r line; do :; done\n"
    )
}

/// Line-oriented server driven by a content-length client.
///
/// A content-length frame has no trailing newline, so each message the
/// client writes completes the previous dangling body into one line and
/// adds a header line plus a blank separator line. Counting reads:
/// initialize = 2 lines, then `initialized` + `tools/list` = 4 more.
pub fn content_length_client_script() -> String {
    let tools = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"framed_tool"}]}}"#;
    format!(
        "#!/bin/sh\n\
         read -r a\n\
         read -r b\n\
         printf '%s\\n' '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{INIT_RESULT}}}'\n\
         read -r c\n\
         read -r d\n\
         read -r e\n\
         read -r f\n\
         printf '%s\\n' '{tools}'\n\
         read -r g\n"
    )
}
