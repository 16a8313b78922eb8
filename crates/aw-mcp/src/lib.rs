#![doc = r#"
aw-mcp — MCP server registry: subprocess lifecycle with retry/backoff,
schema normalization for cross-provider compatibility, a TTL/hash-invalidated
tool cache, and tool-call dispatch with reconnect-once-on-transport-error.

Subprocess management is built on `rmcp`'s client/transport layer, with a
spawn-with-backoff supervisor around each configured server.
"#]

mod cache;
mod client;
mod config;
mod registry;
mod schema;
pub mod types;

pub use cache::{ToolCache, ToolCacheEntry, DEFAULT_TTL, MAX_ENTRIES};
pub use client::{classify_transport_error, is_connection_error, McpClient};
pub use config::{parse_mcp_config, server_id};
pub use registry::{sanitize_server_name, MCPRegistry, MCPServerInstance, IDLE_SHUTDOWN_DELAY};
pub use schema::{coerce_arguments, normalize_schema, remap_ollama_dollar_arg};
pub use types::{ServerConfig, ServerId, ServerStatus, ToolDescriptor, ToolResult, Transport};
