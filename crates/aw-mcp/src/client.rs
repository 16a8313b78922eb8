use std::time::Duration;

use aw_error::{Error, Result};
use rand::Rng;
use rmcp::model::CallToolRequestParam;
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::{ConfigureCommandExt, child_process::TokioChildProcess};
use rmcp::{RoleClient, transport::SseClientTransport, transport::StreamableHttpClientTransport};
use tokio::process::Command;
use tracing::warn;

use crate::types::{Transport, ToolDescriptor, ToolResult};

/// Bounded exponential-backoff-with-jitter parameters for
/// `connect_with_backoff`: base 500ms doubling up to a 4th
/// attempt, capped at 8s, plus up to 250ms of jitter — the same shape
/// teacher's `spawn_with_backoff` uses for subprocess supervision.
const MAX_CONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 8_000;

/// A connected MCP client. Owns the running transport; dropping it without
/// calling `close` leaks the subprocess/socket, so callers always route
/// disposal through `close`. Cheaply cloneable (the underlying
/// `RunningService` is itself a cheap handle), which lets the registry hand
/// out a handle without holding a lock across an `await`.
#[derive(Clone)]
pub struct McpClient {
    inner: RunningService<RoleClient, ()>,
}

impl McpClient {
    #[tracing::instrument(skip(transport), fields(kind = transport_kind(transport)))]
    pub async fn connect(transport: &Transport) -> Result<Self> {
        let inner = match transport {
            Transport::Stdio { command, args, env } => {
                preflight_stdio_command(command)?;
                let env = env.clone();
                let args = args.clone();
                let child = TokioChildProcess::new(Command::new(command).configure(move |cmd| {
                    cmd.args(&args);
                    for (k, v) in &env {
                        cmd.env(k, v);
                    }
                }))
                .map_err(|e| Error::MCPTransportError(format!("spawn failed: {e}")))?;
                ().serve(child)
                    .await
                    .map_err(|e| Error::MCPTransportError(format!("handshake failed: {e}")))?
            }
            Transport::Sse { url, .. } => {
                let transport = SseClientTransport::start(url.clone())
                    .await
                    .map_err(|e| Error::MCPTransportError(format!("sse connect failed: {e}")))?;
                ().serve(transport)
                    .await
                    .map_err(|e| Error::MCPTransportError(format!("handshake failed: {e}")))?
            }
            Transport::StreamableHttp { url, .. } => {
                let transport = StreamableHttpClientTransport::from_uri(url.clone());
                ().serve(transport)
                    .await
                    .map_err(|e| Error::MCPTransportError(format!("http connect failed: {e}")))?
            }
        };
        Ok(Self { inner })
    }

    /// Connects with bounded exponential backoff and jitter, health-checking
    /// each attempt with `list_tools` before accepting it (mirrors the
    /// teacher's `spawn_with_backoff` + initial health check). Used for the
    /// first connect of a fresh server instance, where a flaky subprocess
    /// or slow-starting endpoint shouldn't fail the whole registration on
    /// the first hiccup.
    #[tracing::instrument(skip(transport), fields(kind = transport_kind(transport)))]
    pub async fn connect_with_backoff(transport: &Transport) -> Result<Self> {
        let mut attempt: u32 = 0;
        let mut last_err = None;
        loop {
            match Self::connect(transport).await {
                Ok(client) => match client.list_tools().await {
                    Ok(_) => return Ok(client),
                    Err(e) => {
                        warn!(attempt, error = %e, "MCP health check failed, will retry with backoff");
                        let _ = client.close().await;
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "MCP connect failed, will retry with backoff");
                    last_err = Some(e);
                }
            }

            attempt += 1;
            if attempt >= MAX_CONNECT_ATTEMPTS {
                return Err(last_err.unwrap_or_else(|| {
                    Error::MCPTransportError("failed to connect to MCP server".to_string())
                }));
            }
            let backoff_ms = BACKOFF_BASE_MS
                .saturating_mul(1u64 << attempt.min(4))
                .min(BACKOFF_CAP_MS);
            let jitter_ms: u64 = rand::thread_rng().gen_range(0..=250);
            tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let resp = self
            .inner
            .list_tools(Default::default())
            .await
            .map_err(|e| Error::MCPTransportError(format!("list_tools failed: {e}")))?;
        Ok(resp
            .tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                parameters: serde_json::to_value(&t.input_schema).unwrap_or(serde_json::json!({})),
            })
            .collect())
    }

    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolResult> {
        let result = self
            .inner
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))?;

        let is_error = result.is_error.unwrap_or(false);
        let content = result
            .content
            .into_iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolResult { content, is_error })
    }

    pub async fn close(self) -> Result<()> {
        self.inner
            .cancel()
            .await
            .map_err(|e| Error::MCPTransportError(format!("close failed: {e}")))?;
        Ok(())
    }
}

/// If `command` isn't already a path, resolve it on `PATH` first so a
/// missing executable fails fast with a clear message instead of via
/// whatever cryptic error the OS gives `Command::spawn` for ENOENT.
fn preflight_stdio_command(command: &str) -> Result<()> {
    if command.contains(std::path::MAIN_SEPARATOR) {
        return Ok(());
    }
    which::which(command)
        .map(|_| ())
        .map_err(|_| Error::MCPTransportError(format!("command '{command}' not found on PATH")))
}

fn transport_kind(transport: &Transport) -> &'static str {
    match transport {
        Transport::Stdio { .. } => "stdio",
        Transport::Sse { .. } => "sse",
        Transport::StreamableHttp { .. } => "streamable-http",
    }
}

/// Connection-level failures get one reconnect-and-retry; everything else is a plain tool/protocol error.
pub fn classify_transport_error(message: &str) -> Error {
    if is_connection_error(message) {
        Error::MCPTransportError(message.to_string())
    } else {
        Error::MCPToolError(message.to_string())
    }
}

/// Fixed keyword set from this system, matched case-insensitively
/// against the error message (and, where available, its code).
pub fn is_connection_error(message: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "connection closed",
        "connection reset",
        "socket hang up",
        "broken pipe",
        "transport error",
        "cannot call write after a stream was destroyed",
        "econnreset",
        "econnrefused",
        "network connection lost",
        "read epipe",
    ];
    let lower = message.to_lowercase();
    KEYWORDS.iter().any(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_connection_errors_case_insensitively() {
        assert!(is_connection_error("Socket Hang Up"));
        assert!(is_connection_error("ECONNRESET"));
        assert!(is_connection_error("Read EPIPE while writing"));
        assert!(!is_connection_error("invalid arguments for tool 'foo'"));
    }

    #[test]
    fn preflight_rejects_missing_command() {
        let err = preflight_stdio_command("definitely-not-a-real-mcp-server-binary").unwrap_err();
        assert!(matches!(err, Error::MCPTransportError(_)));
    }

    #[test]
    fn preflight_skips_path_like_commands() {
        // A path containing a separator is trusted as-is; missing-file
        // errors surface from the actual spawn instead.
        assert!(preflight_stdio_command("/definitely/not/a/real/path").is_ok());
    }
}
