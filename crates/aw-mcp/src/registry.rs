use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aw_error::{Error, Result};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::cache::ToolCache;
use crate::client::{classify_transport_error, McpClient};
use crate::config::{parse_mcp_config, server_id};
use crate::types::{ServerConfig, ServerId, ServerStatus, ToolDescriptor, ToolResult};

/// Delay between a server's `referenceCount` reaching zero and it actually
/// being stopped. Re-registration inside the window
/// cancels the pending shutdown.
pub const IDLE_SHUTDOWN_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MCPServerInstance {
    pub id: ServerId,
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub reference_count: u32,
    pub associated_worlds: HashSet<String>,
    pub started_at: Option<Instant>,
    pub last_health_check: Option<Instant>,
    pub client: Option<McpClient>,
    /// Bumped every time the instance transitions away from a pending
    /// shutdown, so a previously scheduled shutdown task can tell it has
    /// been superseded and should not stop a server that was reclaimed.
    pub generation: u64,
}

/// Process-global registry of MCP servers referenced by worlds. Two
/// responsibilities are kept distinct: refcounted server *instances*
/// (subprocess lifecycle, shared by config hash) and a separate tool
/// *cache* (discovery + execution handles, keyed by sanitized server
/// name).
pub struct MCPRegistry {
    instances: DashMap<ServerId, MCPServerInstance>,
    pub(crate) cache: ToolCache,
}

impl Default for MCPRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MCPRegistry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            cache: ToolCache::new(),
        }
    }

    /// Registers (or references) a server for a world. Reuses a running
    /// instance when `config` hashes the same as one already known.
    #[instrument(skip(self, config), fields(world_id))]
    pub async fn register_mcp_server(
        &self,
        config: ServerConfig,
        world_id: &str,
    ) -> Result<ServerId> {
        let id = server_id(&config);

        if let Some(mut entry) = self.instances.get_mut(&id) {
            entry.reference_count += 1;
            entry.associated_worlds.insert(world_id.to_string());
            entry.generation += 1; // cancels any pending idle shutdown
            info!(server_id = %id, refs = entry.reference_count, "reused existing MCP server instance");
            return Ok(id);
        }

        let mut instance = MCPServerInstance {
            id: id.clone(),
            config: config.clone(),
            status: ServerStatus::Starting,
            reference_count: 1,
            associated_worlds: HashSet::from([world_id.to_string()]),
            started_at: None,
            last_health_check: None,
            client: None,
            generation: 0,
        };

        match McpClient::connect_with_backoff(&config.transport).await {
            Ok(client) => {
                instance.status = ServerStatus::Running;
                instance.started_at = Some(Instant::now());
                instance.last_health_check = Some(Instant::now());
                instance.client = Some(client);
            }
            Err(e) => {
                instance.status = ServerStatus::Error;
                self.instances.insert(id.clone(), instance);
                return Err(e);
            }
        }

        self.instances.insert(id.clone(), instance);
        info!(server_id = %id, "started MCP server instance");
        Ok(id)
    }

    /// Decrements the reference count for `server_id` on behalf of
    /// `world_id`. Schedules idle shutdown 30s out once the count hits
    /// zero; a re-registration inside the window aborts it (generation
    /// check).
    #[instrument(skip(self))]
    pub fn unregister_mcp_server(self: &Arc<Self>, server_id: &ServerId, world_id: &str) {
        let Some(mut entry) = self.instances.get_mut(server_id) else {
            return;
        };
        entry.associated_worlds.remove(world_id);
        entry.reference_count = entry.reference_count.saturating_sub(1);

        if entry.reference_count == 0 {
            let generation = entry.generation;
            let registry = Arc::clone(self);
            let id = server_id.clone();
            drop(entry);
            tokio::spawn(async move {
                tokio::time::sleep(IDLE_SHUTDOWN_DELAY).await;
                registry.try_idle_shutdown(&id, generation).await;
            });
        }
    }

    async fn try_idle_shutdown(&self, id: &ServerId, expected_generation: u64) {
        let should_stop = match self.instances.get(id) {
            Some(entry) => entry.reference_count == 0 && entry.generation == expected_generation,
            None => false,
        };
        if !should_stop {
            return; // reregistered (or already gone) inside the idle window
        }
        let Some((_, mut instance)) = self.instances.remove(id) else {
            return;
        };
        instance.status = ServerStatus::Stopping;
        if let Some(client) = instance.client.take() {
            if let Err(e) = client.close().await {
                warn!(server_id = %id, error = %e, "error stopping idle MCP server");
            }
        }
        info!(server_id = %id, "stopped idle MCP server instance");
    }

    pub fn instance_status(&self, id: &ServerId) -> Option<ServerStatus> {
        self.instances.get(id).map(|e| e.status)
    }

    pub fn reference_count(&self, id: &ServerId) -> u32 {
        self.instances
            .get(id)
            .map(|e| e.reference_count)
            .unwrap_or(0)
    }

    /// Loads the world's MCP config, resolves every server's tool set
    /// (cache hit, or populate on miss), and returns every tool keyed by
    /// the sanitized server name.
    pub async fn get_mcp_tools_for_world(
        &self,
        mcp_config_raw: &str,
    ) -> Result<Vec<(String, ToolDescriptor)>> {
        let configs = parse_mcp_config(mcp_config_raw)?;
        let mut tools = Vec::new();
        for config in &configs {
            let hash = server_id(config);
            let key = sanitize_server_name(&config.name);

            if self.cache.get_if_valid(&key, &hash).is_none() {
                self.cache.populate(key.clone(), config, hash).await?;
            }
            for tool in self.cache.all_tools(&key) {
                tools.push((key.clone(), tool));
            }
        }
        Ok(tools)
    }

    /// Executes a tool call against a cached server connection,
    /// reconnecting and retrying exactly once on a connection-level error.
    #[instrument(skip(self, arguments))]
    pub async fn call_tool(
        &self,
        server_key: &str,
        config: &ServerConfig,
        server_hash: &ServerId,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolResult> {
        if self.cache.get_if_valid(server_key, server_hash).is_none() {
            self.cache
                .populate(server_key.to_string(), config, server_hash.clone())
                .await?;
        }

        let client = self
            .cache
            .client(server_key)
            .ok_or_else(|| Error::MCPTransportError(format!("no client for '{server_key}'")))?;

        match client.call_tool(tool_name, arguments.clone()).await {
            Ok(result) if result.is_error => Err(Error::MCPToolError(result.content)),
            Ok(result) => Ok(result),
            Err(Error::MCPTransportError(msg)) => {
                self.reconnect(server_key, config).await?;
                let fresh = self
                    .cache
                    .client(server_key)
                    .ok_or_else(|| Error::MCPTransportError(msg.clone()))?;
                match fresh.call_tool(tool_name, arguments).await {
                    Ok(result) if result.is_error => Err(Error::MCPToolError(result.content)),
                    Ok(result) => Ok(result),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Closes and reopens the cached connection for `server_key`. A single
    /// in-flight mutex collapses concurrent callers into one reconnect.
    async fn reconnect(&self, server_key: &str, config: &ServerConfig) -> Result<()> {
        let Some(lock) = self.cache.reconnect_lock(server_key) else {
            return Err(Error::MCPTransportError(format!(
                "no cache entry for '{server_key}' to reconnect"
            )));
        };
        let _guard = lock.lock().await;

        // Another caller may have already reconnected while we waited for
        // the lock; a fresh, valid client means there is nothing to do.
        if let Some(client) = self.cache.client(server_key) {
            if client.list_tools().await.is_ok() {
                return Ok(());
            }
        }

        if let Some(old) = self.cache.client(server_key) {
            let _ = old.close().await;
        }
        let new_client = McpClient::connect(&config.transport)
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))?;
        self.cache.replace_client(server_key, Arc::new(new_client));
        Ok(())
    }

    /// Stops every server, disposes every cache entry — closing client
    /// handles even when `close` fails, so nothing leaks — and clears both
    /// maps.
    pub async fn shutdown_all(&self) {
        let ids: Vec<ServerId> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, mut instance)) = self.instances.remove(&id) {
                instance.status = ServerStatus::Stopping;
                if let Some(client) = instance.client.take() {
                    if let Err(e) = client.close().await {
                        warn!(server_id = %id, error = %e, "error closing MCP client during shutdown");
                    }
                }
            }
        }

        let keys: Vec<String> = self
            .cache
            .all_keys()
            .into_iter()
            .collect();
        for key in keys {
            if let Some(client) = self.cache.client(&key) {
                if let Err(e) = client.close().await {
                    warn!(server_key = %key, error = %e, "error closing cached MCP client during shutdown");
                }
            }
            self.cache.invalidate(&key);
        }
    }
}

/// Sanitizes a server name for use as a cache key / log field: lowercase,
/// non-alphanumerics collapsed to `-`.
pub fn sanitize_server_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for c in name.chars().flat_map(|c| c.to_lowercase()) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_server_names() {
        assert_eq!(sanitize_server_name("My Server!"), "my-server");
        assert_eq!(sanitize_server_name("git"), "git");
    }
}
