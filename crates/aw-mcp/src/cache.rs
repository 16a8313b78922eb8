use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aw_error::Result;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::client::McpClient;
use crate::schema::normalize_schema;
use crate::types::{ServerConfig, ServerId, ToolDescriptor};

/// Default TTL for a tool-cache entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// Cache capacity; entries beyond this are evicted oldest-first.
pub const MAX_ENTRIES: usize = 100;

/// One server's cached, normalized tool set plus the connection used to
/// reach it. `reconnect_lock` gates concurrent reconnect attempts so two
/// callers racing on the same stale connection collapse into one
/// reconnect.
pub struct ToolCacheEntry {
    pub tools: HashMap<String, ToolDescriptor>,
    pub cached_at: Instant,
    pub server_config_hash: ServerId,
    pub ttl: Duration,
    pub client: Arc<McpClient>,
    pub reconnect_lock: Arc<AsyncMutex<()>>,
}

impl ToolCacheEntry {
    pub fn is_valid(&self, current_hash: &ServerId) -> bool {
        &self.server_config_hash == current_hash && self.cached_at.elapsed() <= self.ttl
    }
}

/// Process-wide cache, keyed by sanitized server name.
#[derive(Default)]
pub struct ToolCache {
    entries: DashMap<String, ToolCacheEntry>,
    /// Insertion order, oldest first, for the size-based eviction rule.
    order: AsyncMutex<Vec<String>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_if_valid(&self, key: &str, current_hash: &ServerId) -> Option<Arc<McpClient>> {
        self.entries
            .get(key)
            .filter(|e| e.is_valid(current_hash))
            .map(|e| e.client.clone())
    }

    /// Populates a miss: connects an ephemeral client, lists tools,
    /// normalizes every schema, and stores the entry. Evicts the oldest
    /// entry first if this insertion would exceed `MAX_ENTRIES`.
    pub async fn populate(
        &self,
        key: String,
        config: &ServerConfig,
        server_hash: ServerId,
    ) -> Result<()> {
        let client = McpClient::connect(&config.transport).await?;
        let raw_tools = client.list_tools().await?;

        let mut tools = HashMap::with_capacity(raw_tools.len());
        for mut tool in raw_tools {
            tool.parameters = normalize_schema(&tool.parameters);
            tools.insert(tool.name.clone(), tool);
        }

        let entry = ToolCacheEntry {
            tools,
            cached_at: Instant::now(),
            server_config_hash: server_hash,
            ttl: DEFAULT_TTL,
            client: Arc::new(client),
            reconnect_lock: Arc::new(AsyncMutex::new(())),
        };

        self.insert(key, entry).await;
        Ok(())
    }

    async fn insert(&self, key: String, entry: ToolCacheEntry) {
        if !self.entries.contains_key(&key) {
            let mut order = self.order.lock().await;
            order.push(key.clone());
            if order.len() > MAX_ENTRIES {
                let oldest = order.remove(0);
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, entry);
    }

    pub fn tool(&self, server_key: &str, tool_name: &str) -> Option<ToolDescriptor> {
        self.entries
            .get(server_key)
            .and_then(|e| e.tools.get(tool_name).cloned())
    }

    pub fn all_tools(&self, server_key: &str) -> Vec<ToolDescriptor> {
        self.entries
            .get(server_key)
            .map(|e| e.tools.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn client(&self, server_key: &str) -> Option<Arc<McpClient>> {
        self.entries.get(server_key).map(|e| e.client.clone())
    }

    pub fn reconnect_lock(&self, server_key: &str) -> Option<Arc<AsyncMutex<()>>> {
        self.entries.get(server_key).map(|e| e.reconnect_lock.clone())
    }

    /// Swaps in a freshly reconnected client and refreshes `cached_at`.
    pub fn replace_client(&self, server_key: &str, client: Arc<McpClient>) {
        if let Some(mut entry) = self.entries.get_mut(server_key) {
            entry.client = client;
            entry.cached_at = Instant::now();
        }
    }

    pub fn invalidate(&self, server_key: &str) {
        self.entries.remove(server_key);
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ttl_is_one_hour() {
        assert_eq!(DEFAULT_TTL, Duration::from_secs(3600));
    }
}
