use async_trait::async_trait;
use aw_error::Result;

use crate::model::{AgentMessage, AgentRecord, ChatRecord, EditErrorEntry, WorldRecord};

/// Storage-backend-agnostic persistence for worlds, agents, chats, and
/// per-chat message memory. Two backends are provided
/// in this crate (`memory_backend`, `file_backend`); the concrete SQLite
/// schema a production deployment would use is an external collaborator
/// here and is not implemented here.
#[async_trait]
pub trait StorageAPI: Send + Sync {
    // --- World CRUD ---
    async fn create_world(&self, world: WorldRecord) -> Result<WorldRecord>;
    async fn get_world_raw(&self, id: &str) -> Result<Option<WorldRecord>>;
    async fn update_world(&self, world: WorldRecord) -> Result<()>;
    async fn delete_world(&self, id: &str) -> Result<()>;
    async fn list_worlds(&self) -> Result<Vec<WorldRecord>>;

    // --- Agent CRUD ---
    async fn create_agent(&self, world_id: &str, agent: AgentRecord) -> Result<AgentRecord>;
    async fn get_agent(&self, world_id: &str, agent_id: &str) -> Result<Option<AgentRecord>>;
    async fn update_agent(&self, world_id: &str, agent: AgentRecord) -> Result<()>;
    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<()>;
    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentRecord>>;

    // --- Chat CRUD (with snapshots: callers get full records, not diffs) ---
    async fn create_chat(&self, chat: ChatRecord) -> Result<ChatRecord>;
    async fn get_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<ChatRecord>>;
    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatRecord>>;
    async fn delete_chat_record(&self, world_id: &str, chat_id: &str) -> Result<()>;
    /// CAS-style rename: only applies `new_name` when the chat's current
    /// name still equals `expected_name`. Returns whether it applied.
    async fn update_chat_name_if_current(
        &self,
        world_id: &str,
        chat_id: &str,
        expected_name: &str,
        new_name: &str,
    ) -> Result<bool>;

    // --- Per-agent memory ---
    async fn get_agent_memory(&self, world_id: &str, agent_id: &str) -> Result<Vec<AgentMessage>>;
    async fn replace_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        messages: Vec<AgentMessage>,
    ) -> Result<()>;
    async fn append_agent_message(
        &self,
        world_id: &str,
        agent_id: &str,
        message: AgentMessage,
    ) -> Result<AgentMessage>;

    /// Returns every message across every agent in `world_id` scoped to
    /// `chat_id`, deduplicated by `messageId` and ordered by insertion
    /// (`createdAt`). Detects legacy rows missing a `messageId`, runs
    /// `migrate_message_ids` if any are found, and re-reads.
    async fn get_memory(&self, world_id: &str, chat_id: &str) -> Result<Vec<AgentMessage>>;

    /// Idempotent backfill: assigns fresh 10-char tokens to any message in
    /// `world_id` missing one. Returns how many were backfilled; a second
    /// call on an already-migrated world returns 0 (`R2`).
    async fn migrate_message_ids(&self, world_id: &str) -> Result<u64>;

    /// Deletes every message scoped to `chat_id` across every agent.
    /// Returns how many were removed.
    async fn delete_memory_by_chat_id(&self, world_id: &str, chat_id: &str) -> Result<u64>;

    /// Best-effort snapshot of an agent's memory before it is cleared.
    /// Failure here is logged by the caller, never surfaced.
    async fn archive_memory(&self, world_id: &str, agent_id: &str, messages: &[AgentMessage]) -> Result<()>;

    async fn validate_integrity(&self, world_id: &str) -> Result<Vec<String>>;
    async fn repair_data(&self, world_id: &str) -> Result<u64>;

    async fn record_edit_error(&self, world_id: &str, entry: EditErrorEntry) -> Result<()>;
    async fn list_edit_errors(&self, world_id: &str) -> Result<Vec<EditErrorEntry>>;
}
