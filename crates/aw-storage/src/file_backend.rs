use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aw_error::{Error, Result};
use tokio::sync::Mutex as AsyncMutex;

use crate::api::StorageAPI;
use crate::memory_backend::{MemoryBackend, MemorySnapshot};
use crate::model::{AgentMessage, AgentRecord, ChatRecord, EditErrorEntry, WorldRecord};

const STATE_FILE: &str = "state.json";

/// File-based `StorageAPI`. Composes a `MemoryBackend` for all business
/// logic and adds a single JSON document on disk (`state.json`, written
/// via a temp-file-then-rename to avoid truncated reads on crash). This
/// trades per-world file granularity for simplicity, matching the scope
/// of the file-based persistence this system asks for instead of a
/// real embedded database.
pub struct FileBackend {
    path: PathBuf,
    inner: MemoryBackend,
    io_lock: AsyncMutex<()>,
}

impl FileBackend {
    /// Opens (creating if absent) a JSON store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        let path = dir.join(STATE_FILE);

        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::StorageUnavailable(format!("corrupt state file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemorySnapshot::default(),
            Err(e) => return Err(Error::StorageUnavailable(e.to_string())),
        };

        Ok(Self {
            path,
            inner: MemoryBackend::from_snapshot(snapshot),
            io_lock: AsyncMutex::new(()),
        })
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.io_lock.lock().await;
        let snapshot = self.inner.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StorageAPI for FileBackend {
    async fn create_world(&self, world: WorldRecord) -> Result<WorldRecord> {
        let created = self.inner.create_world(world).await?;
        self.persist().await?;
        Ok(created)
    }

    async fn get_world_raw(&self, id: &str) -> Result<Option<WorldRecord>> {
        self.inner.get_world_raw(id).await
    }

    async fn update_world(&self, world: WorldRecord) -> Result<()> {
        self.inner.update_world(world).await?;
        self.persist().await
    }

    async fn delete_world(&self, id: &str) -> Result<()> {
        self.inner.delete_world(id).await?;
        self.persist().await
    }

    async fn list_worlds(&self) -> Result<Vec<WorldRecord>> {
        self.inner.list_worlds().await
    }

    async fn create_agent(&self, world_id: &str, agent: AgentRecord) -> Result<AgentRecord> {
        let created = self.inner.create_agent(world_id, agent).await?;
        self.persist().await?;
        Ok(created)
    }

    async fn get_agent(&self, world_id: &str, agent_id: &str) -> Result<Option<AgentRecord>> {
        self.inner.get_agent(world_id, agent_id).await
    }

    async fn update_agent(&self, world_id: &str, agent: AgentRecord) -> Result<()> {
        self.inner.update_agent(world_id, agent).await?;
        self.persist().await
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<()> {
        self.inner.delete_agent(world_id, agent_id).await?;
        self.persist().await
    }

    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentRecord>> {
        self.inner.list_agents(world_id).await
    }

    async fn create_chat(&self, chat: ChatRecord) -> Result<ChatRecord> {
        let created = self.inner.create_chat(chat).await?;
        self.persist().await?;
        Ok(created)
    }

    async fn get_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<ChatRecord>> {
        self.inner.get_chat(world_id, chat_id).await
    }

    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatRecord>> {
        self.inner.list_chats(world_id).await
    }

    async fn delete_chat_record(&self, world_id: &str, chat_id: &str) -> Result<()> {
        self.inner.delete_chat_record(world_id, chat_id).await?;
        self.persist().await
    }

    async fn update_chat_name_if_current(
        &self,
        world_id: &str,
        chat_id: &str,
        expected_name: &str,
        new_name: &str,
    ) -> Result<bool> {
        let applied = self
            .inner
            .update_chat_name_if_current(world_id, chat_id, expected_name, new_name)
            .await?;
        if applied {
            self.persist().await?;
        }
        Ok(applied)
    }

    async fn get_agent_memory(&self, world_id: &str, agent_id: &str) -> Result<Vec<AgentMessage>> {
        self.inner.get_agent_memory(world_id, agent_id).await
    }

    async fn replace_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        messages: Vec<AgentMessage>,
    ) -> Result<()> {
        self.inner
            .replace_agent_memory(world_id, agent_id, messages)
            .await?;
        self.persist().await
    }

    async fn append_agent_message(
        &self,
        world_id: &str,
        agent_id: &str,
        message: AgentMessage,
    ) -> Result<AgentMessage> {
        let appended = self
            .inner
            .append_agent_message(world_id, agent_id, message)
            .await?;
        self.persist().await?;
        Ok(appended)
    }

    async fn get_memory(&self, world_id: &str, chat_id: &str) -> Result<Vec<AgentMessage>> {
        let merged = self.inner.get_memory(world_id, chat_id).await?;
        // get_memory may have triggered an in-place messageId backfill.
        self.persist().await?;
        Ok(merged)
    }

    async fn migrate_message_ids(&self, world_id: &str) -> Result<u64> {
        let backfilled = self.inner.migrate_message_ids(world_id).await?;
        if backfilled > 0 {
            self.persist().await?;
        }
        Ok(backfilled)
    }

    async fn delete_memory_by_chat_id(&self, world_id: &str, chat_id: &str) -> Result<u64> {
        let removed = self.inner.delete_memory_by_chat_id(world_id, chat_id).await?;
        self.persist().await?;
        Ok(removed)
    }

    async fn archive_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        messages: &[AgentMessage],
    ) -> Result<()> {
        self.inner.archive_memory(world_id, agent_id, messages).await?;
        self.persist().await
    }

    async fn validate_integrity(&self, world_id: &str) -> Result<Vec<String>> {
        self.inner.validate_integrity(world_id).await
    }

    async fn repair_data(&self, world_id: &str) -> Result<u64> {
        let repaired = self.inner.repair_data(world_id).await?;
        if repaired > 0 {
            self.persist().await?;
        }
        Ok(repaired)
    }

    async fn record_edit_error(&self, world_id: &str, entry: EditErrorEntry) -> Result<()> {
        self.inner.record_edit_error(world_id, entry).await?;
        self.persist().await
    }

    async fn list_edit_errors(&self, world_id: &str) -> Result<Vec<EditErrorEntry>> {
        self.inner.list_edit_errors(world_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).await.unwrap();
            backend
                .create_world(WorldRecord {
                    id: "w1".into(),
                    name: "test world".into(),
                    description: String::new(),
                    turn_limit: WorldRecord::DEFAULT_TURN_LIMIT,
                    main_agent: None,
                    chat_llm_provider: None,
                    chat_llm_model: None,
                    mcp_config: None,
                    variables: "{}".into(),
                    current_chat_id: None,
                    created_at: Utc::now(),
                    last_updated: Utc::now(),
                })
                .await
                .unwrap();
        }

        let reopened = FileBackend::open(dir.path()).await.unwrap();
        let world = reopened.get_world_raw("w1").await.unwrap();
        assert!(world.is_some());
        assert_eq!(world.unwrap().name, "test world");
    }

    #[tokio::test]
    async fn missing_state_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        assert!(backend.list_worlds().await.unwrap().is_empty());
    }
}
