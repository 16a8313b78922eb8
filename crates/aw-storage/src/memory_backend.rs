use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use aw_error::{Error, Result};
use tokio::sync::RwLock;

use crate::api::StorageAPI;
use crate::model::{
    new_message_id, AgentMessage, AgentRecord, ChatRecord, EditErrorEntry, WorldRecord,
    EDIT_ERROR_LOG_CAP,
};

/// Non-persistent `StorageAPI` backed entirely by in-process maps. Mirrors
/// the shape of `ploke-tui::app_state`'s `RwLock`-guarded state, minus the
/// TUI-specific fields: every collection here is keyed the way the on-disk
/// backend keys its files, so the two stay interchangeable in tests.
#[derive(Default)]
pub struct MemoryBackend {
    worlds: RwLock<HashMap<String, WorldRecord>>,
    agents: RwLock<HashMap<String, HashMap<String, AgentRecord>>>,
    chats: RwLock<HashMap<String, HashMap<String, ChatRecord>>>,
    memory: RwLock<HashMap<String, HashMap<String, Vec<AgentMessage>>>>,
    archives: RwLock<HashMap<String, Vec<AgentMessage>>>,
    edit_errors: RwLock<HashMap<String, VecDeque<EditErrorEntry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones every map out for persistence. Used by `FileBackend`, which
    /// composes a `MemoryBackend` for its business logic and only adds a
    /// disk-writing step on top.
    pub(crate) async fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            worlds: self.worlds.read().await.clone(),
            agents: self.agents.read().await.clone(),
            chats: self.chats.read().await.clone(),
            memory: self.memory.read().await.clone(),
            edit_errors: self.edit_errors.read().await.clone(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            worlds: RwLock::new(snapshot.worlds),
            agents: RwLock::new(snapshot.agents),
            chats: RwLock::new(snapshot.chats),
            memory: RwLock::new(snapshot.memory),
            archives: RwLock::new(HashMap::new()),
            edit_errors: RwLock::new(snapshot.edit_errors),
        }
    }
}

/// Plain-data mirror of `MemoryBackend`'s maps, serialized verbatim to disk
/// by `FileBackend`.
#[derive(Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemorySnapshot {
    worlds: HashMap<String, WorldRecord>,
    agents: HashMap<String, HashMap<String, AgentRecord>>,
    chats: HashMap<String, HashMap<String, ChatRecord>>,
    memory: HashMap<String, HashMap<String, Vec<AgentMessage>>>,
    edit_errors: HashMap<String, VecDeque<EditErrorEntry>>,
}

#[async_trait]
impl StorageAPI for MemoryBackend {
    async fn create_world(&self, world: WorldRecord) -> Result<WorldRecord> {
        let mut worlds = self.worlds.write().await;
        if worlds.contains_key(&world.id) {
            return Err(Error::Duplicate {
                kind: "world",
                id: world.id,
            });
        }
        worlds.insert(world.id.clone(), world.clone());
        Ok(world)
    }

    async fn get_world_raw(&self, id: &str) -> Result<Option<WorldRecord>> {
        Ok(self.worlds.read().await.get(id).cloned())
    }

    async fn update_world(&self, world: WorldRecord) -> Result<()> {
        let mut worlds = self.worlds.write().await;
        if !worlds.contains_key(&world.id) {
            return Err(Error::WorldNotFound(world.id));
        }
        worlds.insert(world.id.clone(), world);
        Ok(())
    }

    async fn delete_world(&self, id: &str) -> Result<()> {
        self.worlds.write().await.remove(id);
        self.agents.write().await.remove(id);
        self.chats.write().await.remove(id);
        self.memory.write().await.remove(id);
        self.edit_errors.write().await.remove(id);
        Ok(())
    }

    async fn list_worlds(&self) -> Result<Vec<WorldRecord>> {
        Ok(self.worlds.read().await.values().cloned().collect())
    }

    async fn create_agent(&self, world_id: &str, agent: AgentRecord) -> Result<AgentRecord> {
        let mut agents = self.agents.write().await;
        let world_agents = agents.entry(world_id.to_string()).or_default();
        if world_agents.contains_key(&agent.id) {
            return Err(Error::Duplicate {
                kind: "agent",
                id: agent.id,
            });
        }
        world_agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, world_id: &str, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self
            .agents
            .read()
            .await
            .get(world_id)
            .and_then(|m| m.get(agent_id))
            .cloned())
    }

    async fn update_agent(&self, world_id: &str, agent: AgentRecord) -> Result<()> {
        let mut agents = self.agents.write().await;
        let world_agents = agents
            .get_mut(world_id)
            .ok_or_else(|| Error::WorldNotFound(world_id.to_string()))?;
        if !world_agents.contains_key(&agent.id) {
            return Err(Error::AgentNotFound(agent.id));
        }
        world_agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<()> {
        if let Some(world_agents) = self.agents.write().await.get_mut(world_id) {
            world_agents.remove(agent_id);
        }
        if let Some(world_memory) = self.memory.write().await.get_mut(world_id) {
            world_memory.remove(agent_id);
        }
        Ok(())
    }

    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentRecord>> {
        Ok(self
            .agents
            .read()
            .await
            .get(world_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_chat(&self, chat: ChatRecord) -> Result<ChatRecord> {
        let mut chats = self.chats.write().await;
        let world_chats = chats.entry(chat.world_id.clone()).or_default();
        if world_chats.contains_key(&chat.id) {
            return Err(Error::Duplicate {
                kind: "chat",
                id: chat.id,
            });
        }
        world_chats.insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<ChatRecord>> {
        Ok(self
            .chats
            .read()
            .await
            .get(world_id)
            .and_then(|m| m.get(chat_id))
            .cloned())
    }

    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatRecord>> {
        Ok(self
            .chats
            .read()
            .await
            .get(world_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_chat_record(&self, world_id: &str, chat_id: &str) -> Result<()> {
        if let Some(world_chats) = self.chats.write().await.get_mut(world_id) {
            world_chats.remove(chat_id);
        }
        Ok(())
    }

    async fn update_chat_name_if_current(
        &self,
        world_id: &str,
        chat_id: &str,
        expected_name: &str,
        new_name: &str,
    ) -> Result<bool> {
        let mut chats = self.chats.write().await;
        let world_chats = chats
            .get_mut(world_id)
            .ok_or_else(|| Error::WorldNotFound(world_id.to_string()))?;
        let chat = world_chats
            .get_mut(chat_id)
            .ok_or_else(|| Error::ChatNotFound(chat_id.to_string()))?;
        if chat.name != expected_name {
            return Ok(false);
        }
        chat.name = new_name.to_string();
        Ok(true)
    }

    async fn get_agent_memory(&self, world_id: &str, agent_id: &str) -> Result<Vec<AgentMessage>> {
        Ok(self
            .memory
            .read()
            .await
            .get(world_id)
            .and_then(|m| m.get(agent_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        messages: Vec<AgentMessage>,
    ) -> Result<()> {
        self.memory
            .write()
            .await
            .entry(world_id.to_string())
            .or_default()
            .insert(agent_id.to_string(), messages);
        Ok(())
    }

    async fn append_agent_message(
        &self,
        world_id: &str,
        agent_id: &str,
        message: AgentMessage,
    ) -> Result<AgentMessage> {
        let mut memory = self.memory.write().await;
        memory
            .entry(world_id.to_string())
            .or_default()
            .entry(agent_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn get_memory(&self, world_id: &str, chat_id: &str) -> Result<Vec<AgentMessage>> {
        if self.needs_migration(world_id).await {
            self.migrate_message_ids(world_id).await?;
        }
        let memory = self.memory.read().await;
        let mut seen = HashSet::new();
        let mut merged: Vec<AgentMessage> = Vec::new();
        if let Some(world_memory) = memory.get(world_id) {
            for agent_messages in world_memory.values() {
                for msg in agent_messages.iter().filter(|m| m.chat_id == chat_id) {
                    let key = msg.message_id.clone().unwrap_or_default();
                    if seen.insert(key) {
                        merged.push(msg.clone());
                    }
                }
            }
        }
        merged.sort_by_key(|m| m.created_at);
        Ok(merged)
    }

    async fn migrate_message_ids(&self, world_id: &str) -> Result<u64> {
        let mut memory = self.memory.write().await;
        let mut backfilled = 0u64;
        if let Some(world_memory) = memory.get_mut(world_id) {
            for agent_messages in world_memory.values_mut() {
                for msg in agent_messages.iter_mut() {
                    if !msg.has_message_id() {
                        msg.message_id = Some(new_message_id());
                        backfilled += 1;
                    }
                }
            }
        }
        Ok(backfilled)
    }

    async fn delete_memory_by_chat_id(&self, world_id: &str, chat_id: &str) -> Result<u64> {
        let mut memory = self.memory.write().await;
        let mut removed = 0u64;
        if let Some(world_memory) = memory.get_mut(world_id) {
            for agent_messages in world_memory.values_mut() {
                let before = agent_messages.len();
                agent_messages.retain(|m| m.chat_id != chat_id);
                removed += (before - agent_messages.len()) as u64;
            }
        }
        Ok(removed)
    }

    async fn archive_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        messages: &[AgentMessage],
    ) -> Result<()> {
        self.archives
            .write()
            .await
            .insert(format!("{world_id}:{agent_id}"), messages.to_vec());
        Ok(())
    }

    async fn validate_integrity(&self, world_id: &str) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        let agents = self.agents.read().await;
        let known_agents: HashSet<&String> = agents
            .get(world_id)
            .map(|m| m.keys().collect())
            .unwrap_or_default();
        let chats = self.chats.read().await;
        let known_chats: HashSet<&String> = chats
            .get(world_id)
            .map(|m| m.keys().collect())
            .unwrap_or_default();

        let memory = self.memory.read().await;
        let mut seen_ids = HashSet::new();
        if let Some(world_memory) = memory.get(world_id) {
            for (agent_id, messages) in world_memory {
                if !known_agents.contains(agent_id) {
                    problems.push(format!("memory references unknown agent {agent_id}"));
                }
                for msg in messages {
                    if !known_chats.contains(&msg.chat_id) {
                        problems.push(format!(
                            "message {:?} references unknown chat {}",
                            msg.message_id, msg.chat_id
                        ));
                    }
                    if let Some(id) = &msg.message_id {
                        if !seen_ids.insert(id.clone()) {
                            problems.push(format!("duplicate messageId {id}"));
                        }
                    }
                }
            }
        }
        Ok(problems)
    }

    async fn repair_data(&self, world_id: &str) -> Result<u64> {
        let agents = self.agents.read().await;
        let known_agents: HashSet<String> = agents
            .get(world_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        drop(agents);
        let chats = self.chats.read().await;
        let known_chats: HashSet<String> = chats
            .get(world_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        drop(chats);

        let mut repaired = 0u64;
        let mut memory = self.memory.write().await;
        if let Some(world_memory) = memory.get_mut(world_id) {
            world_memory.retain(|agent_id, _| known_agents.contains(agent_id));
            for messages in world_memory.values_mut() {
                let before = messages.len();
                messages.retain(|m| known_chats.contains(&m.chat_id));
                repaired += (before - messages.len()) as u64;
            }
            let mut seen_ids = HashSet::new();
            for messages in world_memory.values_mut() {
                let before = messages.len();
                messages.retain(|m| match &m.message_id {
                    Some(id) => seen_ids.insert(id.clone()),
                    None => true,
                });
                repaired += (before - messages.len()) as u64;
            }
        }
        Ok(repaired)
    }

    async fn record_edit_error(&self, world_id: &str, entry: EditErrorEntry) -> Result<()> {
        let mut edit_errors = self.edit_errors.write().await;
        let log = edit_errors.entry(world_id.to_string()).or_default();
        log.push_back(entry);
        while log.len() > EDIT_ERROR_LOG_CAP {
            log.pop_front();
        }
        Ok(())
    }

    async fn list_edit_errors(&self, world_id: &str) -> Result<Vec<EditErrorEntry>> {
        Ok(self
            .edit_errors
            .read()
            .await
            .get(world_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default())
    }
}

impl MemoryBackend {
    async fn needs_migration(&self, world_id: &str) -> bool {
        self.memory
            .read()
            .await
            .get(world_id)
            .map(|world_memory| {
                world_memory
                    .values()
                    .any(|msgs| msgs.iter().any(|m| !m.has_message_id()))
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_message(chat_id: &str, agent_id: &str, content: &str) -> AgentMessage {
        AgentMessage {
            message_id: None,
            role: crate::model::MessageRole::User,
            content: content.to_string(),
            sender: crate::model::Sender::Human,
            agent_id: agent_id.to_string(),
            chat_id: chat_id.to_string(),
            created_at: Utc::now(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[tokio::test]
    async fn migrate_message_ids_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .append_agent_message("w1", "a1", sample_message("c1", "a1", "hi"))
            .await
            .unwrap();

        let first = backend.migrate_message_ids("w1").await.unwrap();
        assert_eq!(first, 1);
        let second = backend.migrate_message_ids("w1").await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn get_memory_merges_and_dedupes_by_message_id() {
        let backend = MemoryBackend::new();
        let mut msg = sample_message("c1", "a1", "shared");
        msg.message_id = Some("dup1".to_string());
        backend
            .append_agent_message("w1", "a1", msg.clone())
            .await
            .unwrap();
        backend
            .append_agent_message("w1", "a2", msg)
            .await
            .unwrap();
        backend
            .append_agent_message("w1", "a2", sample_message("c1", "a2", "unique"))
            .await
            .unwrap();

        let merged = backend.get_memory("w1", "c1").await.unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn update_chat_name_if_current_rejects_stale_expectation() {
        let backend = MemoryBackend::new();
        backend
            .create_chat(ChatRecord {
                id: "c1".into(),
                world_id: "w1".into(),
                name: "New Chat".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                message_count: 0,
            })
            .await
            .unwrap();

        let applied = backend
            .update_chat_name_if_current("w1", "c1", "stale name", "renamed")
            .await
            .unwrap();
        assert!(!applied);

        let applied = backend
            .update_chat_name_if_current("w1", "c1", "New Chat", "renamed")
            .await
            .unwrap();
        assert!(applied);
    }

    #[tokio::test]
    async fn edit_error_log_is_capped() {
        let backend = MemoryBackend::new();
        for i in 0..150 {
            backend
                .record_edit_error(
                    "w1",
                    EditErrorEntry {
                        message_id: format!("m{i}"),
                        new_content: "x".into(),
                        chat_id: "c1".into(),
                        resubmission_status: "failed".into(),
                        resubmission_error: None,
                        recorded_at: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }
        let log = backend.list_edit_errors("w1").await.unwrap();
        assert_eq!(log.len(), EDIT_ERROR_LOG_CAP);
        assert_eq!(log.front().unwrap().message_id, "m50");
    }
}
