use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aw_error::{Error, Result};
use aw_storage::{
    new_message_id, AgentMessage, AgentRecord, AgentStatus, ChatRecord, StorageAPI, WorldRecord,
    DEFAULT_CHAT_TITLE,
};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::event_bus::{CrudEntity, CrudEvent, CrudOperation, EventBus, WorldEvent};
use crate::ids::{kebab_case, resolve_identifier};

/// Runtime handle for one agent inside a hydrated world: the durable
/// record plus its in-memory message buffer, kept in sync with storage
/// on every mutating call.
#[derive(Debug)]
pub struct AgentHandle {
    pub record: RwLock<AgentRecord>,
    pub memory: RwLock<Vec<AgentMessage>>,
}

/// Hydrated per-world state: agents map, chats map, the
/// event bus, `currentChatId`, and the `isProcessing` single-writer guard.
#[derive(Debug)]
pub struct World {
    pub record: RwLock<WorldRecord>,
    pub agents: DashMap<String, Arc<AgentHandle>>,
    pub chats: DashMap<String, ChatRecord>,
    pub event_bus: EventBus,
    pub current_chat_id: RwLock<Option<String>>,
    is_processing: AtomicBool,
    /// Most recent `chat-title-updated` system event title observed per
    /// chat, used by `MessageEditor` to tell an auto-generated title from
    /// a user-edited one.
    last_title_event: DashMap<String, String>,
    subscribed: AtomicBool,
}

impl World {
    /// Records that a `chat-title-updated` system event with `title` was
    /// published for `chat_id`. Whatever publishes that event (a title
    /// generator, out of core scope here) should call this
    /// alongside `event_bus.publish` so the editor's reset check stays
    /// accurate.
    pub fn note_title_event(&self, chat_id: &str, title: &str) {
        self.last_title_event.insert(chat_id.to_string(), title.to_string());
    }

    pub fn last_title_event(&self, chat_id: &str) -> Option<String> {
        self.last_title_event.get(chat_id).map(|v| v.clone())
    }

    /// Idempotently marks every agent as subscribed to this world's event
    /// bus. Agents here subscribe implicitly by
    /// being processed through `AgentProcessor`; this flag exists so
    /// `MessageEditor` has something concrete to check and flip.
    pub fn ensure_subscribed(&self) {
        self.subscribed.store(true, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    /// Acquires the single-writer guard. Returns `false` if already held.
    pub fn begin_processing(&self) -> bool {
        self.is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_processing(&self) {
        self.is_processing.store(false, Ordering::SeqCst);
    }

    async fn guard_mutation(&self) -> Result<()> {
        if self.is_processing() {
            return Err(Error::WorldProcessing);
        }
        Ok(())
    }

    /// Sum of `llmCallCount` across every agent.
    pub async fn total_llm_call_count(&self) -> u64 {
        let mut total = 0u64;
        for entry in self.agents.iter() {
            total += entry.value().record.read().await.llm_call_count;
        }
        total
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateWorldParams {
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub turn_limit: Option<u32>,
    pub main_agent: Option<String>,
    pub chat_llm_provider: Option<String>,
    pub chat_llm_model: Option<String>,
    pub mcp_config: Option<String>,
    pub variables: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateWorldParams {
    pub name: Option<String>,
    pub description: Option<String>,
    pub turn_limit: Option<u32>,
    pub main_agent: Option<Option<String>>,
    pub chat_llm_provider: Option<Option<String>>,
    pub chat_llm_model: Option<Option<String>>,
    pub mcp_config: Option<Option<String>>,
    pub variables: Option<String>,
    pub current_chat_id: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateAgentParams {
    pub id: Option<String>,
    pub name: String,
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub auto_reply: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAgentParams {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<Option<f32>>,
    pub max_tokens: Option<Option<u32>>,
    pub auto_reply: Option<bool>,
    pub status: Option<String>,
}

fn new_chat_id() -> String {
    format!("chat-{:x}-{}", Utc::now().timestamp_millis(), &new_message_id()[..6])
}

/// Manages every hydrated `World` in the process, mediating CRUD through
/// identifier resolution. Grounded on
/// `ploke_tui::app_state::AppState` for the "one struct owns everything,
/// guarded fields behind `RwLock`" shape, generalized from a single
/// process-wide chat history to a map of independently-guarded worlds.
pub struct WorldRuntime {
    storage: Arc<dyn StorageAPI>,
    worlds: DashMap<String, Arc<World>>,
}

impl WorldRuntime {
    pub fn new(storage: Arc<dyn StorageAPI>) -> Self {
        Self {
            storage,
            worlds: DashMap::new(),
        }
    }

    #[instrument(skip(self, params))]
    pub async fn create_world(&self, params: CreateWorldParams) -> Result<Arc<World>> {
        let id = params
            .id
            .map(|raw| kebab_case(&raw))
            .unwrap_or_else(|| kebab_case(&params.name));

        if self.worlds.contains_key(&id) || self.storage.get_world_raw(&id).await?.is_some() {
            return Err(Error::Duplicate { kind: "world", id });
        }

        let now = Utc::now();
        let record = WorldRecord {
            id: id.clone(),
            name: params.name,
            description: params.description,
            turn_limit: params.turn_limit.unwrap_or(WorldRecord::DEFAULT_TURN_LIMIT),
            main_agent: params.main_agent,
            chat_llm_provider: params.chat_llm_provider,
            chat_llm_model: params.chat_llm_model,
            mcp_config: params.mcp_config,
            variables: params.variables.unwrap_or_default(),
            current_chat_id: None,
            created_at: now,
            last_updated: now,
        };
        let record = self.storage.create_world(record).await?;

        let world = Arc::new(World {
            record: RwLock::new(record),
            agents: DashMap::new(),
            chats: DashMap::new(),
            event_bus: EventBus::new(),
            current_chat_id: RwLock::new(None),
            is_processing: AtomicBool::new(false),
            last_title_event: DashMap::new(),
            subscribed: AtomicBool::new(false),
        });
        self.create_default_chat(&world).await?;
        self.worlds.insert(id, world.clone());
        Ok(world)
    }

    /// Resolves `id_or_name`, hydrating the world (agents, chats, a default
    /// chat if none exist) if it is not already in memory.
    #[instrument(skip(self))]
    pub async fn get_world(&self, id_or_name: &str) -> Result<Arc<World>> {
        let direct = kebab_case(id_or_name);
        if let Some(world) = self.worlds.get(&direct) {
            return Ok(world.clone());
        }

        let stored = self.storage.list_worlds().await?;
        let resolved_id = resolve_identifier(
            id_or_name,
            stored.iter(),
            |w| w.id.as_str(),
            |w| w.name.as_str(),
        );
        let record = self
            .storage
            .get_world_raw(&resolved_id)
            .await?
            .ok_or_else(|| Error::WorldNotFound(id_or_name.to_string()))?;

        if let Some(world) = self.worlds.get(&record.id) {
            return Ok(world.clone());
        }

        let agents = self.storage.list_agents(&record.id).await?;
        let agent_map = DashMap::new();
        for agent in agents {
            let memory = self.storage.get_agent_memory(&record.id, &agent.id).await?;
            agent_map.insert(
                agent.id.clone(),
                Arc::new(AgentHandle {
                    record: RwLock::new(agent),
                    memory: RwLock::new(memory),
                }),
            );
        }

        let chats = self.storage.list_chats(&record.id).await?;
        let chat_map = DashMap::new();
        for chat in chats {
            chat_map.insert(chat.id.clone(), chat);
        }

        let current_chat_id = record.current_chat_id.clone();
        let world = Arc::new(World {
            record: RwLock::new(record.clone()),
            agents: agent_map,
            chats: chat_map,
            event_bus: EventBus::new(),
            current_chat_id: RwLock::new(current_chat_id),
            is_processing: AtomicBool::new(false),
            last_title_event: DashMap::new(),
            subscribed: AtomicBool::new(false),
        });

        if world.chats.is_empty() {
            self.create_default_chat(&world).await?;
        }

        self.worlds.insert(record.id.clone(), world.clone());
        Ok(world)
    }

    pub async fn update_world(&self, id_or_name: &str, params: UpdateWorldParams) -> Result<()> {
        let world = self.get_world(id_or_name).await?;
        let mut record = world.record.write().await;
        if let Some(name) = params.name {
            record.name = name;
        }
        if let Some(description) = params.description {
            record.description = description;
        }
        if let Some(turn_limit) = params.turn_limit {
            record.turn_limit = turn_limit;
        }
        if let Some(main_agent) = params.main_agent {
            record.main_agent = main_agent;
        }
        if let Some(provider) = params.chat_llm_provider {
            record.chat_llm_provider = provider;
        }
        if let Some(model) = params.chat_llm_model {
            record.chat_llm_model = model;
        }
        if let Some(mcp_config) = params.mcp_config {
            record.mcp_config = mcp_config;
        }
        if let Some(variables) = params.variables {
            record.variables = variables;
        }
        if let Some(current_chat_id) = params.current_chat_id {
            record.current_chat_id = current_chat_id.clone();
            *world.current_chat_id.write().await = current_chat_id;
        }
        record.last_updated = Utc::now();
        self.storage.update_world(record.clone()).await
    }

    /// Side-effect-free: loads the raw record and deletes it without
    /// hydrating runtime state.
    pub async fn delete_world(&self, id_or_name: &str) -> Result<()> {
        let normalized = kebab_case(id_or_name);
        let id = match self.storage.get_world_raw(&normalized).await? {
            Some(record) => record.id,
            None => {
                let stored = self.storage.list_worlds().await?;
                let resolved = resolve_identifier(
                    id_or_name,
                    stored.iter(),
                    |w| w.id.as_str(),
                    |w| w.name.as_str(),
                );
                self.storage
                    .get_world_raw(&resolved)
                    .await?
                    .ok_or_else(|| Error::WorldNotFound(id_or_name.to_string()))?
                    .id
            }
        };
        self.storage.delete_world(&id).await?;
        self.worlds.remove(&id);
        Ok(())
    }

    pub async fn list_worlds(&self) -> Result<Vec<WorldRecord>> {
        self.storage.list_worlds().await
    }

    async fn create_default_chat(&self, world: &Arc<World>) -> Result<()> {
        let now = Utc::now();
        let chat = ChatRecord {
            id: new_chat_id(),
            world_id: world.record.read().await.id.clone(),
            name: DEFAULT_CHAT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        };
        let chat = self.storage.create_chat(chat).await?;
        *world.current_chat_id.write().await = Some(chat.id.clone());
        {
            let mut record = world.record.write().await;
            record.current_chat_id = Some(chat.id.clone());
            self.storage.update_world(record.clone()).await?;
        }
        world.chats.insert(chat.id.clone(), chat);
        Ok(())
    }

    // --- Agent CRUD: all reject while world.isProcessing ---

    pub async fn create_agent(
        &self,
        world_id: &str,
        params: CreateAgentParams,
    ) -> Result<AgentRecord> {
        let world = self.get_world(world_id).await?;
        world.guard_mutation().await?;

        let id = params.id.unwrap_or_else(|| kebab_case(&params.name));
        if world.agents.contains_key(&id) {
            return Err(Error::Duplicate { kind: "agent", id });
        }

        let record = AgentRecord {
            id: id.clone(),
            name: params.name,
            agent_type: params.agent_type,
            provider: params.provider,
            model: params.model,
            system_prompt: params.system_prompt,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            auto_reply: params.auto_reply.unwrap_or(true),
            status: AgentStatus("idle".to_string()),
            llm_call_count: 0,
            last_active: None,
            last_llm_call: None,
        };
        let world_record_id = world.record.read().await.id.clone();
        let record = self.storage.create_agent(&world_record_id, record).await?;
        world.agents.insert(
            id,
            Arc::new(AgentHandle {
                record: RwLock::new(record.clone()),
                memory: RwLock::new(Vec::new()),
            }),
        );
        Ok(record)
    }

    pub async fn update_agent(
        &self,
        world_id: &str,
        agent_id: &str,
        params: UpdateAgentParams,
    ) -> Result<()> {
        let world = self.get_world(world_id).await?;
        world.guard_mutation().await?;

        let handle = world
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?
            .clone();
        let mut record = handle.record.write().await;
        if let Some(name) = params.name {
            record.name = name;
        }
        if let Some(system_prompt) = params.system_prompt {
            record.system_prompt = system_prompt;
        }
        if let Some(provider) = params.provider {
            record.provider = provider;
        }
        if let Some(model) = params.model {
            record.model = model;
        }
        if let Some(temperature) = params.temperature {
            record.temperature = temperature;
        }
        if let Some(max_tokens) = params.max_tokens {
            record.max_tokens = max_tokens;
        }
        if let Some(auto_reply) = params.auto_reply {
            record.auto_reply = auto_reply;
        }
        if let Some(status) = params.status {
            record.status = AgentStatus(status);
        }
        let world_record_id = world.record.read().await.id.clone();
        self.storage.update_agent(&world_record_id, record.clone()).await
    }

    pub async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<()> {
        let world = self.get_world(world_id).await?;
        world.guard_mutation().await?;
        world.agents.remove(agent_id);
        let world_record_id = world.record.read().await.id.clone();
        self.storage.delete_agent(&world_record_id, agent_id).await
    }

    pub async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentRecord>> {
        let world = self.get_world(world_id).await?;
        world.guard_mutation().await?;
        let mut out = Vec::with_capacity(world.agents.len());
        for entry in world.agents.iter() {
            out.push(entry.value().record.read().await.clone());
        }
        Ok(out)
    }

    pub async fn update_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        messages: Vec<AgentMessage>,
    ) -> Result<()> {
        let world = self.get_world(world_id).await?;
        world.guard_mutation().await?;
        let handle = world
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?
            .clone();
        let world_record_id = world.record.read().await.id.clone();
        self.storage
            .replace_agent_memory(&world_record_id, agent_id, messages.clone())
            .await?;
        *handle.memory.write().await = messages;
        Ok(())
    }

    /// Archives existing memory best-effort, then resets memory and
    /// `llmCallCount`. Archive failure never aborts the
    /// clear.
    pub async fn clear_agent_memory(&self, world_id: &str, agent_id: &str) -> Result<()> {
        let world = self.get_world(world_id).await?;
        world.guard_mutation().await?;
        let handle = world
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?
            .clone();
        let world_record_id = world.record.read().await.id.clone();

        let existing = handle.memory.read().await.clone();
        if let Err(e) = self
            .storage
            .archive_memory(&world_record_id, agent_id, &existing)
            .await
        {
            e.log_and_swallow("clear_agent_memory archive step");
        }

        self.storage
            .replace_agent_memory(&world_record_id, agent_id, Vec::new())
            .await?;
        *handle.memory.write().await = Vec::new();

        let mut record = handle.record.write().await;
        record.llm_call_count = 0;
        self.storage.update_agent(&world_record_id, record.clone()).await
    }

    /// Deletes a chat and its scoped memory:
    /// memory goes first, then the `crud.delete` notification while the id
    /// is still resolvable, then the chat record itself. If the removed chat
    /// was `currentChatId`, the most-recently-updated remaining chat becomes
    /// current; with none left, a fresh default chat is created.
    pub async fn delete_chat(&self, world_id: &str, chat_id: &str) -> Result<()> {
        let world = self.get_world(world_id).await?;
        world.guard_mutation().await?;
        let world_record_id = world.record.read().await.id.clone();

        if !world.chats.contains_key(chat_id) {
            return Err(Error::ChatNotFound(chat_id.to_string()));
        }

        self.storage
            .delete_memory_by_chat_id(&world_record_id, chat_id)
            .await?;
        for entry in world.agents.iter() {
            let mut memory = entry.value().memory.write().await;
            memory.retain(|m| m.chat_id != chat_id);
        }

        world.event_bus.publish(WorldEvent::Crud(CrudEvent {
            operation: CrudOperation::Delete,
            entity: CrudEntity::Chat,
            id: chat_id.to_string(),
            data: None,
        }));

        self.storage.delete_chat_record(&world_record_id, chat_id).await?;
        world.chats.remove(chat_id);

        let was_current = world.current_chat_id.read().await.as_deref() == Some(chat_id);
        if was_current {
            let mut remaining: Vec<ChatRecord> =
                world.chats.iter().map(|e| e.value().clone()).collect();
            remaining.sort_by_key(|c| c.updated_at);
            if let Some(latest) = remaining.pop() {
                *world.current_chat_id.write().await = Some(latest.id.clone());
                let mut record = world.record.write().await;
                record.current_chat_id = Some(latest.id.clone());
                self.storage.update_world(record.clone()).await?;
            } else {
                self.create_default_chat(&world).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_storage::MemoryBackend;

    fn runtime() -> WorldRuntime {
        WorldRuntime::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn create_world_normalizes_id_from_name() {
        let rt = runtime();
        let world = rt
            .create_world(CreateWorldParams {
                name: "Research World".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(world.record.read().await.id, "research-world");

        let fetched = rt.get_world("Research World").await.unwrap();
        assert_eq!(fetched.record.read().await.id, "research-world");
    }

    #[tokio::test]
    async fn get_world_always_has_a_current_chat() {
        let rt = runtime();
        rt.create_world(CreateWorldParams {
            name: "W".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let world = rt.get_world("w").await.unwrap();
        assert!(world.current_chat_id.read().await.is_some());
        assert_eq!(world.chats.len(), 1);
    }

    #[tokio::test]
    async fn agent_mutation_rejected_while_processing() {
        let rt = runtime();
        rt.create_world(CreateWorldParams {
            name: "W".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let world = rt.get_world("w").await.unwrap();
        assert!(world.begin_processing());

        let result = rt
            .create_agent(
                "w",
                CreateAgentParams {
                    name: "Helper".into(),
                    agent_type: "assistant".into(),
                    provider: "openai".into(),
                    model: "gpt".into(),
                    system_prompt: String::new(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::WorldProcessing)));

        world.end_processing();
        let result = rt
            .create_agent(
                "w",
                CreateAgentParams {
                    name: "Helper".into(),
                    agent_type: "assistant".into(),
                    provider: "openai".into(),
                    model: "gpt".into(),
                    system_prompt: String::new(),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn duplicate_world_id_rejected() {
        let rt = runtime();
        rt.create_world(CreateWorldParams {
            name: "W".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let result = rt
            .create_world(CreateWorldParams {
                name: "W".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::Duplicate { .. })));
    }
}
