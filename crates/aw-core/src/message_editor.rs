use std::sync::Arc;

use aw_error::{DomainError, Error, Result};
use aw_storage::{new_message_id, AgentMessage, MessageRole, Sender, StorageAPI};
use chrono::Utc;
use tracing::instrument;

use crate::control::ProcessingControl;
use crate::event_bus::{MessageEvent, WorldEvent};
use crate::world_runtime::{World, WorldRuntime};

/// Outcome of an edit/resubmit cycle.
#[derive(Debug, Clone)]
pub struct RemovalResult {
    pub total_agents: usize,
    pub processed_agents: Vec<String>,
    pub failed_agents: Vec<String>,
    pub messages_removed_total: u64,
    pub resubmission_status: ResubmissionStatus,
    pub new_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubmissionStatus {
    Success,
    NotFound,
    Failed,
}

/// Two-pass cutoff removal across every agent in `world`. First pass finds the earliest
/// `createdAt` for `target_message_id` in `chat_id` across all agents;
/// second pass drops everything at-or-after that timestamp in that chat.
async fn remove_messages_from(
    world: &Arc<World>,
    storage: &Arc<dyn StorageAPI>,
    world_id: &str,
    target_message_id: &str,
    chat_id: &str,
) -> Result<RemovalResult> {
    let total_agents = world.agents.len();
    let mut cutoff = None;
    for entry in world.agents.iter() {
        let memory = entry.value().memory.read().await;
        for msg in memory.iter() {
            if msg.chat_id == chat_id && msg.message_id.as_deref() == Some(target_message_id) {
                cutoff = Some(match cutoff {
                    Some(existing) if existing <= msg.created_at => existing,
                    _ => msg.created_at,
                });
            }
        }
    }

    let Some(cutoff) = cutoff else {
        // Surfaced as a real `DomainError` (logged, not propagated) so
        // `Error::Domain` is reachable outside this module; the public
        // contract here stays `Ok(RemovalResult{NotFound})` so the caller
        // can record it and report it back without treating a missing
        // edit target as a hard failure.
        Error::Domain(DomainError::EditTargetNotFound(target_message_id.to_string()))
            .log_and_swallow("edit_user_message: target message not found");
        return Ok(RemovalResult {
            total_agents,
            processed_agents: Vec::new(),
            failed_agents: Vec::new(),
            messages_removed_total: 0,
            resubmission_status: ResubmissionStatus::NotFound,
            new_message_id: None,
        });
    };

    let mut processed = Vec::new();
    let mut failed = Vec::new();
    let mut removed_total = 0u64;
    for entry in world.agents.iter() {
        let agent_id = entry.key().clone();
        let handle = entry.value().clone();
        let mut memory = handle.memory.write().await;
        let before = memory.len();
        memory.retain(|m| m.chat_id != chat_id || m.created_at < cutoff);
        let removed = before - memory.len();
        removed_total += removed as u64;

        match storage
            .replace_agent_memory(world_id, &agent_id, memory.clone())
            .await
        {
            Ok(()) => processed.push(agent_id),
            Err(_) => failed.push(agent_id),
        }
    }

    Ok(RemovalResult {
        total_agents,
        processed_agents: processed,
        failed_agents: failed,
        messages_removed_total: removed_total,
        resubmission_status: ResubmissionStatus::Success,
        new_message_id: None,
    })
}

/// Implements `editUserMessage`. Grounded on the
/// teacher's chat-history mutation pattern in
/// `ploke_tui::chat_history`/`app_state::commands`, generalized to operate
/// across every agent in a world instead of one flat message list.
pub struct MessageEditor {
    runtime: Arc<WorldRuntime>,
    storage: Arc<dyn StorageAPI>,
    control: Arc<ProcessingControl>,
}

impl MessageEditor {
    pub fn new(
        runtime: Arc<WorldRuntime>,
        storage: Arc<dyn StorageAPI>,
        control: Arc<ProcessingControl>,
    ) -> Self {
        Self {
            runtime,
            storage,
            control,
        }
    }

    #[instrument(skip(self, new_content))]
    pub async fn edit_user_message(
        &self,
        world_id: &str,
        message_id: &str,
        new_content: &str,
        chat_id: &str,
    ) -> Result<RemovalResult> {
        // Step 1: cancel any in-flight processing for this (world, chat).
        self.control.cancel(world_id, chat_id);

        let world = self.runtime.get_world(world_id).await?;
        let resolved_world_id = world.record.read().await.id.clone();

        // Steps 2-3: cutoff removal, then conditional title reset.
        let mut result =
            remove_messages_from(&world, &self.storage, &resolved_world_id, message_id, chat_id)
                .await?;

        if result.resubmission_status == ResubmissionStatus::NotFound {
            let entry = aw_storage::EditErrorEntry {
                message_id: message_id.to_string(),
                new_content: new_content.to_string(),
                chat_id: chat_id.to_string(),
                resubmission_status: "not_found".to_string(),
                resubmission_error: None,
                recorded_at: Utc::now(),
            };
            let _ = self.storage.record_edit_error(&resolved_world_id, entry).await;
            return Ok(result);
        }

        if let Some(chat) = world.chats.get(chat_id).map(|c| c.clone()) {
            if world.last_title_event(chat_id).as_deref() == Some(chat.name.as_str()) {
                let applied = self
                    .storage
                    .update_chat_name_if_current(
                        &resolved_world_id,
                        chat_id,
                        &chat.name,
                        aw_storage::DEFAULT_CHAT_TITLE,
                    )
                    .await?;
                if applied {
                    if let Some(mut entry) = world.chats.get_mut(chat_id) {
                        entry.name = aw_storage::DEFAULT_CHAT_TITLE.to_string();
                    }
                }
            }
        }

        // Step 4: reload each runtime agent's memory fresh from storage.
        for entry in world.agents.iter() {
            let agent_id = entry.key().clone();
            let fresh = self
                .storage
                .get_agent_memory(&resolved_world_id, &agent_id)
                .await?;
            *entry.value().memory.write().await = fresh;
        }

        // Step 5: ensure subscription.
        if !world.is_subscribed() {
            world.ensure_subscribed();
        }

        // Step 6: publish the edited content as a fresh user message.
        let new_id = new_message_id();
        let message = AgentMessage {
            message_id: Some(new_id.clone()),
            role: MessageRole::User,
            content: new_content.to_string(),
            sender: Sender::Human,
            agent_id: String::new(),
            chat_id: chat_id.to_string(),
            created_at: Utc::now(),
            tool_calls: None,
            tool_call_id: None,
        };
        // The edited message has no single owning agent yet; every agent's
        // memory view is updated when it next processes the chat, mirroring
        // how the original message reached each agent during publication.
        world.event_bus.publish(WorldEvent::Message(MessageEvent {
            content: message.content.clone(),
            sender: Sender::Human,
            chat_id: chat_id.to_string(),
            message_id: new_id.clone(),
            timestamp: message.created_at,
        }));

        result.new_message_id = Some(new_id);
        self.control.clear(world_id, chat_id);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_runtime::{CreateAgentParams, CreateWorldParams};
    use aw_storage::MemoryBackend;

    async fn seed_two_agents_with_shared_history(
        runtime: &Arc<WorldRuntime>,
    ) -> Arc<World> {
        runtime
            .create_world(CreateWorldParams {
                name: "W".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let world = runtime.get_world("w").await.unwrap();

        for id in ["a", "b"] {
            runtime
                .create_agent(
                    "w",
                    CreateAgentParams {
                        id: Some(id.to_string()),
                        name: id.to_string(),
                        agent_type: "assistant".into(),
                        provider: "openai".into(),
                        model: "gpt".into(),
                        system_prompt: String::new(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        world
    }

    fn msg(message_id: &str, chat_id: &str, t: i64) -> AgentMessage {
        AgentMessage {
            message_id: Some(message_id.to_string()),
            role: MessageRole::User,
            content: "x".into(),
            sender: Sender::Human,
            agent_id: String::new(),
            chat_id: chat_id.to_string(),
            created_at: chrono::DateTime::from_timestamp(t, 0).unwrap(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[tokio::test]
    async fn edit_cutoff_removes_from_both_agents() {
        let storage: Arc<dyn StorageAPI> = Arc::new(MemoryBackend::new());
        let runtime = Arc::new(WorldRuntime::new(storage.clone()));
        let world = seed_two_agents_with_shared_history(&runtime).await;
        let chat_id = world.current_chat_id.read().await.clone().unwrap();

        let handle_a = world.agents.get("a").unwrap().clone();
        *handle_a.memory.write().await = vec![
            msg("m1", &chat_id, 1),
            msg("m2", &chat_id, 3),
        ];
        storage
            .replace_agent_memory("w", "a", handle_a.memory.read().await.clone())
            .await
            .unwrap();

        let handle_b = world.agents.get("b").unwrap().clone();
        *handle_b.memory.write().await = vec![
            msg("m1", &chat_id, 1),
            msg("m2", &chat_id, 2),
            msg("m3", &chat_id, 4),
        ];
        storage
            .replace_agent_memory("w", "b", handle_b.memory.read().await.clone())
            .await
            .unwrap();

        let control = Arc::new(ProcessingControl::new());
        let editor = MessageEditor::new(runtime.clone(), storage.clone(), control);
        let result = editor
            .edit_user_message("w", "m2", "edited", &chat_id)
            .await
            .unwrap();

        assert_eq!(result.resubmission_status, ResubmissionStatus::Success);
        assert_eq!(result.messages_removed_total, 3);
        assert_ne!(result.new_message_id.as_deref(), Some("m2"));

        let a_memory = handle_a.memory.read().await;
        assert_eq!(a_memory.len(), 1);
        assert_eq!(a_memory[0].message_id.as_deref(), Some("m1"));

        let b_memory = handle_b.memory.read().await;
        assert_eq!(b_memory.len(), 1);
        assert_eq!(b_memory[0].message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn editing_nonexistent_message_reports_not_found() {
        let storage: Arc<dyn StorageAPI> = Arc::new(MemoryBackend::new());
        let runtime = Arc::new(WorldRuntime::new(storage.clone()));
        let _world = seed_two_agents_with_shared_history(&runtime).await;
        let control = Arc::new(ProcessingControl::new());
        let editor = MessageEditor::new(runtime.clone(), storage.clone(), control);

        let result = editor
            .edit_user_message("w", "does-not-exist", "edited", "any-chat")
            .await
            .unwrap();
        assert_eq!(result.resubmission_status, ResubmissionStatus::NotFound);
        assert_eq!(result.messages_removed_total, 0);
        assert!(result.new_message_id.is_none());
    }

    #[tokio::test]
    async fn auto_generated_title_resets_only_when_untouched() {
        let storage: Arc<dyn StorageAPI> = Arc::new(MemoryBackend::new());
        let runtime = Arc::new(WorldRuntime::new(storage.clone()));
        let world = seed_two_agents_with_shared_history(&runtime).await;
        let chat_id = world.current_chat_id.read().await.clone().unwrap();

        world.note_title_event(&chat_id, "Trip to Osaka");
        if let Some(mut chat) = world.chats.get_mut(&chat_id) {
            chat.name = "Trip to Osaka".to_string();
        }
        storage
            .update_chat_name_if_current("w", &chat_id, aw_storage::DEFAULT_CHAT_TITLE, "Trip to Osaka")
            .await
            .ok();

        let handle_a = world.agents.get("a").unwrap().clone();
        *handle_a.memory.write().await = vec![msg("m1", &chat_id, 1)];
        storage
            .replace_agent_memory("w", "a", handle_a.memory.read().await.clone())
            .await
            .unwrap();

        let control = Arc::new(ProcessingControl::new());
        let editor = MessageEditor::new(runtime.clone(), storage.clone(), control);
        editor
            .edit_user_message("w", "m1", "edited", &chat_id)
            .await
            .unwrap();

        let chat = world.chats.get(&chat_id).unwrap();
        assert_eq!(chat.name, aw_storage::DEFAULT_CHAT_TITLE);
    }
}
