use std::collections::HashSet;
use std::sync::Arc;

use aw_error::policy::NoopPolicy;
use aw_error::{Error, ErrorPolicy, Result, ResultExt};
use aw_llm::{
    dispatch_client, GenerateRequest, LLMQueue, LLMResponse, RequestMessage, Role, ToolSpec,
};
use aw_mcp::{parse_mcp_config, sanitize_server_name, server_id, MCPRegistry};
use aw_storage::{new_message_id, AgentMessage, MessageRole, Sender, StorageAPI};
use chrono::Utc;
use tracing::instrument;

use crate::control::{ProcessingControl, StopToken};
use crate::event_bus::{CrudEntity, CrudEvent, CrudOperation, MessageEvent, SseEvent, SseEventKind, WorldEvent};
use crate::ids::kebab_case;
use crate::mentions::{extract_mentions, extract_paragraph_leading_mentions};
use crate::variables::{parse_variables, substitute_variables};
use crate::world_runtime::{AgentHandle, World};

/// Upper bound on tool-call iterations within one agent response before the
/// loop is forced to stop.
pub const DEFAULT_TOOL_ITERATION_CEILING: usize = 8;

fn message_role_to_wire(role: MessageRole) -> Role {
    match role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
        MessageRole::Tool => Role::Tool,
    }
}

/// Decides whether `agent` must respond to an incoming message.
///
/// `mentions` is every `@token` anywhere in the content; `leading_mentions`
/// is the paragraph-beginning subset spec §4.2 step 1 calls out
/// separately. Direct targeting only fires on a leading mention (the
/// message was addressed to this agent); an agent mentioned only in
/// passing mid-paragraph still counts toward "mentions restrict the
/// audience" for another agent's auto-reply check below.
#[allow(clippy::too_many_arguments)]
pub fn is_eligible(
    agent_id: &str,
    agent_name: &str,
    auto_reply: bool,
    sender: &Sender,
    mentions: &HashSet<String>,
    leading_mentions: &HashSet<String>,
    main_agent: Option<&str>,
    single_agent_world: bool,
) -> bool {
    if let Sender::Agent(sender_id) = sender {
        if sender_id == agent_id {
            return false; // an agent never replies to its own message
        }
    }

    let targeted = leading_mentions.contains(&kebab_case(agent_id))
        || leading_mentions.contains(&kebab_case(agent_name));
    if targeted {
        return true;
    }

    match sender {
        Sender::Human => {
            let is_main = main_agent
                .map(|m| kebab_case(m) == kebab_case(agent_id))
                .unwrap_or(single_agent_world);
            is_main
        }
        Sender::Agent(_) => auto_reply && mentions.is_empty(),
        Sender::System => false,
    }
}

/// Returns true once the world has exhausted its turn budget.
pub fn turn_limit_reached(total_llm_call_count: u64, turn_limit: u32) -> bool {
    total_llm_call_count >= turn_limit as u64
}

/// Applies the auto-mention-back rule: replying to a human never adds a
/// mention; replying to another agent adds an auto-mention of the sender
/// unless the response already mentions them.
pub fn apply_auto_mention(reply_content: &str, sender: &Sender, sender_agent_name: Option<&str>) -> String {
    match sender {
        Sender::Agent(sender_id) => {
            let mentions = extract_mentions(reply_content);
            let already_mentioned = mentions.contains(&kebab_case(sender_id))
                || sender_agent_name
                    .map(|n| mentions.contains(&kebab_case(n)))
                    .unwrap_or(false);
            if already_mentioned {
                reply_content.to_string()
            } else {
                format!("{reply_content} @{sender_id}")
            }
        }
        Sender::Human | Sender::System => reply_content.to_string(),
    }
}

/// Releases both the world's coarse single-writer guard and this turn's
/// tracked `(worldId, chatId)` stop token when a turn settles, so a later
/// `editUserMessage` never cancels a session that already finished.
struct ProcessingGuard<'a> {
    world: &'a World,
    control: &'a ProcessingControl,
    world_id: String,
    chat_id: String,
}

impl<'a> Drop for ProcessingGuard<'a> {
    fn drop(&mut self) {
        self.world.end_processing();
        self.control.clear(&self.world_id, &self.chat_id);
    }
}

/// Orchestrates the agent response loop: eligibility, the LLM call, and the
/// tool-call loop. Grounded on
/// `ploke_tui::llm::session`'s request/response cycle for the shape of
/// steps 2-6, generalized from one hardcoded session into a reusable
/// per-turn driver over `LLMQueue` + `MCPRegistry`.
pub struct AgentProcessor {
    storage: Arc<dyn StorageAPI>,
    llm_queue: Arc<LLMQueue>,
    mcp_registry: Arc<MCPRegistry>,
    control: Arc<ProcessingControl>,
    policy: Arc<dyn ErrorPolicy>,
    tool_iteration_ceiling: usize,
}

impl AgentProcessor {
    pub fn new(
        storage: Arc<dyn StorageAPI>,
        llm_queue: Arc<LLMQueue>,
        mcp_registry: Arc<MCPRegistry>,
        control: Arc<ProcessingControl>,
    ) -> Self {
        Self {
            storage,
            llm_queue,
            mcp_registry,
            control,
            policy: Arc::new(NoopPolicy),
            tool_iteration_ceiling: DEFAULT_TOOL_ITERATION_CEILING,
        }
    }

    /// Overrides the error-emission policy applied when a turn fails
    /// (defaults to silent, matching `aw-error`'s "library stays pure"
    /// contract until an application boundary opts in).
    pub fn with_policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Entry point for a freshly published `message` event: evaluates every
    /// agent's eligibility and runs a turn for each one that must respond.
    #[instrument(skip(self, world))]
    pub async fn handle_message(&self, world: &Arc<World>, incoming: MessageEvent) -> Result<()> {
        let mentions = extract_mentions(&incoming.content);
        let leading_mentions = extract_paragraph_leading_mentions(&incoming.content);
        let main_agent = world.record.read().await.main_agent.clone();
        let single_agent_world = world.agents.len() == 1;
        let turn_limit = world.record.read().await.turn_limit;

        let mut responders = Vec::new();
        for entry in world.agents.iter() {
            let agent_id = entry.key().clone();
            let record = entry.value().record.read().await;
            if is_eligible(
                &record.id,
                &record.name,
                record.auto_reply,
                &incoming.sender,
                &mentions,
                &leading_mentions,
                main_agent.as_deref(),
                single_agent_world,
            ) {
                responders.push(agent_id);
            }
        }

        let mut last_err = None;
        for agent_id in responders {
            if turn_limit_reached(world.total_llm_call_count().await, turn_limit) {
                break;
            }
            if let Err(e) = self.run_agent_turn(world, &agent_id, &incoming).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs the full agent processing loop for
    /// one agent responding to `incoming`.
    #[instrument(skip(self, world, incoming))]
    async fn run_agent_turn(
        &self,
        world: &Arc<World>,
        agent_id: &str,
        incoming: &MessageEvent,
    ) -> Result<()> {
        if !world.begin_processing() {
            return Err(Error::WorldProcessing);
        }
        let world_id = world.record.read().await.id.clone();
        let token = self.control.token_for(&world_id, &incoming.chat_id);
        let _guard = ProcessingGuard {
            world,
            control: &self.control,
            world_id: world_id.clone(),
            chat_id: incoming.chat_id.clone(),
        };

        let handle = world
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?
            .clone();
        let mcp_config = world.record.read().await.mcp_config.clone();
        let variables = parse_variables(&world.record.read().await.variables);

        let result = self
            .drive_turn(
                world,
                &world_id,
                &handle,
                incoming,
                mcp_config.as_deref(),
                &variables,
                &token,
            )
            .await
            .emit_event(self.policy.as_ref());

        if let Err(ref e) = result {
            world.event_bus.publish(WorldEvent::Sse(SseEvent {
                agent_name: handle.record.read().await.name.clone(),
                kind: SseEventKind::Error,
                content: None,
                message_id: incoming.message_id.clone(),
                error: Some(e.to_string()),
                usage: None,
            }));
        }
        result
    }

    async fn drive_turn(
        &self,
        world: &Arc<World>,
        world_id: &str,
        handle: &Arc<AgentHandle>,
        incoming: &MessageEvent,
        mcp_config: Option<&str>,
        variables: &std::collections::HashMap<String, String>,
        token: &Arc<StopToken>,
    ) -> Result<()> {
        let tools = match mcp_config {
            Some(raw) if !raw.trim().is_empty() => self
                .mcp_registry
                .get_mcp_tools_for_world(raw)
                .await
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let tool_specs: Vec<ToolSpec> = tools
            .iter()
            .map(|(key, desc)| ToolSpec {
                name: format!("{key}.{}", desc.name),
                description: desc.description.clone(),
                parameters: desc.parameters.clone(),
            })
            .collect();

        let mut iterations = 0usize;
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let record = handle.record.read().await.clone();
            let memory = handle.memory.read().await.clone();

            let mut system_prompt = substitute_variables(&record.system_prompt, variables);
            if !tool_specs.is_empty() {
                system_prompt.push_str(
                    "\n\nYou have access to external tools. Call them when they would help answer the request.",
                );
            }

            let mut messages = vec![RequestMessage {
                role: Role::System,
                content: system_prompt,
                tool_calls: None,
                tool_call_id: None,
            }];
            messages.extend(memory.iter().filter(|m| m.chat_id == incoming.chat_id).map(|m| {
                RequestMessage {
                    role: message_role_to_wire(m.role),
                    content: m.content.clone(),
                    tool_calls: None,
                    tool_call_id: m.tool_call_id.clone(),
                }
            }));

            let request = GenerateRequest {
                provider: record.provider.clone(),
                model: record.model.clone(),
                messages,
                tools: tool_specs.clone(),
                temperature: record.temperature,
                max_tokens: record.max_tokens,
            };

            let agent_id = record.id.clone();
            let task: aw_llm::LLMTask = Box::pin(async move {
                let client = dispatch_client(&request.provider)?;
                client.generate(request).await
            });
            let response = tokio::select! {
                result = self.llm_queue.add(agent_id.clone(), world_id.to_string(), task) => result?,
                _ = token.cancelled() => return Err(Error::Cancelled),
            };

            {
                let mut record = handle.record.write().await;
                record.llm_call_count += 1;
                record.last_active = Some(Utc::now());
                record.last_llm_call = Some(Utc::now());
                self.storage.update_agent(world_id, record.clone()).await?;
            }

            match response {
                LLMResponse::Text { content, .. } => {
                    let content = apply_auto_mention(&content, &incoming.sender, None);
                    self.publish_agent_reply(world, world_id, handle, &incoming.chat_id, content)
                        .await?;
                    return Ok(());
                }
                LLMResponse::ToolCalls { tool_calls, .. } => {
                    iterations += 1;
                    if iterations > self.tool_iteration_ceiling {
                        return Err(Error::Internal(
                            "tool-call iteration ceiling exceeded".to_string(),
                        ));
                    }
                    for call in tool_calls {
                        if token.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        let tool_request = AgentMessage {
                            message_id: Some(new_message_id()),
                            role: MessageRole::Assistant,
                            content: call.arguments.to_string(),
                            sender: Sender::Agent(handle.record.read().await.id.clone()),
                            agent_id: handle.record.read().await.id.clone(),
                            chat_id: incoming.chat_id.clone(),
                            created_at: Utc::now(),
                            tool_calls: Some(serde_json::json!([{
                                "id": call.id,
                                "name": call.name,
                                "arguments": call.arguments,
                            }])),
                            tool_call_id: None,
                        };
                        self.append_memory(world_id, handle, tool_request).await?;

                        let tool_result = tokio::select! {
                            result = self.execute_tool(mcp_config, &call.name, call.arguments) => result,
                            _ = token.cancelled() => return Err(Error::Cancelled),
                        };
                        let (content, tool_call_id) = match tool_result {
                            Ok(result) => (result.content, call.id.clone()),
                            Err(e) => (format!("tool error: {e}"), call.id.clone()),
                        };
                        let result_message = AgentMessage {
                            message_id: Some(new_message_id()),
                            role: MessageRole::Tool,
                            content,
                            sender: Sender::Agent(handle.record.read().await.id.clone()),
                            agent_id: handle.record.read().await.id.clone(),
                            chat_id: incoming.chat_id.clone(),
                            created_at: Utc::now(),
                            tool_calls: None,
                            tool_call_id: Some(tool_call_id),
                        };
                        self.append_memory(world_id, handle, result_message).await?;
                    }
                    // loop back into step 4 with the updated message list
                }
            }
        }
    }

    async fn execute_tool(
        &self,
        mcp_config: Option<&str>,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<aw_mcp::types::ToolResult> {
        let raw = mcp_config.ok_or_else(|| Error::MCPToolError("no MCP config for world".to_string()))?;
        let (server_key, tool_name) = qualified_name
            .split_once('.')
            .ok_or_else(|| Error::MCPToolError(format!("malformed tool name '{qualified_name}'")))?;

        let configs = parse_mcp_config(raw)?;
        let config = configs
            .into_iter()
            .find(|c| sanitize_server_name(&c.name) == server_key)
            .ok_or_else(|| Error::MCPToolError(format!("no server for '{server_key}'")))?;
        let hash = server_id(&config);

        let mut arguments = arguments;
        if let Some((_, descriptor)) = self
            .mcp_registry
            .get_mcp_tools_for_world(raw)
            .await?
            .into_iter()
            .find(|(key, desc)| key == server_key && desc.name == tool_name)
        {
            aw_mcp::remap_ollama_dollar_arg(&descriptor.parameters, &mut arguments);
            aw_mcp::coerce_arguments(&descriptor.parameters, &mut arguments);
        }

        self.mcp_registry
            .call_tool(server_key, &config, &hash, tool_name, arguments)
            .await
    }

    async fn append_memory(
        &self,
        world_id: &str,
        handle: &Arc<AgentHandle>,
        message: AgentMessage,
    ) -> Result<()> {
        let agent_id = handle.record.read().await.id.clone();
        self.storage
            .append_agent_message(world_id, &agent_id, message.clone())
            .await?;
        handle.memory.write().await.push(message);
        Ok(())
    }

    async fn publish_agent_reply(
        &self,
        world: &Arc<World>,
        world_id: &str,
        handle: &Arc<AgentHandle>,
        chat_id: &str,
        content: String,
    ) -> Result<()> {
        let agent_id = handle.record.read().await.id.clone();
        let message_id = new_message_id();
        let message = AgentMessage {
            message_id: Some(message_id.clone()),
            role: MessageRole::Assistant,
            content: content.clone(),
            sender: Sender::Agent(agent_id.clone()),
            agent_id: agent_id.clone(),
            chat_id: chat_id.to_string(),
            created_at: Utc::now(),
            tool_calls: None,
            tool_call_id: None,
        };
        self.append_memory(world_id, handle, message).await?;

        world.event_bus.publish(WorldEvent::Message(MessageEvent {
            content,
            sender: Sender::Agent(agent_id.clone()),
            chat_id: chat_id.to_string(),
            message_id: message_id.clone(),
            timestamp: Utc::now(),
        }));
        world.event_bus.publish(WorldEvent::Crud(CrudEvent {
            operation: CrudOperation::Create,
            entity: CrudEntity::Chat,
            id: chat_id.to_string(),
            data: Some(serde_json::json!({ "message_id": message_id })),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_runtime::{CreateAgentParams, CreateWorldParams, WorldRuntime};
    use aw_llm::LLMQueueConfig;
    use aw_mcp::MCPRegistry;
    use aw_storage::MemoryBackend;

    /// A pre-cancelled token for the turn's `(worldId, chatId)` must stop
    /// `drive_turn` before it ever reaches the LLM queue, proving
    /// `editUserMessage`'s cancellation actually reaches a real turn
    /// instead of only a tracked-in-isolation `StopToken`.
    #[tokio::test]
    async fn cancelled_token_short_circuits_a_real_turn() {
        let storage: Arc<dyn StorageAPI> = Arc::new(MemoryBackend::new());
        let runtime = Arc::new(WorldRuntime::new(storage.clone()));
        runtime
            .create_world(CreateWorldParams {
                name: "W".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        runtime
            .create_agent(
                "w",
                CreateAgentParams {
                    id: Some("a".into()),
                    name: "A".into(),
                    agent_type: "assistant".into(),
                    provider: "openai".into(),
                    model: "gpt".into(),
                    system_prompt: String::new(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let world = runtime.get_world("w").await.unwrap();
        let chat_id = world.current_chat_id.read().await.clone().unwrap();

        let control = Arc::new(ProcessingControl::new());
        control.token_for("w", &chat_id).cancel();

        let processor = AgentProcessor::new(
            storage,
            Arc::new(LLMQueue::new(LLMQueueConfig::default())),
            Arc::new(MCPRegistry::new()),
            control,
        );

        let incoming = MessageEvent {
            content: "hello".into(),
            sender: Sender::Human,
            chat_id,
            message_id: "m1".into(),
            timestamp: Utc::now(),
        };
        let result = processor.handle_message(&world, incoming).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[derive(Default, Clone)]
    struct RecordingPolicy {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl ErrorPolicy for RecordingPolicy {
        fn emit(&self, error: &Error) {
            self.seen.lock().unwrap().push(error.to_string());
        }
    }

    /// A failed turn's error must reach a caller-supplied `ErrorPolicy`
    /// through `AgentProcessor::with_policy`, not just compile against the
    /// trait.
    #[tokio::test]
    async fn with_policy_is_invoked_when_a_turn_fails() {
        let storage: Arc<dyn StorageAPI> = Arc::new(MemoryBackend::new());
        let runtime = Arc::new(WorldRuntime::new(storage.clone()));
        runtime
            .create_world(CreateWorldParams {
                name: "W".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        runtime
            .create_agent(
                "w",
                CreateAgentParams {
                    id: Some("a".into()),
                    name: "A".into(),
                    agent_type: "assistant".into(),
                    provider: "openai".into(),
                    model: "gpt".into(),
                    system_prompt: String::new(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let world = runtime.get_world("w").await.unwrap();
        let chat_id = world.current_chat_id.read().await.clone().unwrap();

        let control = Arc::new(ProcessingControl::new());
        control.token_for("w", &chat_id).cancel();

        let recorder = RecordingPolicy::default();
        let policy = Arc::new(
            aw_error::policy::CombinedPolicy::new()
                .push(aw_error::policy::NoopPolicy)
                .push(recorder.clone()),
        );
        let processor = AgentProcessor::new(
            storage,
            Arc::new(LLMQueue::new(LLMQueueConfig::default())),
            Arc::new(MCPRegistry::new()),
            control,
        )
        .with_policy(policy);

        let incoming = MessageEvent {
            content: "hello".into(),
            sender: Sender::Human,
            chat_id,
            message_id: "m1".into(),
            timestamp: Utc::now(),
        };
        let result = processor.handle_message(&world, incoming).await;
        assert!(result.is_err());
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn self_messages_never_get_a_reply() {
        let mentions = HashSet::new();
        let eligible = is_eligible(
            "writer",
            "Writer",
            true,
            &Sender::Agent("writer".to_string()),
            &mentions,
            &mentions,
            None,
            false,
        );
        assert!(!eligible);
    }

    #[test]
    fn leading_mentions_override_auto_reply_false() {
        let mut mentions = HashSet::new();
        mentions.insert("researcher".to_string());
        let eligible = is_eligible(
            "researcher",
            "Researcher",
            false,
            &Sender::Human,
            &mentions,
            &mentions,
            Some("writer"),
            false,
        );
        assert!(eligible);
    }

    #[test]
    fn mid_paragraph_mention_does_not_target_but_restricts_audience() {
        let mut mentions = HashSet::new();
        mentions.insert("researcher".to_string());
        let leading_mentions = HashSet::new();
        // Mentioned mid-message, not at a paragraph start: not directly
        // targeted, and an unrelated agent's auto-reply is still
        // suppressed because a mention restricts the audience.
        assert!(!is_eligible(
            "researcher",
            "Researcher",
            false,
            &Sender::Agent("writer".into()),
            &mentions,
            &leading_mentions,
            Some("writer"),
            false,
        ));
        assert!(!is_eligible(
            "someone-else",
            "Someone Else",
            true,
            &Sender::Agent("writer".into()),
            &mentions,
            &leading_mentions,
            Some("writer"),
            false,
        ));
    }

    #[test]
    fn human_sender_defers_to_main_agent() {
        let mentions = HashSet::new();
        assert!(is_eligible(
            "writer",
            "Writer",
            true,
            &Sender::Human,
            &mentions,
            &mentions,
            Some("writer"),
            false,
        ));
        assert!(!is_eligible(
            "researcher",
            "Researcher",
            true,
            &Sender::Human,
            &mentions,
            &mentions,
            Some("writer"),
            false,
        ));
    }

    #[test]
    fn agent_sender_respects_auto_reply_and_mention_restriction() {
        let mentions = HashSet::new();
        assert!(is_eligible(
            "writer",
            "Writer",
            true,
            &Sender::Agent("researcher".into()),
            &mentions,
            &mentions,
            None,
            false,
        ));

        let mut restricted = HashSet::new();
        restricted.insert("someone-else".to_string());
        assert!(!is_eligible(
            "writer",
            "Writer",
            true,
            &Sender::Agent("researcher".into()),
            &restricted,
            &restricted,
            None,
            false,
        ));
    }

    #[test]
    fn turn_limit_enforced_on_aggregate_count() {
        assert!(!turn_limit_reached(4, 5));
        assert!(turn_limit_reached(5, 5));
        assert!(turn_limit_reached(6, 5));
    }

    #[test]
    fn auto_mention_back_skips_humans_and_already_mentioned_agents() {
        assert_eq!(
            apply_auto_mention("sure thing", &Sender::Human, None),
            "sure thing"
        );
        assert_eq!(
            apply_auto_mention("sure thing", &Sender::Agent("researcher".into()), None),
            "sure thing @researcher"
        );
        assert_eq!(
            apply_auto_mention("sure thing @researcher", &Sender::Agent("researcher".into()), None),
            "sure thing @researcher"
        );
    }
}
