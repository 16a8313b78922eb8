#![doc = r#"
aw-core — the orchestration runtime: `World`/`WorldRuntime`, the per-world
`EventBus`, the agent response loop (`AgentProcessor`), cooperative
cancellation (`ProcessingControl`), and message edit/resubmission
(`MessageEditor`).

This crate ties together `aw-storage` (persistence), `aw-llm` (provider
dispatch and queueing), and `aw-mcp` (tool execution) into the behavior
described for a single multi-agent world: which agents must respond to an
incoming message, how a response loop drives tool calls to completion, and
how editing a past message cuts off and resubmits history.
"#]

mod control;
mod event_bus;
mod ids;
mod mentions;
mod message_editor;
mod processor;
mod tracing_setup;
mod variables;
mod world_runtime;

pub use control::{ProcessingControl, StopToken};
pub use event_bus::{
    CrudEntity, CrudEvent, CrudOperation, EventBus, EventPriority, MessageEvent, SseEvent,
    SseEventKind, SystemEvent, WorldEvent,
};
pub use ids::{kebab_case, resolve_identifier};
pub use mentions::{extract_mentions, extract_paragraph_leading_mentions};
pub use message_editor::{MessageEditor, RemovalResult, ResubmissionStatus};
pub use processor::{
    apply_auto_mention, is_eligible, turn_limit_reached, AgentProcessor,
    DEFAULT_TOOL_ITERATION_CEILING,
};
pub use tracing_setup::init_tracing_once;
pub use variables::{parse_variables, substitute_variables};
pub use world_runtime::{
    AgentHandle, CreateAgentParams, CreateWorldParams, UpdateAgentParams, UpdateWorldParams,
    World, WorldRuntime,
};
