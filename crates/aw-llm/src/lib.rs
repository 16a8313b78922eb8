#![doc = r#"
aw-llm — the process-global serialized LLM call queue,
the provider-dispatch selector, and the `LLMResponse`
contract every provider client returns.

The queue is a single-worker, FIFO-with-timers service: one in-flight
request at a time, constructed explicitly rather than hidden behind
ambient module state.
"#]

mod anthropic;
mod google;
mod openai_compatible;
mod provider;
mod queue;
mod types;

pub use anthropic::AnthropicClient;
pub use google::GoogleClient;
pub use openai_compatible::OpenAiCompatibleClient;
pub use provider::{classify_provider, dispatch_client, ProviderClient, ProviderFamily};
pub use queue::{LLMQueue, LLMQueueConfig, LLMTask, QueueStatus};
pub use types::{
    ChunkCallback, GenerateRequest, LLMResponse, RequestMessage, Role, TokenUsage, ToolCallRequest,
    ToolSpec,
};
