use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted world record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub turn_limit: u32,
    pub main_agent: Option<String>,
    pub chat_llm_provider: Option<String>,
    pub chat_llm_model: Option<String>,
    pub mcp_config: Option<String>,
    pub variables: String,
    pub current_chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl WorldRecord {
    pub const DEFAULT_TURN_LIMIT: u32 = 5;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentStatus(pub String);

/// Persisted agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub auto_reply: bool,
    pub status: AgentStatus,
    pub llm_call_count: u64,
    pub last_active: Option<DateTime<Utc>>,
    pub last_llm_call: Option<DateTime<Utc>>,
}

impl Default for AgentRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            agent_type: "assistant".to_string(),
            provider: String::new(),
            model: String::new(),
            system_prompt: String::new(),
            temperature: None,
            max_tokens: None,
            auto_reply: true,
            status: AgentStatus("idle".to_string()),
            llm_call_count: 0,
            last_active: None,
            last_llm_call: None,
        }
    }
}

pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Persisted chat record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub world_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Human,
    Agent(String),
    System,
}

/// A persisted message. `message_id` is
/// always populated once it passes through `StorageAPI::get_memory` — rows
/// read from a legacy backend without one are backfilled in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub sender: Sender,
    pub agent_id: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
}

impl AgentMessage {
    pub fn has_message_id(&self) -> bool {
        self.message_id.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// One entry in the bounded edit-error ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditErrorEntry {
    pub message_id: String,
    pub new_content: String,
    pub chat_id: String,
    pub resubmission_status: String,
    pub resubmission_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

pub const EDIT_ERROR_LOG_CAP: usize = 100;

/// Generates a 10-character base62 token.
pub fn new_message_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
