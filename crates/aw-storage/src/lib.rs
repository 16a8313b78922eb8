#![doc = r#"
aw-storage — the pluggable persistence layer: world,
agent, and chat records, per-agent message memory, and the `StorageAPI`
trait two backends implement.

The in-memory backend keeps its maps behind `RwLock`; the file backend
composes the in-memory one and adds a JSON snapshot written through a
temp-file-then-rename, giving atomic durability without depending on a
real database.
"#]

mod api;
mod file_backend;
mod memory_backend;
mod model;

pub use api::StorageAPI;
pub use file_backend::FileBackend;
pub use memory_backend::MemoryBackend;
pub use model::{
    new_message_id, AgentMessage, AgentRecord, AgentStatus, ChatRecord, EditErrorEntry,
    MessageRole, Sender, WorldRecord, DEFAULT_CHAT_TITLE, EDIT_ERROR_LOG_CAP,
};
