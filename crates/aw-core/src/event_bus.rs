use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use aw_llm::TokenUsage;
use aw_storage::Sender;

/// Which broadcast channel an event kind rides.
/// Mirrors the realtime/background split `ploke_tui::event_bus::EventBus`
/// uses to keep a bursty SSE stream from starving CRUD notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPriority {
    Realtime,
    Background,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub content: String,
    pub sender: Sender,
    pub chat_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseEventKind {
    Start,
    Chunk,
    End,
    Error,
}

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub agent_name: String,
    pub kind: SseEventKind,
    pub content: Option<String>,
    pub message_id: String,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct SystemEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudEntity {
    World,
    Agent,
    Chat,
}

#[derive(Debug, Clone)]
pub struct CrudEvent {
    pub operation: CrudOperation,
    pub entity: CrudEntity,
    pub id: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum WorldEvent {
    Message(MessageEvent),
    Sse(SseEvent),
    System(SystemEvent),
    Crud(CrudEvent),
}

impl WorldEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            WorldEvent::Message(_) | WorldEvent::Sse(_) => EventPriority::Realtime,
            WorldEvent::System(_) | WorldEvent::Crud(_) => EventPriority::Background,
        }
    }
}

/// Per-world publish/subscribe bus. One instance is
/// owned by each hydrated `World`; it never crosses world boundaries.
#[derive(Debug)]
pub struct EventBus {
    realtime_tx: broadcast::Sender<WorldEvent>,
    background_tx: broadcast::Sender<WorldEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256, 1024)
    }

    pub fn with_capacity(realtime_cap: usize, background_cap: usize) -> Self {
        Self {
            realtime_tx: broadcast::channel(realtime_cap).0,
            background_tx: broadcast::channel(background_cap).0,
        }
    }

    pub fn publish(&self, event: WorldEvent) {
        let tx = match event.priority() {
            EventPriority::Realtime => &self.realtime_tx,
            EventPriority::Background => &self.background_tx,
        };
        // No subscribers is not an error; the bus fans out, it doesn't guarantee delivery.
        let _ = tx.send(event);
    }

    pub fn subscribe(&self, priority: EventPriority) -> broadcast::Receiver<WorldEvent> {
        match priority {
            EventPriority::Realtime => self.realtime_tx.subscribe(),
            EventPriority::Background => self.background_tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn realtime_and_background_events_stay_on_separate_channels() {
        let bus = EventBus::new();
        let mut realtime = bus.subscribe(EventPriority::Realtime);
        let mut background = bus.subscribe(EventPriority::Background);

        bus.publish(WorldEvent::Message(MessageEvent {
            content: "hi".into(),
            sender: Sender::Human,
            chat_id: "c1".into(),
            message_id: "m1".into(),
            timestamp: Utc::now(),
        }));

        let got = realtime.recv().await.unwrap();
        assert!(matches!(got, WorldEvent::Message(_)));
        assert!(background.try_recv().is_err());
    }
}
