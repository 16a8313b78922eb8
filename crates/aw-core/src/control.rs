use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

/// A cooperative cancellation signal for one in-flight processing session,
/// scoped to `(worldId, chatId)`.
#[derive(Debug, Default)]
pub struct StopToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl StopToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Registry of stop tokens keyed by `(worldId, chatId)`. `editUserMessage`
/// signals cancellation through this when it detects an active processing
/// session for the chat it is about to mutate.
#[derive(Debug, Default)]
pub struct ProcessingControl {
    tokens: DashMap<(String, String), Arc<StopToken>>,
}

impl ProcessingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `(world_id, chat_id)`, creating one if no
    /// session is currently tracked.
    pub fn token_for(&self, world_id: &str, chat_id: &str) -> Arc<StopToken> {
        self.tokens
            .entry((world_id.to_string(), chat_id.to_string()))
            .or_insert_with(|| Arc::new(StopToken::default()))
            .clone()
    }

    /// Signals cancellation if a session is tracked for this chat; a no-op
    /// otherwise (there was nothing running to cancel).
    pub fn cancel(&self, world_id: &str, chat_id: &str) {
        if let Some(token) = self.tokens.get(&(world_id.to_string(), chat_id.to_string())) {
            token.cancel();
        }
    }

    /// Drops the tracked token once a session has settled, so the next
    /// turn starts from a fresh (uncancelled) token.
    pub fn clear(&self, world_id: &str, chat_id: &str) {
        self.tokens.remove(&(world_id.to_string(), chat_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let control = ProcessingControl::new();
        let token = control.token_for("w1", "c1");
        let waiter_token = token.clone();
        let waiter = tokio::spawn(async move {
            waiter_token.cancelled().await;
        });
        control.cancel("w1", "c1");
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_on_untracked_chat_is_a_no_op() {
        let control = ProcessingControl::new();
        control.cancel("w1", "missing");
    }
}
