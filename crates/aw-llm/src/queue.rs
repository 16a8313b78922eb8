use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use aw_error::{Error, Result};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::types::LLMResponse;

pub type LLMTask = Pin<Box<dyn Future<Output = Result<LLMResponse>> + Send>>;

/// Queue-level configuration.
#[derive(Debug, Clone, Copy)]
pub struct LLMQueueConfig {
    pub max_queue_size: usize,
    pub processing_timeout: Duration,
}

impl Default for LLMQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            processing_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl LLMQueueConfig {
    /// Enforces a minimum 1s processing timeout regardless of what is passed in.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout.max(Duration::from_secs(1));
        self
    }
}

struct PendingCall {
    id: Uuid,
    agent_id: String,
    world_id: String,
    task: LLMTask,
    resolve: oneshot::Sender<Result<LLMResponse>>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub length: usize,
    pub processing: bool,
    pub next_agent: Option<String>,
    pub next_world: Option<String>,
    pub max_queue_size: usize,
}

struct Inner {
    queue: Mutex<VecDeque<PendingCall>>,
    notify: Notify,
    status: Mutex<QueueStatus>,
    config: LLMQueueConfig,
}

/// The process-global (by convention — nothing here prevents constructing
/// several, which tests rely on to keep fresh instances isolated) FIFO
/// that serializes every LLM call.
pub struct LLMQueue {
    inner: Arc<Inner>,
}

impl LLMQueue {
    /// Builds a queue and starts its single worker loop.
    pub fn new(config: LLMQueueConfig) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            status: Mutex::new(QueueStatus {
                max_queue_size: config.max_queue_size,
                ..Default::default()
            }),
            config,
        });
        tokio::spawn(Self::run(inner.clone()));
        Self { inner }
    }

    /// Enqueues `task` on behalf of `(agent_id, world_id)`. Fails
    /// immediately with `QueueFull` when the queue is already at capacity;
    /// otherwise returns once the task has run (or timed out, or the queue
    /// was cleared).
    #[instrument(skip(self, task))]
    pub async fn add(
        &self,
        agent_id: impl Into<String>,
        world_id: impl Into<String>,
        task: LLMTask,
    ) -> Result<LLMResponse> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock().await;
            if queue.len() >= self.inner.config.max_queue_size {
                return Err(Error::QueueFull);
            }
            queue.push_back(PendingCall {
                id: Uuid::new_v4(),
                agent_id: agent_id.into(),
                world_id: world_id.into(),
                task,
                resolve: tx,
            });
            let mut status = self.inner.status.lock().await;
            status.length = queue.len();
        }
        self.inner.notify.notify_one();
        rx.await
            .map_err(|_| Error::Internal("LLM queue task dropped before settling".to_string()))?
    }

    /// Rejects every pending (not yet started) task with `QueueCleared` and
    /// returns how many were rejected. The in-flight task, if any, is left
    /// to finish or time out on its own.
    pub async fn clear_queue(&self) -> usize {
        let mut queue = self.inner.queue.lock().await;
        let drained: Vec<PendingCall> = queue.drain(..).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.resolve.send(Err(Error::QueueCleared));
        }
        self.inner.status.lock().await.length = 0;
        count
    }

    pub async fn status(&self) -> QueueStatus {
        self.inner.status.lock().await.clone()
    }

    async fn run(inner: Arc<Inner>) {
        loop {
            let next = {
                let mut queue = inner.queue.lock().await;
                queue.pop_front()
            };
            let Some(call) = next else {
                inner.notify.notified().await;
                continue;
            };

            {
                let mut status = inner.status.lock().await;
                status.processing = true;
                status.next_agent = Some(call.agent_id.clone());
                status.next_world = Some(call.world_id.clone());
                let queue = inner.queue.lock().await;
                status.length = queue.len();
            }

            let timeout = inner.config.processing_timeout;
            let warn_timeout = timeout / 2;
            let agent_id = call.agent_id.clone();
            let world_id = call.world_id.clone();
            let call_id = call.id;
            let warn_handle = tokio::spawn(async move {
                tokio::time::sleep(warn_timeout).await;
                warn!(
                    call_id = %call_id,
                    agent_id,
                    world_id,
                    elapsed_ms = warn_timeout.as_millis() as u64,
                    "LLM call is taking longer than half its timeout budget"
                );
            });

            let result = match tokio::time::timeout(timeout, call.task).await {
                Ok(result) => result,
                Err(_) => Err(Error::LLMTimeout(timeout)),
            };
            warn_handle.abort();

            let _ = call.resolve.send(result);

            let mut status = inner.status.lock().await;
            status.processing = false;
            status.next_agent = None;
            status.next_world = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn text_task(content: &'static str) -> LLMTask {
        Box::pin(async move {
            Ok(LLMResponse::Text {
                content: content.to_string(),
                usage: None,
            })
        })
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = LLMQueue::new(LLMQueueConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            let task: LLMTask = Box::pin(async move {
                order.lock().await.push(i);
                Ok(LLMResponse::Text {
                    content: i.to_string(),
                    usage: None,
                })
            });
            handles.push(queue.add("agent", "world", task));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let queue = LLMQueue::new(LLMQueueConfig {
            max_queue_size: 1,
            processing_timeout: Duration::from_secs(5),
        });
        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let gate2 = gate.clone();
        let blocking: LLMTask = Box::pin(async move {
            gate2.wait().await;
            Ok(LLMResponse::Text { content: "ok".into(), usage: None })
        });
        let in_flight = queue.add("a", "w", blocking);

        // give the worker a tick to pick up the first task so the queue is
        // empty again, then fill capacity with one pending task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = queue.add("a", "w", text_task("second"));
        let rejected = queue.add("a", "w", text_task("third")).await;
        assert!(matches!(rejected, Err(Error::QueueFull)));

        gate.wait().await;
        in_flight.await.unwrap();
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn task_exceeding_timeout_fails_and_queue_advances() {
        let queue = LLMQueue::new(LLMQueueConfig {
            max_queue_size: 10,
            processing_timeout: Duration::from_millis(50),
        });
        let slow: LLMTask = Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(LLMResponse::Text { content: "late".into(), usage: None })
        });
        let slow_result = queue.add("a", "w", slow).await;
        assert!(matches!(slow_result, Err(Error::LLMTimeout(_))));

        let fast_result = queue.add("a", "w", text_task("fast")).await.unwrap();
        match fast_result {
            LLMResponse::Text { content, .. } => assert_eq!(content, "fast"),
            _ => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn clear_queue_rejects_pending_only() {
        let queue = LLMQueue::new(LLMQueueConfig {
            max_queue_size: 10,
            processing_timeout: Duration::from_secs(5),
        });
        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let gate2 = gate.clone();
        let in_flight = queue.add(
            "a",
            "w",
            Box::pin(async move {
                gate2.wait().await;
                Ok(LLMResponse::Text { content: "in-flight".into(), usage: None })
            }),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = queue.add("a", "w", text_task("pending"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cleared = queue.clear_queue().await;
        assert_eq!(cleared, 1);
        assert!(matches!(pending.await, Err(Error::QueueCleared)));

        gate.wait().await;
        in_flight.await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_queue_length() {
        let queue = LLMQueue::new(LLMQueueConfig::default());
        let status = queue.status().await;
        assert_eq!(status.length, 0);
        assert_eq!(status.max_queue_size, 100);
        let counter = AtomicUsize::new(0);
        let _ = counter.fetch_add(1, Ordering::SeqCst);
    }
}
