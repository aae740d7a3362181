//! Remote Task Tracker: spawns a poller per remote agent task, and on a
//! terminal status pushes a synthetic message onto the message queue so the
//! main loop resumes with the result.

use crate::message::Message;
use crate::queue::{MessageQueue, QueuedMessage};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTaskStatus {
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl RemoteTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RemoteTaskStatus::Completed
                | RemoteTaskStatus::Failed
                | RemoteTaskStatus::Cancelled
                | RemoteTaskStatus::Rejected
        )
    }
}

#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub task_id: String,
    pub agent_url: String,
    pub status: RemoteTaskStatus,
    pub created_at_unix: i64,
    pub updated_at_unix: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteTaskError {
    #[error("remote task http error: {0}")]
    Http(String),
    #[error("remote task {0} not found")]
    NotFound(String),
}

/// The remote-agent HTTP surface consumed by the tracker.
#[async_trait]
pub trait RemoteAgentClient: Send + Sync {
    async fn submit_task(&self, agent_url: &str, payload: serde_json::Value) -> Result<String, RemoteTaskError>;
    async fn poll_status(&self, agent_url: &str, task_id: &str) -> Result<RemoteTaskStatus, RemoteTaskError>;
    async fn fetch_result(&self, agent_url: &str, task_id: &str) -> Result<String, RemoteTaskError>;
    async fn cancel(&self, agent_url: &str, task_id: &str) -> Result<(), RemoteTaskError>;
}

struct TrackedTask {
    task: RemoteTask,
    poller: JoinHandle<()>,
}

/// Owns all active remote-agent task pollers for one agent session.
pub struct RemoteTaskTracker {
    client: Arc<dyn RemoteAgentClient>,
    queue: Arc<MessageQueue>,
    tasks: RwLock<HashMap<String, TrackedTask>>,
    poll_interval: Duration,
}

impl RemoteTaskTracker {
    pub fn new(client: Arc<dyn RemoteAgentClient>, queue: Arc<MessageQueue>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            queue,
            tasks: RwLock::new(HashMap::new()),
            poll_interval,
        })
    }

    /// Submit a task and spawn its poller. On terminal status the poller
    /// pushes a synthetic assistant/tool message onto the queue so the main
    /// agent resumes with the result.
    pub async fn submit(
        self: &Arc<Self>,
        agent_url: impl Into<String>,
        payload: serde_json::Value,
        request_id: impl Into<String>,
    ) -> Result<String, RemoteTaskError> {
        let agent_url = agent_url.into();
        let request_id = request_id.into();
        let task_id = self.client.submit_task(&agent_url, payload).await?;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let task = RemoteTask {
            task_id: task_id.clone(),
            agent_url: agent_url.clone(),
            status: RemoteTaskStatus::Submitted,
            created_at_unix: now,
            updated_at_unix: now,
        };

        let this = self.clone();
        let poll_task_id = task_id.clone();
        let poller = tokio::spawn(async move {
            this.poll_until_terminal(poll_task_id, agent_url, request_id).await;
        });

        self.tasks.write().insert(
            task_id.clone(),
            TrackedTask {
                task,
                poller,
            },
        );

        Ok(task_id)
    }

    async fn poll_until_terminal(self: Arc<Self>, task_id: String, agent_url: String, request_id: String) {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let status = match self.client.poll_status(&agent_url, &task_id).await {
                Ok(status) => status,
                Err(e) => {
                    log::warn!("remote task {task_id} poll failed: {e}");
                    continue;
                }
            };

            {
                let mut tasks = self.tasks.write();
                if let Some(tracked) = tasks.get_mut(&task_id) {
                    tracked.task.status = status;
                    tracked.task.updated_at_unix = time::OffsetDateTime::now_utc().unix_timestamp();
                } else {
                    return; // removed (cancelled) while we were sleeping
                }
            }

            if status.is_terminal() {
                let content = match status {
                    RemoteTaskStatus::Completed => self
                        .client
                        .fetch_result(&agent_url, &task_id)
                        .await
                        .unwrap_or_else(|e| format!("remote task completed but result fetch failed: {e}")),
                    RemoteTaskStatus::Failed => format!("remote task {task_id} failed"),
                    RemoteTaskStatus::Cancelled => format!("remote task {task_id} was cancelled"),
                    RemoteTaskStatus::Rejected => format!("remote task {task_id} was rejected"),
                    _ => unreachable!("status.is_terminal() guards this arm"),
                };

                self.queue.enqueue(QueuedMessage {
                    message: Message::user(content),
                    request_id,
                    queued_at_unix: time::OffsetDateTime::now_utc().unix_timestamp(),
                });
                return;
            }
        }
    }

    /// Tear down the poller and issue a best-effort remote cancel.
    pub async fn cancel(&self, task_id: &str) {
        let removed = self.tasks.write().remove(task_id);
        if let Some(tracked) = removed {
            tracked.poller.abort();
            if let Err(e) = self.client.cancel(&tracked.task.agent_url, task_id).await {
                log::warn!("best-effort remote cancel for {task_id} failed: {e}");
            }
        }
    }

    pub fn snapshot(&self, task_id: &str) -> Option<RemoteTask> {
        self.tasks.read().get(task_id).map(|t| t.task.clone())
    }

    pub fn active_count(&self) -> usize {
        self.tasks.read().len()
    }
}
