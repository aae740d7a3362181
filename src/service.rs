//! Agent Service facade: wires the state machine, executor, optimizer,
//! state manager, and remote tracker together, and exposes the two entry
//! points a caller actually needs — `run` and `run_with_stream`.

use crate::agent::approval_bridge::EventApprovalChannel;
use crate::agent::{AgentContext, AgentMachine, AgentRequest};
use crate::approval::{AgentMode, ApprovalPolicy};
use crate::conversation::Conversation;
use crate::error::{AgentRuntimeError, Result};
use crate::events::{ChatEvent, EventSink};
use crate::executor::{ApprovalDecision, ToolExecutor};
use crate::executor::status::ToolStatusSink;
use crate::optimizer::ConversationOptimizer;
use crate::provider::{ChatProvider, ModelId};
use crate::queue::MessageQueue;
use crate::repository::ConversationRepository;
use crate::state_manager::{ChatSessionStatus, StateManager};
use crate::tools::ToolService;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Default outbound event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 1000;
/// Default debug-export ring buffer size.
const STATE_HISTORY_CAPACITY: usize = 100;

#[async_trait]
impl ToolStatusSink for EventSink {
    async fn on_status(&self, update: crate::executor::status::ToolStatusUpdate) {
        self.emit(crate::events::ChatEventKind::ToolExecutionProgress {
            tool_call_id: update.tool_call_id,
            tool_name: update.tool_name,
            status: update.status,
            images: update.images,
        })
        .await;
    }
}

/// One turn's worth of caller-supplied input.
pub struct RunInput {
    pub request_id: String,
    pub model: String,
    pub max_turns: usize,
    pub mode: AgentMode,
    pub conversation: Conversation,
}

/// Wires every collaborator behind the facade a caller actually drives. One
/// instance per process; `run`/`run_with_stream` are safe to call
/// concurrently, subject to the state manager's at-most-one-active-session
/// invariant.
pub struct AgentService {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<dyn ToolService>,
    repository: Arc<dyn ConversationRepository>,
    approval_policy: Arc<ApprovalPolicy>,
    optimizer: Arc<ConversationOptimizer>,
    state: Arc<StateManager>,
    max_concurrent_tools: usize,
}

impl AgentService {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        tools: Arc<dyn ToolService>,
        repository: Arc<dyn ConversationRepository>,
        approval_policy: Arc<ApprovalPolicy>,
        optimizer: Arc<ConversationOptimizer>,
        max_concurrent_tools: usize,
    ) -> Self {
        Self {
            provider,
            tools,
            repository,
            approval_policy,
            optimizer,
            state: Arc::new(StateManager::new(STATE_HISTORY_CAPACITY)),
            max_concurrent_tools: max_concurrent_tools.max(1),
        }
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Run one request to completion, buffering every event and returning
    /// them once the request terminates. Callers that want incremental
    /// delivery should use [`AgentService::run_with_stream`] instead.
    pub async fn run(&self, input: RunInput) -> Result<Vec<ChatEvent>> {
        let (mut events_rx, approvals, cancel_tx) = self.run_with_stream(input).await?;
        // Neither handle is reachable from the buffered caller; drop both
        // now so the event channel's last sender goes away once the run
        // finishes, and `recv` below observes the channel close.
        drop(cancel_tx);
        drop(approvals);
        let mut collected = Vec::new();
        while let Some(event) = events_rx.recv().await {
            collected.push(event);
        }
        Ok(collected)
    }

    /// Start one request and return its live event stream plus a handle to
    /// resolve tool approvals and a cancellation sender. The returned
    /// receiver yields events as they are emitted; it closes once the
    /// request reaches a terminal state.
    pub async fn run_with_stream(
        &self,
        input: RunInput,
    ) -> Result<(mpsc::Receiver<ChatEvent>, Arc<EventApprovalChannel>, watch::Sender<bool>)> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.state
            .start_session(input.request_id.clone(), now)
            .map_err(|e| AgentRuntimeError::Input(e.to_string()))?;

        let model = ModelId::parse(&input.model)
            .ok_or_else(|| AgentRuntimeError::Input(format!("malformed model id: {}", input.model)))?;

        let (events, events_rx) = EventSink::new(EVENT_CHANNEL_CAPACITY, input.request_id.clone());
        let events = Arc::new(events);

        let approvals = Arc::new(EventApprovalChannel::new(events.clone(), self.state.clone()));
        let executor = Arc::new(ToolExecutor::new(
            self.tools.clone(),
            self.repository.clone(),
            self.approval_policy.clone(),
            approvals.clone(),
            self.max_concurrent_tools,
        ));

        let machine = AgentMachine::new(
            self.provider.clone(),
            self.tools.clone(),
            executor,
            self.optimizer.clone(),
            events.clone() as Arc<dyn ToolStatusSink>,
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let queue = Arc::new(MessageQueue::new());
        let mut ctx = AgentContext::new(
            input.conversation,
            queue,
            self.repository.clone(),
            self.approval_policy.clone(),
            input.mode,
            input.max_turns,
            true,
            cancel_rx,
            self.state.clone(),
        );

        let request = AgentRequest {
            request_id: input.request_id.clone(),
            model,
            max_turns: input.max_turns,
        };

        let state = self.state.clone();
        let request_id = input.request_id.clone();
        tokio::spawn(async move {
            let outcome = machine.run(&mut ctx, &request, &events).await;
            let now = time::OffsetDateTime::now_utc().unix_timestamp();
            let status = match outcome {
                Ok(()) if ctx.is_cancelled() => ChatSessionStatus::Cancelled,
                Ok(()) if ctx.last_error.is_some() => ChatSessionStatus::Error,
                Ok(()) => ChatSessionStatus::Completed,
                Err(e) => {
                    log::error!("agent run for {request_id} terminated with an error: {e}");
                    ChatSessionStatus::Error
                }
            };
            state.set_session_status(status, now);
        });

        Ok((events_rx, approvals, cancel_tx))
    }

    /// Resolve a pending tool approval for `request_id`'s in-flight run.
    pub fn resolve_approval(&self, approvals: &EventApprovalChannel, tool_call_id: &str, decision: ApprovalDecision) {
        approvals.respond(tool_call_id, decision);
    }

    /// Cancel `request_id`'s in-flight run, if any. Cancelling an
    /// idle/absent request is a no-op returning "not found".
    pub fn cancel(&self, request_id: &str, cancel_tx: &watch::Sender<bool>) -> Result<()> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.state
            .cancel_session(request_id, now)
            .map_err(|e| AgentRuntimeError::Input(e.to_string()))?;
        let _ = cancel_tx.send(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalConfig;
    use crate::message::Message;
    use crate::optimizer::OptimizerConfig;
    use crate::provider::{ProviderError, ToolDeclaration};
    use crate::remote::RemoteTaskTracker;
    use crate::repository::RepositoryError;
    use crate::streaming::StreamChunk;
    use crate::tools::{BashLineCallback, ToolInvocationOutcome, ToolServiceError};
    use futures_util::stream::{self, BoxStream};
    use std::time::Duration;

    struct EchoProvider;
    #[async_trait]
    impl ChatProvider for EchoProvider {
        async fn generate_content(&self, _model: &ModelId, _messages: &[Message], _tools: &[ToolDeclaration]) -> std::result::Result<Message, ProviderError> {
            Ok(Message::assistant("hi"))
        }
        async fn generate_content_stream(
            &self,
            _model: &ModelId,
            _messages: &[Message],
            _tools: &[ToolDeclaration],
        ) -> std::result::Result<BoxStream<'static, std::result::Result<StreamChunk, ProviderError>>, ProviderError> {
            let chunks = vec![Ok(StreamChunk::Text("hi".into())), Ok(StreamChunk::Done)];
            Ok(Box::pin(stream::iter(chunks)))
        }
        async fn list_models(&self, _provider: &str) -> std::result::Result<Vec<String>, ProviderError> {
            Ok(Vec::new())
        }
        async fn health_check(&self, _provider: &str, _timeout: Duration) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    struct NoTools;
    #[async_trait]
    impl ToolService for NoTools {
        fn list_tools_for_mode(&self, _mode: AgentMode) -> Vec<ToolDeclaration> {
            Vec::new()
        }
        fn validate_tool(&self, _name: &str, _arguments: &serde_json::Value) -> std::result::Result<(), ToolServiceError> {
            Ok(())
        }
        async fn execute_tool(
            &self,
            _function_name: &str,
            _arguments: serde_json::Value,
            _bash_output: Option<BashLineCallback>,
        ) -> std::result::Result<ToolInvocationOutcome, ToolServiceError> {
            Ok(ToolInvocationOutcome::simple(serde_json::Value::Null))
        }
        fn task_tracker(&self) -> Option<Arc<RemoteTaskTracker>> {
            None
        }
    }

    struct NullRepo;
    #[async_trait]
    impl ConversationRepository for NullRepo {
        async fn add_message(&self, _entry: crate::conversation::ConversationEntry) -> std::result::Result<(), RepositoryError> {
            Ok(())
        }
        async fn add_token_usage(&self, _model: &str, _usage: &crate::message::Usage) -> std::result::Result<(), RepositoryError> {
            Ok(())
        }
        async fn remove_pending_tool_call_by_id(&self, _id: &str) -> std::result::Result<(), RepositoryError> {
            Ok(())
        }
    }

    fn service() -> AgentService {
        AgentService::new(
            Arc::new(EchoProvider),
            Arc::new(NoTools),
            Arc::new(NullRepo),
            Arc::new(ApprovalPolicy::new(ApprovalConfig::default())),
            Arc::new(ConversationOptimizer::new(None, OptimizerConfig::default())),
            4,
        )
    }

    #[tokio::test]
    async fn run_completes_a_single_turn_without_tools() {
        let svc = service();
        let mut conversation = Conversation::new();
        conversation.push(crate::conversation::ConversationEntry::new(Message::user("hello"), 0));

        let events = svc
            .run(RunInput {
                request_id: "req-1".into(),
                model: "openai/gpt-4".into(),
                max_turns: 10,
                mode: AgentMode::AutoAccept,
                conversation,
            })
            .await
            .unwrap();

        assert!(events.iter().any(|e| matches!(e.kind, crate::events::ChatEventKind::ChatStart)));
        assert!(events.iter().any(|e| matches!(e.kind, crate::events::ChatEventKind::ChatComplete { .. })));
    }

    #[tokio::test]
    async fn second_concurrent_session_is_rejected() {
        let svc = service();
        let mut conversation = Conversation::new();
        conversation.push(crate::conversation::ConversationEntry::new(Message::user("hello"), 0));

        let (_rx, _approvals, _cancel) = svc
            .run_with_stream(RunInput {
                request_id: "req-1".into(),
                model: "openai/gpt-4".into(),
                max_turns: 10,
                mode: AgentMode::AutoAccept,
                conversation: conversation.clone(),
            })
            .await
            .unwrap();

        let second = svc
            .run_with_stream(RunInput {
                request_id: "req-2".into(),
                model: "openai/gpt-4".into(),
                max_turns: 10,
                mode: AgentMode::AutoAccept,
                conversation,
            })
            .await;
        assert!(second.is_err());
    }
}
