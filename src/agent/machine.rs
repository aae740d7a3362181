//! The Event-Driven Agent's state loop: one `transition_*` method per
//! state, driven by [`AgentMachine::run`]. Cancellation is checked first in
//! every transition. `ApprovingTools`/`ExecutingTools` are collapsed into a
//! single transition here: [`crate::executor::ToolExecutor::execute`]
//! already performs the serial-approval-then-parallel-execution algorithm,
//! so splitting them again at this layer would just re-derive the same
//! partition the executor already computes.

use super::state::{AgentContext, AgentRequest, AgentState};
use crate::conversation::ConversationEntry;
use crate::error::{AgentRuntimeError, Result};
use crate::events::{ChatEventKind, EventSink, TodoItem, ToolCallChunk};
use crate::executor::status::ToolStatusSink;
use crate::executor::ToolExecutor;
use crate::message::Message;
use crate::optimizer::ConversationOptimizer;
use crate::provider::ChatProvider;
use crate::streaming::{StreamChunk, StreamingAggregator};
use crate::tools::ToolService;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::instrument;

pub struct AgentMachine {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<dyn ToolService>,
    executor: Arc<ToolExecutor>,
    optimizer: Arc<ConversationOptimizer>,
    status_sink: Arc<dyn ToolStatusSink>,
    tokenizer: crate::tokenizer::TokenizerPolyfill,
}

impl AgentMachine {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        tools: Arc<dyn ToolService>,
        executor: Arc<ToolExecutor>,
        optimizer: Arc<ConversationOptimizer>,
        status_sink: Arc<dyn ToolStatusSink>,
    ) -> Self {
        Self {
            provider,
            tools,
            executor,
            optimizer,
            status_sink,
            tokenizer: crate::tokenizer::TokenizerPolyfill::default(),
        }
    }

    /// Drive one request to completion. Terminal states are `Idle` (normal
    /// completion) and `Error` (surfaced as `ChatError` and then treated as
    /// terminal too); both return `Ok(())` — the failure is visible on the
    /// event stream, not as an `Err` here.
    #[instrument(name = "agent.run", skip(self, ctx, request, events), fields(request_id = %request.request_id))]
    pub async fn run(&self, ctx: &mut AgentContext, request: &AgentRequest, events: &EventSink) -> Result<()> {
        let mut state = AgentState::CheckingQueue;

        loop {
            if ctx.is_cancelled() {
                events.emit(ChatEventKind::Cancelled).await;
                return Ok(());
            }

            state = match state {
                AgentState::Idle => return Ok(()),
                AgentState::CheckingQueue => self.transition_checking_queue(ctx, events).await,
                AgentState::StreamingLLM => self.transition_streaming_llm(ctx, request, events).await?,
                AgentState::PostStream => self.transition_post_stream(ctx, request).await?,
                AgentState::EvaluatingTools => AgentState::ExecutingTools,
                AgentState::ApprovingTools => AgentState::ExecutingTools,
                AgentState::ExecutingTools => self.transition_executing_tools(ctx, events).await,
                AgentState::PostToolExecution => self.transition_post_tool_execution(ctx),
                AgentState::Completing => {
                    match self.transition_completing(ctx, request, events).await? {
                        AgentState::Idle => return Ok(()),
                        next => next,
                    }
                }
                AgentState::Error => {
                    self.transition_error(ctx, events).await;
                    return Ok(());
                }
            };
        }
    }

    /// Drains the queue, folding any waiting messages into the
    /// conversation, and decides whether another provider call is needed.
    /// `max_turns` gates every path into `StreamingLLM`, including the
    /// `has_tool_results` shortcut: reaching it forces `Completing` even
    /// with pending tool results.
    #[instrument(skip(self, ctx, events))]
    async fn transition_checking_queue(&self, ctx: &mut AgentContext, events: &EventSink) -> AgentState {
        if ctx.turns >= ctx.max_turns {
            return AgentState::Completing;
        }

        // Always drain first: messages enqueued while tools were executing
        // must be folded in before the next provider call, even when the
        // `has_tool_results` shortcut below is about to fire.
        let drained = ctx.queue.drain();
        let queue_was_empty = drained.is_empty();

        for queued in drained {
            let entry = ConversationEntry::new(queued.message, queued.queued_at_unix);
            ctx.conversation.push(entry.clone());
            if let Err(e) = ctx.repo.add_message(entry).await {
                log::warn!("failed to persist queued message: {e}");
            }
            // (b): MessageQueued precedes the next cycle's ChatStart.
            events
                .emit(ChatEventKind::MessageQueued { request_id: queued.request_id })
                .await;
        }
        ctx.state_manager.set_queued_len(ctx.queue.len());

        if ctx.has_tool_results {
            ctx.has_tool_results = false;
            return AgentState::StreamingLLM;
        }

        if queue_was_empty && ctx.turns > 0 && ctx.conversation.last_is_assistant_without_tool_calls() {
            AgentState::Completing
        } else {
            AgentState::StreamingLLM
        }
    }

    /// Issues the provider call and streams the response, aggregating
    /// chunks into a pending turn.
    #[instrument(skip(self, ctx, request, events))]
    async fn transition_streaming_llm(
        &self,
        ctx: &mut AgentContext,
        request: &AgentRequest,
        events: &EventSink,
    ) -> Result<AgentState> {
        ctx.turns += 1;
        events.emit(ChatEventKind::ChatStart).await;

        let optimized = self.optimizer.optimize(&ctx.conversation, &request.model, false, events).await;
        ctx.conversation = optimized;

        let tool_declarations = self.tools.list_tools_for_mode(ctx.mode);
        let prompt_messages: Vec<Message> = ctx.conversation.messages().into_iter().cloned().collect();

        let mut stream = match self
            .provider
            .generate_content_stream(&request.model, &prompt_messages, &tool_declarations)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                ctx.last_error = Some(e.to_string());
                return Ok(AgentState::Error);
            }
        };

        let mut aggregator = StreamingAggregator::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    ctx.last_error = Some(e.to_string());
                    return Ok(AgentState::Error);
                }
            };

            if ctx.is_cancelled() {
                return Ok(AgentState::Error);
            }

            emit_chunk_event(events, &chunk).await;
            let done = matches!(chunk, StreamChunk::Done);
            aggregator.push(chunk);
            if done {
                break;
            }
        }

        let prompt_refs: Vec<&Message> = prompt_messages.iter().collect();
        ctx.pending_turn = Some(aggregator.finish(&prompt_refs, &self.tokenizer));

        Ok(AgentState::PostStream)
    }

    /// Commits the aggregated turn to the conversation and persists it,
    /// then decides whether to route to tool evaluation or completion.
    #[instrument(skip(self, ctx, request))]
    async fn transition_post_stream(&self, ctx: &mut AgentContext, request: &AgentRequest) -> Result<AgentState> {
        let turn = ctx
            .pending_turn
            .take()
            .ok_or_else(|| AgentRuntimeError::StateInconsistency("PostStream entered without a pending turn".into()))?;

        ctx.last_reasoning = turn.reasoning.clone();
        ctx.last_tool_calls = turn.tool_calls.clone();
        ctx.last_usage = turn.usage.clone();
        ctx.cumulative_usage.accumulate(&turn.usage);

        let message = Message::assistant_with_tool_calls(turn.content.clone(), turn.tool_calls.clone(), turn.reasoning.clone());
        let entry = ConversationEntry::new(message, now_unix());
        ctx.conversation.push(entry.clone());
        if let Err(e) = ctx.repo.add_message(entry).await {
            log::warn!("failed to persist assistant message: {e}");
        }
        if let Err(e) = ctx.repo.add_token_usage(&request.model.model, &turn.usage).await {
            log::warn!("failed to persist token usage: {e}");
        }

        if !ctx.queue.is_empty() {
            return Ok(AgentState::CheckingQueue);
        }

        if turn.tool_calls.is_empty() {
            if !turn.content.is_empty() {
                Ok(AgentState::Completing)
            } else {
                Ok(AgentState::CheckingQueue)
            }
        } else {
            ctx.current_tool_calls = turn.tool_calls;
            ctx.has_tool_results = false;
            Ok(AgentState::EvaluatingTools)
        }
    }

    /// Runs the approval-then-execution pipeline for the pending tool
    /// calls (subsuming the approval step, see module docs) and applies any
    /// special tool effects (plan requests, todo updates).
    #[instrument(skip(self, ctx, events))]
    async fn transition_executing_tools(&self, ctx: &mut AgentContext, events: &EventSink) -> AgentState {
        let calls = ctx.current_tool_calls.clone();
        let now = now_unix();

        ctx.state_manager.set_tool_execution_active(true, now);
        let outcome = self
            .executor
            .execute(&calls, ctx.mode, now, self.status_sink.as_ref(), &mut ctx.cancel_rx)
            .await;
        ctx.state_manager.set_tool_execution_active(false, now_unix());

        for entry in &outcome.entries {
            ctx.conversation.push(entry.clone());
        }
        if let Some(image_entry) = outcome.hidden_image_entry {
            ctx.conversation.push(image_entry);
        }
        ctx.has_tool_results = true;

        if outcome.cancelled {
            ctx.last_error = Some("cancelled".to_string());
            return AgentState::Error;
        }

        events
            .emit(ChatEventKind::ToolExecutionCompleted {
                success_count: outcome.success_count,
                failure_count: outcome.failure_count,
            })
            .await;

        if outcome.todo_updated {
            let todos = extract_todo_items(&outcome.entries);
            ctx.state_manager.set_todos(todos.clone(), now_unix());
            events.emit(ChatEventKind::TodoUpdate { todos }).await;
        }

        if let Some(plan) = outcome.plan_pending {
            ctx.state_manager.set_plan_pending(Some(plan.clone()), now_unix());
            events.emit(ChatEventKind::PlanApprovalRequested { plan: plan.clone() }).await;
            let mut entry = ConversationEntry::new(Message::assistant(plan), now_unix());
            entry.plan_approval_pending = true;
            ctx.conversation.push(entry.clone());
            if let Err(e) = ctx.repo.add_message(entry).await {
                log::warn!("failed to persist plan message: {e}");
            }
            return AgentState::Completing;
        }

        // A rejection halts the loop here: it is visible to the user and
        // persisted, but no further provider call is made for this batch.
        if outcome.any_rejected {
            return AgentState::Completing;
        }

        AgentState::PostToolExecution
    }

    /// Decides whether another cycle is owed after a tool batch completes.
    fn transition_post_tool_execution(&self, ctx: &AgentContext) -> AgentState {
        if ctx.turns >= ctx.max_turns {
            AgentState::Completing
        } else {
            AgentState::CheckingQueue
        }
    }

    /// Emits the terminal `ChatComplete` event and returns to `Idle`.
    #[instrument(skip(self, ctx, _request, events))]
    async fn transition_completing(
        &self,
        ctx: &mut AgentContext,
        _request: &AgentRequest,
        events: &EventSink,
    ) -> Result<AgentState> {
        let drained = ctx.queue.drain();
        if !drained.is_empty() {
            for queued in drained {
                let entry = ConversationEntry::new(queued.message, queued.queued_at_unix);
                ctx.conversation.push(entry.clone());
                if let Err(e) = ctx.repo.add_message(entry).await {
                    log::warn!("failed to persist queued message: {e}");
                }
                events
                    .emit(ChatEventKind::MessageQueued { request_id: queued.request_id })
                    .await;
            }
            return Ok(AgentState::CheckingQueue);
        }

        events
            .emit(ChatEventKind::ChatComplete {
                reasoning: ctx.last_reasoning.clone(),
                tool_calls: ctx.last_tool_calls.clone(),
                usage: ctx.cumulative_usage.clone(),
                turns: ctx.turns,
            })
            .await;

        Ok(AgentState::Idle)
    }

    /// Emits the terminal `ChatError` event.
    async fn transition_error(&self, ctx: &AgentContext, events: &EventSink) {
        let message = ctx.last_error.clone().unwrap_or_else(|| "unknown error".to_string());
        events.emit(ChatEventKind::ChatError { message }).await;
    }
}

async fn emit_chunk_event(events: &EventSink, chunk: &StreamChunk) {
    match chunk {
        StreamChunk::Text(delta) => {
            events
                .emit(ChatEventKind::ChatChunk { text_delta: Some(delta.clone()), reasoning_delta: None, tool_call_chunk: None })
                .await;
        }
        StreamChunk::Reasoning(delta) => {
            events
                .emit(ChatEventKind::ChatChunk { text_delta: None, reasoning_delta: Some(delta.clone()), tool_call_chunk: None })
                .await;
        }
        StreamChunk::ToolCallStart { index, id, name } => {
            events
                .emit(ChatEventKind::ChatChunk {
                    text_delta: None,
                    reasoning_delta: None,
                    tool_call_chunk: Some(ToolCallChunk {
                        index: *index,
                        id: Some(id.clone()),
                        name: Some(name.clone()),
                        arguments_delta: None,
                    }),
                })
                .await;
        }
        StreamChunk::ToolCallArgumentsDelta { index, partial_json } => {
            events
                .emit(ChatEventKind::ChatChunk {
                    text_delta: None,
                    reasoning_delta: None,
                    tool_call_chunk: Some(ToolCallChunk {
                        index: *index,
                        id: None,
                        name: None,
                        arguments_delta: Some(partial_json.clone()),
                    }),
                })
                .await;
        }
        StreamChunk::Usage(_) | StreamChunk::Done => {}
    }
}

/// `TodoWrite`'s result data carries the rendered todo list under a `todos`
/// array; parse it back out for the event.
fn extract_todo_items(entries: &[ConversationEntry]) -> Vec<TodoItem> {
    entries
        .iter()
        .filter_map(|e| e.tool_result.as_ref())
        .filter(|r| r.tool_name == "TodoWrite")
        .filter_map(|r| r.data.as_ref())
        .filter_map(|data| data.get("todos"))
        .filter_map(|todos| serde_json::from_value::<Vec<TodoItem>>(todos.clone()).ok())
        .next()
        .unwrap_or_default()
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalConfig, ApprovalPolicy};
    use crate::conversation::Conversation;
    use crate::executor::{ApprovalChannel, ApprovalDecision};
    use crate::optimizer::{ConversationOptimizer, OptimizerConfig};
    use crate::provider::{ChatProvider, ModelId, ProviderError, ToolDeclaration};
    use crate::queue::{MessageQueue, QueuedMessage};
    use crate::repository::{ConversationRepository, RepositoryError};
    use crate::state_manager::StateManager;
    use crate::streaming::StreamChunk;
    use crate::tools::{BashLineCallback, ToolInvocationOutcome, ToolService, ToolServiceError};
    use futures_util::stream::{self, BoxStream};

    struct NullRepo;
    #[async_trait::async_trait]
    impl ConversationRepository for NullRepo {
        async fn add_message(&self, _entry: ConversationEntry) -> std::result::Result<(), RepositoryError> {
            Ok(())
        }
        async fn add_token_usage(&self, _model: &str, _usage: &crate::message::Usage) -> std::result::Result<(), RepositoryError> {
            Ok(())
        }
        async fn remove_pending_tool_call_by_id(&self, _id: &str) -> std::result::Result<(), RepositoryError> {
            Ok(())
        }
    }

    struct NoTools;
    #[async_trait::async_trait]
    impl ToolService for NoTools {
        fn list_tools_for_mode(&self, _mode: crate::approval::AgentMode) -> Vec<ToolDeclaration> {
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
    }

    struct NoApprovals;
    #[async_trait::async_trait]
    impl ApprovalChannel for NoApprovals {
        async fn request_approval(&self, _id: &str, _name: &str, _args: &str) -> Option<ApprovalDecision> {
            None
        }
    }

    struct EchoProvider;
    #[async_trait::async_trait]
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
            Ok(Box::pin(stream::iter(vec![Ok(StreamChunk::Text("hi".into())), Ok(StreamChunk::Done)])))
        }
        async fn list_models(&self, _provider: &str) -> std::result::Result<Vec<String>, ProviderError> {
            Ok(Vec::new())
        }
        async fn health_check(&self, _provider: &str, _timeout: std::time::Duration) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    fn test_machine() -> AgentMachine {
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(NoTools),
            Arc::new(NullRepo),
            Arc::new(ApprovalPolicy::new(ApprovalConfig::default())),
            Arc::new(NoApprovals),
            4,
        ));
        let (status_sink, _rx) = crate::events::EventSink::new(10, "req-1");
        AgentMachine::new(
            Arc::new(EchoProvider),
            Arc::new(NoTools),
            executor,
            Arc::new(ConversationOptimizer::new(None, OptimizerConfig::default())),
            Arc::new(status_sink) as Arc<dyn ToolStatusSink>,
        )
    }

    fn test_ctx() -> AgentContext {
        let (_tx, cancel_rx) = tokio::sync::watch::channel(false);
        AgentContext::new(
            Conversation::new(),
            Arc::new(MessageQueue::new()),
            Arc::new(NullRepo),
            Arc::new(ApprovalPolicy::new(ApprovalConfig::default())),
            crate::approval::AgentMode::AutoAccept,
            10,
            true,
            cancel_rx,
            Arc::new(StateManager::new(10)),
        )
    }

    /// A message enqueued while a tool batch was executing must be folded
    /// into the conversation on the very next `CheckingQueue` cycle, even
    /// though `has_tool_results` is about to route straight to
    /// `StreamingLLM`. Before the fix, the shortcut skipped the drain
    /// entirely and `has_tool_results` was never cleared, so the queued
    /// message would never be folded in until `max_turns` was exhausted.
    #[tokio::test]
    async fn checking_queue_drains_before_taking_the_tool_results_shortcut() {
        let machine = test_machine();
        let mut ctx = test_ctx();
        ctx.has_tool_results = true;
        ctx.queue.enqueue(QueuedMessage {
            message: Message::user("are you still there?"),
            request_id: "req-1".into(),
            queued_at_unix: 0,
        });

        let (events, _rx) = crate::events::EventSink::new(10, "req-1");

        let next = machine.transition_checking_queue(&mut ctx, &events).await;

        assert_eq!(next, AgentState::StreamingLLM);
        assert!(!ctx.has_tool_results, "shortcut must clear the flag once consumed");
        assert!(ctx.queue.is_empty());
        assert_eq!(ctx.conversation.messages().last().unwrap().text(), "are you still there?");
    }
}
