//! Tool Executor: approval-gated serial execution for calls that need it,
//! parallel execution (bounded by a semaphore) for calls that don't,
//! heartbeat status events, and order-preserving result collection.

pub mod status;

use crate::approval::{AgentMode, ApprovalPolicy, APPROVAL_TIMEOUT};
use crate::conversation::ConversationEntry;
use crate::message::{ContentPart, Message, ToolCallRequest, ToolCallStatus, ToolExecutionResult};
use crate::repository::ConversationRepository;
use crate::streaming::validate_complete_json;
use crate::tools::{ToolService, ToolServiceError};
use async_trait::async_trait;
use futures_util::future::join_all;
use status::{ToolStatusSink, ToolStatusUpdate, HEARTBEAT_INTERVAL};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};

/// The user's reply to an approval prompt for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    /// Approved, and the session should stop prompting for the remainder
    /// of this session (auto-accept).
    ApprovedForSession,
    Rejected,
}

/// Approval round-trip, modeled as a reply channel: the executor awaits a
/// decision from whatever is driving the session rather than blocking on
/// an in-process callback.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request_approval(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        arguments: &str,
    ) -> Option<ApprovalDecision>;
}

pub struct ExecutionOutcome {
    pub entries: Vec<ConversationEntry>,
    pub hidden_image_entry: Option<ConversationEntry>,
    pub success_count: usize,
    pub failure_count: usize,
    /// Set when a `RequestPlanApproval` call succeeded with a non-empty
    /// plan; the agent halts awaiting plan approval.
    pub plan_pending: Option<String>,
    pub todo_updated: bool,
    pub cancelled: bool,
    /// True if any call in this batch was rejected by the user. The state
    /// machine treats this as "approval rejection halts the loop": no
    /// further provider call is made for the rejected batch.
    pub any_rejected: bool,
}

/// Carries a successful call's `plan`/`is_todo_update` signal out of
/// `run_one` without re-deriving it from the result's `data` payload.
#[derive(Default)]
struct SpecialEffects {
    plan: Option<String>,
    todo_updated: bool,
}

impl SpecialEffects {
    fn fold_into(self, plan_pending: &mut Option<String>, todo_updated: &mut bool) {
        if self.plan.is_some() {
            *plan_pending = self.plan;
        }
        if self.todo_updated {
            *todo_updated = true;
        }
    }
}

pub struct ToolExecutor {
    tools: Arc<dyn ToolService>,
    repository: Arc<dyn ConversationRepository>,
    policy: Arc<ApprovalPolicy>,
    approvals: Arc<dyn ApprovalChannel>,
    max_concurrent_tools: usize,
}

impl ToolExecutor {
    pub fn new(
        tools: Arc<dyn ToolService>,
        repository: Arc<dyn ConversationRepository>,
        policy: Arc<ApprovalPolicy>,
        approvals: Arc<dyn ApprovalChannel>,
        max_concurrent_tools: usize,
    ) -> Self {
        Self {
            tools,
            repository,
            policy,
            approvals,
            max_concurrent_tools: max_concurrent_tools.max(1),
        }
    }

    /// Run every call to completion. `on_status` is invoked for every
    /// status transition; `cancel_rx` is the request-scoped cancellation
    /// watch channel.
    pub async fn execute(
        &self,
        calls: &[ToolCallRequest],
        mode: AgentMode,
        now_unix: i64,
        on_status: &dyn ToolStatusSink,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        for call in calls {
            on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Queued)).await;
        }

        if *cancel_rx.borrow() {
            return self.cancelled_outcome(calls, now_unix, on_status).await;
        }

        let (needs_approval, free): (Vec<_>, Vec<_>) = calls
            .iter()
            .cloned()
            .partition(|c| self.policy.requires_approval(&c.function_name, mode));

        let mut results: Vec<(usize, ToolExecutionResult)> = Vec::with_capacity(calls.len());
        let mut plan_pending = None;
        let mut todo_updated = false;
        let mut images: Vec<ContentPart> = Vec::new();

        // 3. Serial approval chain, declaration order.
        for call in &needs_approval {
            if *cancel_rx.borrow() {
                return self.cancelled_outcome(calls, now_unix, on_status).await;
            }

            let idx = calls.iter().position(|c| c.id == call.id).unwrap();

            // Auto-accept may have been set by an earlier call in this same
            // batch; re-check rather than trusting the pre-loop partition.
            if !self.policy.requires_approval(&call.function_name, mode) {
                let (result, effects) = self.run_one(call, on_status, cancel_rx).await;
                effects.fold_into(&mut plan_pending, &mut todo_updated);
                images.extend(result.images.clone());
                results.push((idx, result));
                continue;
            }

            let decision = self
                .approvals
                .request_approval(&call.id, &call.function_name, &call.arguments)
                .await;

            match decision {
                None => {
                    on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Failed)).await;
                    let args = serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
                    results.push((
                        idx,
                        ToolExecutionResult::failure(
                            &call.id,
                            &call.function_name,
                            args,
                            format!("approval timed out after {:?}", APPROVAL_TIMEOUT),
                            0,
                        ),
                    ));
                }
                Some(ApprovalDecision::Rejected) => {
                    on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Rejected)).await;
                    let args = serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
                    results.push((idx, ToolExecutionResult::rejected(&call.id, &call.function_name, args)));
                }
                Some(decision) => {
                    if decision == ApprovalDecision::ApprovedForSession {
                        self.policy.set_auto_accept(true);
                    }
                    let (result, effects) = self.run_one(call, on_status, cancel_rx).await;
                    effects.fold_into(&mut plan_pending, &mut todo_updated);
                    images.extend(result.images.clone());
                    results.push((idx, result));
                }
            }
        }

        // 4. Parallel free-tool execution, bounded concurrency.
        if !free.is_empty() && !*cancel_rx.borrow() {
            let semaphore = Arc::new(Semaphore::new(self.max_concurrent_tools));
            let futures: Vec<_> = free
                .iter()
                .map(|call| {
                    let semaphore = semaphore.clone();
                    async move {
                        let _permit = semaphore.acquire().await.expect("semaphore never closed");
                        self.run_one(call, on_status, &mut cancel_rx.clone()).await
                    }
                })
                .collect();

            let mut cancel_clone = cancel_rx.clone();
            let outcomes = tokio::select! {
                outcomes = join_all(futures) => outcomes,
                _ = cancel_clone.changed() => {
                    return self.cancelled_outcome(calls, now_unix, on_status).await;
                }
            };

            for (call, (result, effects)) in free.iter().zip(outcomes) {
                let idx = calls.iter().position(|c| c.id == call.id).unwrap();
                effects.fold_into(&mut plan_pending, &mut todo_updated);
                images.extend(result.images.clone());
                results.push((idx, result));
            }
        }

        // Tie-break: restore original declaration order before persistence.
        results.sort_by_key(|(idx, _)| *idx);

        let success_count = results.iter().filter(|(_, r)| r.success).count();
        let failure_count = results.len() - success_count;
        let any_rejected = results.iter().any(|(_, r)| r.rejected);

        let mut entries = Vec::with_capacity(results.len());
        for (_, result) in &results {
            let message = Message::tool_result(&result.tool_call_id, result.to_provider_text());
            let entry = ConversationEntry::new(message, now_unix).with_tool_result(result.clone());
            if let Err(e) = self.repository.add_message(entry.clone()).await {
                log::warn!("failed to persist tool result {}: {e}", result.tool_call_id);
            }
            entries.push(entry);
        }

        let hidden_image_entry = if images.is_empty() {
            None
        } else {
            let mut message = Message::user("");
            message.content = images;
            Some(ConversationEntry::new(message, now_unix).hidden())
        };

        ExecutionOutcome {
            entries,
            hidden_image_entry,
            success_count,
            failure_count,
            plan_pending,
            todo_updated,
            cancelled: false,
            any_rejected,
        }
    }

    /// Runs one call and reports its result alongside any special session
    /// effect (`plan`/`todo_updated`) the tool reported on success.
    async fn run_one(
        &self,
        call: &ToolCallRequest,
        on_status: &dyn ToolStatusSink,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> (ToolExecutionResult, SpecialEffects) {
        let start = Instant::now();
        let no_effects = SpecialEffects::default();

        // Step 5: validate JSON completeness before decoding/invoking.
        let args = match validate_complete_json(&call.arguments) {
            Ok(v) => v,
            Err(reason) => {
                on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Failed)).await;
                return (
                    ToolExecutionResult::failure(
                        &call.id,
                        &call.function_name,
                        serde_json::Value::Null,
                        reason,
                        start.elapsed().as_millis() as u64,
                    ),
                    no_effects,
                );
            }
        };

        if let Err(e) = self.tools.validate_tool(&call.function_name, &args) {
            on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Failed)).await;
            return (
                ToolExecutionResult::failure(&call.id, &call.function_name, args, e.to_string(), start.elapsed().as_millis() as u64),
                no_effects,
            );
        }

        on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Starting)).await;
        on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Running)).await;

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            call.id.clone(),
            call.function_name.clone(),
            cancel_rx.clone(),
        ));

        // Concrete line streaming for `Bash` is wired by the facade (it owns
        // the event sink); the core only reserves the callback slot.
        let invocation = self.tools.execute_tool(&call.function_name, args.clone(), None).await;
        heartbeat_task.abort();

        on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Saving)).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match invocation {
            Ok(outcome) => {
                on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Completed)).await;
                let effects = SpecialEffects { plan: outcome.plan.clone(), todo_updated: outcome.is_todo_update };
                let mut result = ToolExecutionResult::success(&call.id, &call.function_name, args, outcome.data, duration_ms);
                result.diff = outcome.diff;
                result.images = outcome.images;
                (result, effects)
            }
            Err(ToolServiceError::Validation { reason, .. }) => {
                on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Failed)).await;
                (ToolExecutionResult::failure(&call.id, &call.function_name, args, reason, duration_ms), no_effects)
            }
            Err(e) => {
                on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Failed)).await;
                (ToolExecutionResult::failure(&call.id, &call.function_name, args, e.to_string(), duration_ms), no_effects)
            }
        }
    }

    async fn cancelled_outcome(
        &self,
        calls: &[ToolCallRequest],
        now_unix: i64,
        on_status: &dyn ToolStatusSink,
    ) -> ExecutionOutcome {
        let mut entries = Vec::with_capacity(calls.len());
        for call in calls {
            on_status.on_status(ToolStatusUpdate::new(&call.id, &call.function_name, ToolCallStatus::Failed)).await;
            let args = serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
            let result = ToolExecutionResult::failure(&call.id, &call.function_name, args, "cancelled", 0);
            let message = Message::tool_result(&call.id, result.to_provider_text());
            entries.push(ConversationEntry::new(message, now_unix).with_tool_result(result));
        }
        ExecutionOutcome {
            entries,
            hidden_image_entry: None,
            success_count: 0,
            failure_count: calls.len(),
            plan_pending: None,
            todo_updated: false,
            cancelled: true,
            any_rejected: false,
        }
    }
}

async fn heartbeat_loop(tool_call_id: String, tool_name: String, mut cancel_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log::trace!("tool {tool_name} ({tool_call_id}) still running");
            }
            _ = cancel_rx.changed() => {
                return;
            }
        }
    }
}
