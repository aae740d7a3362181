//! Agent state machine states and the per-request context.
//!
//! States are a small data-free enum naming each node; all per-request data
//! lives on `AgentContext`, passed by mutable borrow to the orchestrator
//! only — no per-variant state snapshots.

use crate::approval::{AgentMode, ApprovalPolicy};
use crate::conversation::Conversation;
use crate::message::{ToolCallRequest, Usage};
use crate::queue::MessageQueue;
use crate::repository::ConversationRepository;
use crate::state_manager::StateManager;
use crate::streaming::AggregatedTurn;
use std::sync::Arc;
use tokio::sync::watch;

/// One request's model id + turn budget.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub request_id: String,
    pub model: crate::provider::ModelId,
    pub max_turns: usize,
}

/// Node in the state machine. Initial = `Idle`; terminals are `Idle`
/// (reached via `Completing`) and `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    CheckingQueue,
    StreamingLLM,
    PostStream,
    EvaluatingTools,
    ApprovingTools,
    ExecutingTools,
    PostToolExecution,
    Completing,
    Error,
}

/// One per request. The orchestrator is the sole mutator; tool
/// workers and the optimizer receive borrows, never ownership.
pub struct AgentContext {
    pub conversation: Conversation,
    pub queue: Arc<MessageQueue>,
    pub repo: Arc<dyn ConversationRepository>,
    pub current_tool_calls: Vec<ToolCallRequest>,
    pub turns: usize,
    pub max_turns: usize,
    pub has_tool_results: bool,
    pub approval_policy: Arc<ApprovalPolicy>,
    pub mode: AgentMode,
    pub is_chat_mode: bool,
    pub cancel_rx: watch::Receiver<bool>,
    /// Set on entry to `Error`; surfaced in the terminal `ChatError` event.
    pub last_error: Option<String>,
    /// The turn just streamed from the provider, held between
    /// `StreamingLLM` and `PostStream`.
    pub pending_turn: Option<AggregatedTurn>,
    /// Cached from the most recent `PostStream`, surfaced in the terminal
    /// `ChatComplete` event.
    pub last_reasoning: Option<String>,
    pub last_tool_calls: Vec<ToolCallRequest>,
    pub last_usage: Usage,
    /// Running total across every turn of this request, folded in at each
    /// `PostStream` and surfaced on `ChatComplete`.
    pub cumulative_usage: Usage,
    /// Shared session state surfaced to callers outside the state machine:
    /// busy flag, approval queue, todos, pending plan.
    pub state_manager: Arc<StateManager>,
}

impl AgentContext {
    pub fn new(
        conversation: Conversation,
        queue: Arc<MessageQueue>,
        repo: Arc<dyn ConversationRepository>,
        approval_policy: Arc<ApprovalPolicy>,
        mode: AgentMode,
        max_turns: usize,
        is_chat_mode: bool,
        cancel_rx: watch::Receiver<bool>,
        state_manager: Arc<StateManager>,
    ) -> Self {
        Self {
            conversation,
            queue,
            repo,
            current_tool_calls: Vec::new(),
            turns: 0,
            max_turns,
            has_tool_results: false,
            approval_policy,
            mode,
            is_chat_mode,
            cancel_rx,
            last_error: None,
            pending_turn: None,
            last_reasoning: None,
            last_tool_calls: Vec::new(),
            last_usage: Usage::default(),
            cumulative_usage: Usage::default(),
            state_manager,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}
