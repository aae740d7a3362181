//! State Manager: centralised, reader-writer-locked process state for the
//! chat session lifecycle, tool-approval queue, todos, and a bounded
//! debug-export ring buffer.
//!
//! View transitions, file-selection state, window dimensions, and other
//! desktop-companion-UI concerns belong to an external terminal UI and are
//! not modeled here; only the session/approval/todo state this runtime
//! itself owns is kept.

use crate::events::TodoItem;
use std::collections::VecDeque;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSessionStatus {
    Idle,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ChatSessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChatSessionStatus::Idle | ChatSessionStatus::Completed | ChatSessionStatus::Error | ChatSessionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub request_id: String,
    pub status: ChatSessionStatus,
    pub started_at_unix: i64,
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: String,
}

/// One point-in-time view, kept in the debug-export ring buffer.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub chat_session: Option<ChatSession>,
    pub is_agent_busy: bool,
    pub queued_len: usize,
    pub pending_tool_approvals: usize,
    pub plan_pending: bool,
    pub todos: Vec<TodoItem>,
    pub captured_at_unix: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StateManagerError {
    #[error("a chat session is already active")]
    SessionAlreadyActive,
    #[error("no active session found")]
    NotFound,
}

struct StateInner {
    chat_session: Option<ChatSession>,
    tool_execution_active: bool,
    queued_len: usize,
    pending_tool_approvals: Vec<PendingApproval>,
    plan_pending: Option<String>,
    todos: Vec<TodoItem>,
    history: VecDeque<StateSnapshot>,
}

pub struct StateManager {
    inner: RwLock<StateInner>,
    ring_buffer_capacity: usize,
}

impl StateManager {
    /// `ring_buffer_capacity` is clamped to at least 1; spec default is 100.
    pub fn new(ring_buffer_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StateInner {
                chat_session: None,
                tool_execution_active: false,
                queued_len: 0,
                pending_tool_approvals: Vec::new(),
                plan_pending: None,
                todos: Vec::new(),
                history: VecDeque::new(),
            }),
            ring_buffer_capacity: ring_buffer_capacity.max(1),
        }
    }

    /// Start a new chat session. Rejected unless any prior session is
    /// terminal.
    pub fn start_session(&self, request_id: impl Into<String>, now_unix: i64) -> Result<(), StateManagerError> {
        let mut inner = self.inner.write();
        if let Some(existing) = &inner.chat_session {
            if !existing.status.is_terminal() {
                return Err(StateManagerError::SessionAlreadyActive);
            }
        }
        inner.chat_session = Some(ChatSession {
            request_id: request_id.into(),
            status: ChatSessionStatus::Running,
            started_at_unix: now_unix,
        });
        self.record_snapshot(&mut inner, now_unix);
        Ok(())
    }

    pub fn set_session_status(&self, status: ChatSessionStatus, now_unix: i64) {
        let mut inner = self.inner.write();
        if let Some(session) = &mut inner.chat_session {
            session.status = status;
        }
        self.record_snapshot(&mut inner, now_unix);
    }

    /// Cancel `request_id`'s session. A request against an absent or
    /// already-terminal session returns `NotFound` — cancelling an idle
    /// request is a no-op.
    pub fn cancel_session(&self, request_id: &str, now_unix: i64) -> Result<(), StateManagerError> {
        let mut inner = self.inner.write();
        match &inner.chat_session {
            Some(s) if s.request_id == request_id && !s.status.is_terminal() => {
                inner.chat_session.as_mut().unwrap().status = ChatSessionStatus::Cancelled;
                self.record_snapshot(&mut inner, now_unix);
                Ok(())
            }
            _ => Err(StateManagerError::NotFound),
        }
    }

    /// True while a chat session is in a non-terminal status, or a tool
    /// execution session is active.
    pub fn is_agent_busy(&self) -> bool {
        let inner = self.inner.read();
        inner.chat_session.as_ref().is_some_and(|s| !s.status.is_terminal()) || inner.tool_execution_active
    }

    pub fn set_tool_execution_active(&self, active: bool, now_unix: i64) {
        let mut inner = self.inner.write();
        inner.tool_execution_active = active;
        self.record_snapshot(&mut inner, now_unix);
    }

    pub fn set_queued_len(&self, len: usize) {
        self.inner.write().queued_len = len;
    }

    pub fn push_tool_approval(&self, approval: PendingApproval, now_unix: i64) {
        let mut inner = self.inner.write();
        inner.pending_tool_approvals.push(approval);
        self.record_snapshot(&mut inner, now_unix);
    }

    pub fn resolve_tool_approval(&self, tool_call_id: &str, now_unix: i64) {
        let mut inner = self.inner.write();
        inner.pending_tool_approvals.retain(|a| a.tool_call_id != tool_call_id);
        self.record_snapshot(&mut inner, now_unix);
    }

    pub fn set_plan_pending(&self, plan: Option<String>, now_unix: i64) {
        let mut inner = self.inner.write();
        inner.plan_pending = plan;
        self.record_snapshot(&mut inner, now_unix);
    }

    pub fn set_todos(&self, todos: Vec<TodoItem>, now_unix: i64) {
        let mut inner = self.inner.write();
        inner.todos = todos;
        self.record_snapshot(&mut inner, now_unix);
    }

    pub fn current(&self) -> StateSnapshot {
        let inner = self.inner.read();
        self.snapshot_of(&inner, 0)
    }

    /// Debug export: the full ring buffer, oldest first.
    pub fn history(&self) -> Vec<StateSnapshot> {
        self.inner.read().history.iter().cloned().collect()
    }

    fn snapshot_of(&self, inner: &StateInner, now_unix: i64) -> StateSnapshot {
        StateSnapshot {
            chat_session: inner.chat_session.clone(),
            is_agent_busy: inner.chat_session.as_ref().is_some_and(|s| !s.status.is_terminal()) || inner.tool_execution_active,
            queued_len: inner.queued_len,
            pending_tool_approvals: inner.pending_tool_approvals.len(),
            plan_pending: inner.plan_pending.is_some(),
            todos: inner.todos.clone(),
            captured_at_unix: now_unix,
        }
    }

    fn record_snapshot(&self, inner: &mut StateInner, now_unix: i64) {
        let snapshot = self.snapshot_of(inner, now_unix);
        inner.history.push_back(snapshot);
        while inner.history.len() > self.ring_buffer_capacity {
            inner.history.pop_front();
        }
    }
}
