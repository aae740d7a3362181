//! State-machine orchestrator for an interactive LLM agent: streaming
//! output reconstruction, approval-gated tool execution, a concurrent
//! message queue, conversation compaction, and remote-agent task tracking
//! (see `SPEC_FULL.md`).

pub mod agent;
pub mod approval;
pub mod conversation;
pub mod error;
pub mod events;
pub mod executor;
pub mod message;
pub mod optimizer;
pub mod provider;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod service;
pub mod state_manager;
pub mod streaming;
pub mod tokenizer;
pub mod tools;

pub use agent::{AgentContext, AgentMachine, AgentRequest, AgentState, EventApprovalChannel};
pub use error::{AgentRuntimeError, Result};
pub use service::{AgentService, RunInput};
