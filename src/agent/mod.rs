//! Event-Driven Agent: the per-request state machine.

pub mod approval_bridge;
pub mod machine;
pub mod state;

pub use approval_bridge::EventApprovalChannel;
pub use machine::AgentMachine;
pub use state::{AgentContext, AgentRequest, AgentState};
