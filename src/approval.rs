//! Approval Policy: a small enum describing the session's current
//! operating mode, consulted alongside per-tool allow/deny configuration
//! and an auto-accept flag.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Runtime operating mode for the agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Full read/write, approval required per configuration.
    Standard,
    /// Nothing requires approval for the remainder of the session.
    AutoAccept,
    /// Writes are disallowed and always require approval, regardless of
    /// AutoAccept — a stronger, explicit safety boundary than the
    /// session-scoped convenience flag.
    Plan,
}

/// Static, per-tool configuration consulted by the policy.
#[derive(Debug, Clone, Default)]
pub struct ApprovalConfig {
    pub always_approve: HashSet<String>,
    pub always_require_approval: HashSet<String>,
    pub write_tools: HashSet<String>,
}

impl ApprovalConfig {
    pub fn is_write_tool(&self, tool_name: &str) -> bool {
        self.write_tools.contains(tool_name)
    }
}

/// The 5-minute hard timeout on an approval UI round-trip.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Decides, per tool call, whether user confirmation is required.
///
/// `auto_accept` is session-scoped and sticky: once a tool is approved
/// under auto-accept mode, later calls of the same kind skip the prompt for
/// the rest of the session; the executor is responsible for flipping it,
/// this policy only reads it.
pub struct ApprovalPolicy {
    config: ApprovalConfig,
    auto_accept: AtomicBool,
}

impl ApprovalPolicy {
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            config,
            auto_accept: AtomicBool::new(false),
        }
    }

    pub fn set_auto_accept(&self, value: bool) {
        self.auto_accept.store(value, Ordering::SeqCst);
    }

    pub fn is_auto_accept(&self) -> bool {
        self.auto_accept.load(Ordering::SeqCst)
    }

    /// Whether `tool_name` requires an approval round-trip before
    /// execution, given the current `mode`.
    pub fn requires_approval(&self, tool_name: &str, mode: AgentMode) -> bool {
        match mode {
            AgentMode::Plan => {
                // Plan mode forbids writes outright and always gates them
                // behind approval, regardless of auto-accept (§D(a)).
                self.config.is_write_tool(tool_name) || self.config.always_require_approval.contains(tool_name)
            }
            AgentMode::AutoAccept => false,
            AgentMode::Standard => {
                if self.config.always_approve.contains(tool_name) {
                    return false;
                }
                if self.is_auto_accept() {
                    return false;
                }
                self.config.always_require_approval.contains(tool_name)
                    || self.config.is_write_tool(tool_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ApprovalPolicy {
        let mut cfg = ApprovalConfig::default();
        cfg.write_tools.insert("write_file".into());
        cfg.always_approve.insert("read_file".into());
        ApprovalPolicy::new(cfg)
    }

    #[test]
    fn auto_accept_mode_requires_nothing() {
        let p = policy();
        assert!(!p.requires_approval("write_file", AgentMode::AutoAccept));
    }

    #[test]
    fn plan_mode_always_gates_writes_even_with_session_auto_accept() {
        let p = policy();
        p.set_auto_accept(true);
        assert!(p.requires_approval("write_file", AgentMode::Plan));
    }

    #[test]
    fn standard_mode_respects_always_approve_list() {
        let p = policy();
        assert!(!p.requires_approval("read_file", AgentMode::Standard));
        assert!(p.requires_approval("write_file", AgentMode::Standard));
    }

    #[test]
    fn session_auto_accept_skips_prompt_in_standard_mode() {
        let p = policy();
        assert!(p.requires_approval("write_file", AgentMode::Standard));
        p.set_auto_accept(true);
        assert!(!p.requires_approval("write_file", AgentMode::Standard));
    }
}
