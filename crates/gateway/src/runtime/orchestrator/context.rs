//! Shared types threaded through every tool call: [`ToolContext`],
//! [`ToolResult`], and the toolset-role matrix used to gate which tools
//! each kind of conversation can see.

use std::path::PathBuf;
use std::sync::Arc;

use sa_domain::conversation::MemoriesMap;
use sa_providers::{LlmService, ProviderRegistry};

use super::conversation_store::ConversationStore;
use super::model_switch::ModelSwitchQueue;
use super::tickets::TicketStore;
use sa_tools::ProcessManager;

use crate::runtime::cancel::CancelToken;

/// Which toolset a conversation sees. Distinct from [`sa_domain::ticket::TicketStatus`]
/// because Planning's toolset depends on the *ticket's* status, not the
/// conversation's own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolsetRole {
    PlanningBacklog,
    PlanningActive,
    Developer,
    SubAgent,
    Compaction,
}

/// Everything a tool handler needs beyond its own arguments. Not exposed to
/// the model — handlers receive this as a plain parameter, not a schema
/// property.
pub struct ToolContext {
    pub toolset_role: ToolsetRole,
    pub llm: Arc<LlmService>,
    pub registry: Arc<ProviderRegistry>,
    pub memories: MemoriesMap,
    pub ticket_store: Arc<TicketStore>,
    pub conversation_store: Arc<ConversationStore>,
    pub model_switch: Arc<ModelSwitchQueue>,
    pub processes: Arc<ProcessManager>,
    pub workspace_dir: PathBuf,
    pub ticket_id: String,
    pub task_id: Option<String>,
    pub subtask_id: Option<String>,
    /// Outer loop cancellation (set by the interrupt cascade).
    pub cancel: CancelToken,
    /// Per-conversation token for tools/sub-agents, cancelled first.
    pub tool_cancel: CancelToken,
    pub sub_agent_depth: usize,
}

/// Result of dispatching one tool call. `exit_loop` tells the driver to stop
/// after this call and surface `response` as the exit payload; otherwise
/// `response` is appended to the conversation as the tool result message.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub response: String,
    pub exit_loop: bool,
}

impl ToolResult {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            exit_loop: false,
        }
    }

    /// Same wire shape as `ok` — named separately so call sites read clearly
    /// when the response describes a failed validation or handler error.
    pub fn error(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            exit_loop: false,
        }
    }

    pub fn exit(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            exit_loop: true,
        }
    }
}

/// Responses over this size are truncated, keeping the first and last half
/// separated by an omitted-bytes marker.
const MAX_RESPONSE_BYTES: usize = 160 * 1024;
const HALF: usize = 80 * 1024;

pub fn truncate_response(s: &str) -> String {
    if s.len() <= MAX_RESPONSE_BYTES {
        return s.to_string();
    }

    let mut head_end = HALF;
    while !s.is_char_boundary(head_end) && head_end > 0 {
        head_end -= 1;
    }
    let mut tail_start = s.len() - HALF;
    while !s.is_char_boundary(tail_start) && tail_start < s.len() {
        tail_start += 1;
    }

    let omitted = s.len() - head_end - (s.len() - tail_start);
    format!(
        "{}\n\n... [{omitted} bytes omitted] ...\n\n{}",
        &s[..head_end],
        &s[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_under_limit_is_untouched() {
        let s = "x".repeat(100);
        assert_eq!(truncate_response(&s), s);
    }

    #[test]
    fn response_over_limit_is_truncated_with_marker() {
        let s = "a".repeat(200 * 1024);
        let out = truncate_response(&s);
        assert!(out.len() < s.len());
        assert!(out.contains("bytes omitted"));
        assert!(out.starts_with('a'));
        assert!(out.ends_with('a'));
    }
}
