//! Agent Driver (C6) — runs one conversation's tool-calling loop to a
//! terminal outcome.
//!
//! States: Preflight -> Executing -> (SuspensionPoint -> Executing)* ->
//! Terminal. Every suspension point (the LLM call, the retry delay, each
//! tool handler, the availability wait) is a point the interrupt cascade
//! can observe and unwind at.

use std::collections::HashMap;

use sa_domain::conversation::ConversationData;
use sa_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall};
use sa_providers::{ChatRequest, LlmCallOutcome};

use super::context::{truncate_response, ToolContext, ToolsetRole};
use super::tools;

/// Driver-wide tunables (mirrors [`sa_domain::config::OrchestratorConfig`]).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub max_iterations: u32,
    pub availability_wait_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            availability_wait_secs: 30,
        }
    }
}

/// One tool call that asked the loop to exit, paired with the response text
/// already appended to the conversation as its tool result.
#[derive(Debug, Clone)]
pub struct ExitCall {
    pub tool_name: String,
    pub response: String,
}

/// Complete, enumerated terminal reasons for a driver invocation.
#[derive(Debug, Clone)]
pub enum Terminal {
    Completed(String),
    /// Every exit-flagged tool call from the iteration that ended the loop.
    /// Usually one call (`start_developer`, `ticket_end_subtask`,
    /// `agent_task_complete`, ...); can hold more than one when a Developer
    /// issues several `start_sub_agent` calls in the same assistant turn —
    /// the caller is responsible for running all of them.
    ToolRequestedExit { exits: Vec<ExitCall> },
    LlmCallFailed(String),
    MaxIterationsReached { recent_turns: Vec<String> },
    CostExceeded,
    RateLimited { retry_after: u64 },
    Interrupted,
    /// An operator redirected this ticket's conversation to a different
    /// configured LLM service. The caller should re-resolve the service for
    /// `new_provider_id` and call `run` again to continue.
    ModelChanged { new_provider_id: String },
    RepetitionDetected { recent_turns: Vec<String> },
}

/// Builds the fingerprint key for repetition detection: CRC32 of the
/// assistant content plus each tool call's name and arguments, joined with
/// NUL bytes. Tool-call ids are excluded since they vary per call.
fn fingerprint(content: &str, calls: &[ToolCall]) -> u32 {
    let mut buf = content.to_string();
    for call in calls {
        buf.push('\0');
        buf.push_str(&call.tool_name);
        buf.push('\0');
        buf.push_str(&call.arguments.to_string());
    }
    crc32fast::hash(buf.as_bytes())
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

/// Snippet-clipped transcript of the last `n` assistant turns and their
/// trailing tool results, used as the payload for terminals that end the
/// loop without a clean completion.
fn recent_turns_snippet(messages: &[Message], n: usize) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, msg) in messages.iter().enumerate().rev() {
        if msg.role != Role::Assistant {
            continue;
        }
        let mut turn = clip(&msg.content.extract_all_text(), 500);
        if let Some(next) = messages.get(idx + 1) {
            if next.role == Role::Tool {
                turn.push_str(" -> ");
                turn.push_str(&clip(&next.content.extract_all_text(), 500));
            }
        }
        out.push(turn);
        if out.len() >= n {
            break;
        }
    }
    out.reverse();
    out
}

fn assistant_message_with_calls(content: &str, calls: &[ToolCall]) -> Message {
    let mut parts = Vec::new();
    if !content.is_empty() {
        parts.push(ContentPart::Text { text: content.to_string() });
    }
    for call in calls {
        parts.push(ContentPart::ToolUse {
            id: call.call_id.clone(),
            name: call.tool_name.clone(),
            input: call.arguments.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

fn domain_tool_defs(role: ToolsetRole) -> Vec<sa_domain::tool::ToolDefinition> {
    tools::tool_definitions_for(role)
        .into_iter()
        .map(|d| sa_domain::tool::ToolDefinition {
            name: d.name,
            description: d.description,
            parameters: d.parameters,
        })
        .collect()
}

/// Runs `data`'s tool-calling loop to completion. Persists the conversation
/// after every LLM call, and reports the cost accumulated across every
/// successful call in this invocation to the ticket exactly once, right
/// before returning.
pub async fn run(ctx: &ToolContext, data: &mut ConversationData, config: &DriverConfig) -> Terminal {
    let mut counts: HashMap<u32, u32> = HashMap::new();
    let mut iterations: u32 = 0;
    let mut accumulated_cost: f64 = 0.0;

    let terminal = loop {
        if ctx.cancel.is_cancelled() || ctx.tool_cancel.is_cancelled() {
            break Terminal::Interrupted;
        }
        if iterations >= config.max_iterations {
            break Terminal::MaxIterationsReached {
                recent_turns: recent_turns_snippet(&data.messages, 3),
            };
        }

        if let Ok(ticket) = ctx.ticket_store.get(&ctx.ticket_id).await {
            if matches!(ticket.remaining_budget(), Some(remaining) if remaining <= 0.0) {
                break Terminal::CostExceeded;
            }
        }

        if let Some(new_provider_id) = ctx.model_switch.take_pending(&ctx.ticket_id) {
            if let Some(new_llm) = ctx.registry.get(&new_provider_id) {
                data.messages
                    .push(Message::system(format!("Model switched to {}", new_llm.model)));
                if flush(ctx, data).await.is_err() {
                    break Terminal::LlmCallFailed("failed to persist conversation".to_string());
                }
                break Terminal::ModelChanged { new_provider_id };
            }
        }

        let req = ChatRequest {
            messages: data.messages.clone(),
            tools: domain_tool_defs(ctx.toolset_role),
            temperature: None,
            max_tokens: None,
            json_mode: false,
            model: None,
            ..Default::default()
        };

        let outcome = ctx.llm.call(req).await;
        iterations += 1;

        let response = match outcome {
            LlmCallOutcome::Success(resp) => resp,
            LlmCallOutcome::RateLimited { retry_after_secs } => {
                if retry_after_secs <= config.availability_wait_secs {
                    tokio::time::sleep(std::time::Duration::from_secs(retry_after_secs)).await;
                    continue;
                }
                break Terminal::RateLimited { retry_after: retry_after_secs };
            }
            LlmCallOutcome::Failed { message } => break Terminal::LlmCallFailed(message),
            LlmCallOutcome::PermanentlyDown => {
                break Terminal::LlmCallFailed(format!("{} is permanently unavailable", ctx.llm.id))
            }
        };

        if let Some(usage) = &response.usage {
            accumulated_cost += usage
                .cost
                .unwrap_or_else(|| ctx.llm.estimate_cost(usage.prompt_tokens, usage.completion_tokens));
        }

        let fp = fingerprint(&response.content, &response.tool_calls);
        let count = {
            let entry = counts.entry(fp).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= 5 {
            break Terminal::RepetitionDetected {
                recent_turns: recent_turns_snippet(&data.messages, 3),
            };
        }
        let warn_repetition = count >= 3;

        data.messages
            .push(assistant_message_with_calls(&response.content, &response.tool_calls));

        if response.tool_calls.is_empty() {
            if flush(ctx, data).await.is_err() {
                break Terminal::LlmCallFailed("failed to persist conversation".to_string());
            }
            break Terminal::Completed(response.content);
        }

        let mut tool_futures = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            let call = call.clone();
            let ctx_ref = ctx;
            tool_futures.push(async move {
                let call_id = call.call_id.clone();
                tools::ACTIVE_TOOL_CALL_ID
                    .scope(call_id, tools::dispatch_tool(ctx_ref, &call.tool_name, &call.arguments))
                    .await
            });
        }
        let results = futures_util::future::join_all(tool_futures).await;

        let mut exits = Vec::new();
        for (call, result) in response.tool_calls.iter().zip(results.into_iter()) {
            let mut text = truncate_response(&result.response);
            if warn_repetition {
                text = format!("{text}\n\n[warning: this exact tool call has repeated {count} times]");
            }
            data.messages.push(Message::tool_result(call.call_id.clone(), text.clone()));
            if result.exit_loop {
                exits.push(ExitCall {
                    tool_name: call.tool_name.clone(),
                    response: text,
                });
            }
        }

        if flush(ctx, data).await.is_err() {
            break Terminal::LlmCallFailed("failed to persist conversation".to_string());
        }

        if !exits.is_empty() {
            break Terminal::ToolRequestedExit { exits };
        }
    };

    if accumulated_cost > 0.0 {
        let _ = ctx.ticket_store.add_llm_cost(&ctx.ticket_id, accumulated_cost).await;
    }
    terminal
}

async fn flush(ctx: &ToolContext, data: &ConversationData) -> Result<(), ()> {
    ctx.conversation_store
        .upsert(&ctx.ticket_id, data)
        .await
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::tool::ToolCall;

    #[test]
    fn fingerprint_ignores_call_id_but_not_name_or_args() {
        let a = vec![ToolCall { call_id: "1".into(), tool_name: "shell".into(), arguments: serde_json::json!({"command": "ls"}) }];
        let b = vec![ToolCall { call_id: "2".into(), tool_name: "shell".into(), arguments: serde_json::json!({"command": "ls"}) }];
        assert_eq!(fingerprint("doing it", &a), fingerprint("doing it", &b));

        let c = vec![ToolCall { call_id: "3".into(), tool_name: "shell".into(), arguments: serde_json::json!({"command": "pwd"}) }];
        assert_ne!(fingerprint("doing it", &a), fingerprint("doing it", &c));
    }

    #[test]
    fn recent_turns_snippet_pairs_assistant_with_following_tool_result() {
        let messages = vec![
            Message::user("go"),
            Message::assistant("calling shell"),
            Message::tool_result("1", "ls output"),
        ];
        let snippet = recent_turns_snippet(&messages, 3);
        assert_eq!(snippet.len(), 1);
        assert!(snippet[0].contains("calling shell"));
        assert!(snippet[0].contains("ls output"));
    }

    #[test]
    fn clip_truncates_long_strings() {
        let s = "x".repeat(600);
        let clipped = clip(&s, 500);
        assert!(clipped.len() < s.len());
        assert!(clipped.ends_with("..."));
    }
}
