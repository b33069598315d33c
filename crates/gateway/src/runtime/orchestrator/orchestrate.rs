//! Orchestrator (C7) — the ticket-activation sequence: clone the repo,
//! drive a Planner conversation, hand off to Developer conversations for
//! each subtask, and fan out Developer-spawned sub-agents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sa_domain::conversation::{ConversationData, ConversationRole, ConversationStrategy};
use sa_domain::error::Result;
use sa_domain::ticket::TicketStatus;
use tokio::process::Command;

use super::context::{ToolContext, ToolsetRole};
use super::conversation_store::ConversationStore;
use super::driver::{self, DriverConfig, Terminal};
use super::model_switch::ModelSwitchQueue;
use super::tickets::TicketStore;

/// Clones `repo_url` into `workspace_dir` and checks out `branch_name`,
/// creating it from the default branch if it doesn't exist upstream.
pub async fn prepare_workspace(workspace_dir: &Path, repo_url: &str, branch_name: &str) -> Result<()> {
    if !workspace_dir.exists() {
        let status = Command::new("git")
            .args(["clone", repo_url, &workspace_dir.to_string_lossy()])
            .status()
            .await?;
        if !status.success() {
            return Err(sa_domain::error::Error::Other(format!("git clone failed for {repo_url}")));
        }
    }
    let status = Command::new("git")
        .current_dir(workspace_dir)
        .args(["checkout", "-B", branch_name])
        .status()
        .await?;
    if !status.success() {
        return Err(sa_domain::error::Error::Other(format!("git checkout -B {branch_name} failed")));
    }
    Ok(())
}

fn planning_role(status: TicketStatus) -> ToolsetRole {
    if status == TicketStatus::Backlog {
        ToolsetRole::PlanningBacklog
    } else {
        ToolsetRole::PlanningActive
    }
}

/// Shared pieces every conversation on this ticket needs; cloned per
/// conversation into a fresh [`ToolContext`].
pub struct TicketServices {
    pub ticket_store: Arc<TicketStore>,
    pub conversation_store: Arc<ConversationStore>,
    pub registry: Arc<sa_providers::ProviderRegistry>,
    pub processes: Arc<sa_tools::ProcessManager>,
    pub model_switch: Arc<ModelSwitchQueue>,
    pub cancel: crate::runtime::cancel::CancelToken,
}

fn make_context(
    services: &TicketServices,
    role: ToolsetRole,
    llm: Arc<sa_providers::LlmService>,
    ticket_id: &str,
    workspace_dir: PathBuf,
    memories: sa_domain::conversation::MemoriesMap,
    task_id: Option<String>,
    subtask_id: Option<String>,
    sub_agent_depth: usize,
) -> ToolContext {
    ToolContext {
        toolset_role: role,
        llm,
        registry: services.registry.clone(),
        memories,
        ticket_store: services.ticket_store.clone(),
        conversation_store: services.conversation_store.clone(),
        model_switch: services.model_switch.clone(),
        processes: services.processes.clone(),
        workspace_dir,
        ticket_id: ticket_id.to_string(),
        task_id,
        subtask_id,
        cancel: services.cancel.clone(),
        tool_cancel: crate::runtime::cancel::CancelToken::new(),
        sub_agent_depth,
    }
}

/// Drives the Planner conversation until it calls `complete_ticket`
/// (modeled here as `ticket_log` plus the ticket reaching Done — the
/// planner's own tool surface gates task creation vs. `start_developer` by
/// ticket status) or a fatal reason is reached.
pub async fn run_planner(
    services: &TicketServices,
    llm: Arc<sa_providers::LlmService>,
    workspace_dir: PathBuf,
    ticket_id: &str,
    driver_config: &DriverConfig,
) -> Result<Terminal> {
    let memories = sa_domain::conversation::MemoriesMap::new();
    let mut llm = llm;
    loop {
        let ticket = services.ticket_store.get(ticket_id).await?;
        let role = planning_role(ticket.status);

        let mut convo = match services.conversation_store.get_active_planning(ticket_id).await? {
            Some(existing) => existing,
            None => {
                let mut fresh = ConversationData::new(
                    ticket_id.to_string(),
                    "Planning".to_string(),
                    ConversationRole::Planning,
                    ConversationStrategy::Compacting,
                    llm.model.clone(),
                );
                super::compacting::refresh_fixed_prefix(&mut fresh, planning_system_prompt(), &ticket.description);
                fresh
            }
        };

        let ctx = make_context(services, role, llm.clone(), ticket_id, workspace_dir.clone(), memories.clone(), None, None, 0);
        let terminal = driver::run(&ctx, &mut convo, driver_config).await;
        services.conversation_store.upsert(ticket_id, &convo).await?;

        match terminal {
            Terminal::ModelChanged { new_provider_id } => {
                if let Some(new_llm) = services.registry.get(&new_provider_id) {
                    llm = new_llm;
                }
                continue;
            }
            Terminal::ToolRequestedExit { exits } => {
                let start_developer_args: Vec<serde_json::Value> = exits
                    .iter()
                    .filter(|e| e.tool_name == "start_developer")
                    .map(|e| serde_json::from_str(&e.response).unwrap_or(serde_json::Value::Null))
                    .collect();
                if !start_developer_args.is_empty() {
                    for args in &start_developer_args {
                        run_developer_until_done(services, llm.clone(), workspace_dir.clone(), ticket_id, args, driver_config, memories.clone())
                            .await?;
                    }
                    continue;
                }
                services.conversation_store.finish(ticket_id, &convo.id).await?;
                let any_end_subtask = exits.iter().any(|e| e.tool_name == "ticket_end_subtask");
                if any_end_subtask || ticket.status == TicketStatus::Active {
                    continue;
                }
                return Ok(Terminal::ToolRequestedExit { exits });
            }
            other => return Ok(other),
        }
    }
}

/// Runs Developer conversations for a task/subtask until `end_subtask`
/// succeeds, with a bounded number of "context reset" retries when the
/// Developer completes or exhausts its iterations without finishing.
async fn run_developer_until_done(
    services: &TicketServices,
    developer_llm: Arc<sa_providers::LlmService>,
    workspace_dir: PathBuf,
    ticket_id: &str,
    start_args: &serde_json::Value,
    driver_config: &DriverConfig,
    memories: sa_domain::conversation::MemoriesMap,
) -> Result<()> {
    const MAX_CONTEXT_RESETS: u32 = 2;

    let task_id = start_args.get("task_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let subtask_id = start_args.get("subtask_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let mut convo = match find_developer_conversation(services, ticket_id, &subtask_id).await? {
        Some(existing) => existing,
        None => {
            let mut fresh = ConversationData::new(
                ticket_id.to_string(),
                format!("Developer:{subtask_id}"),
                ConversationRole::Developer,
                ConversationStrategy::Compacting,
                developer_llm.model.clone(),
            );
            super::compacting::refresh_fixed_prefix(
                &mut fresh,
                developer_system_prompt(),
                &format!("Work on subtask {subtask_id} of task {task_id}."),
            );
            fresh
        }
    };

    let mut developer_llm = developer_llm;
    let mut resets = 0;
    loop {
        let ctx = make_context(
            services,
            ToolsetRole::Developer,
            developer_llm.clone(),
            ticket_id,
            workspace_dir.clone(),
            memories.clone(),
            Some(task_id.clone()),
            Some(subtask_id.clone()),
            0,
        );
        let terminal = driver::run(&ctx, &mut convo, driver_config).await;
        services.conversation_store.upsert(ticket_id, &convo).await?;

        match terminal {
            Terminal::ModelChanged { new_provider_id } => {
                if let Some(new_llm) = services.registry.get(&new_provider_id) {
                    developer_llm = new_llm;
                }
                continue;
            }
            Terminal::ToolRequestedExit { exits } if exits.iter().any(|e| e.tool_name == "ticket_end_subtask") => {
                services.conversation_store.finish(ticket_id, &convo.id).await?;
                return Ok(());
            }
            Terminal::ToolRequestedExit { exits } if exits.iter().any(|e| e.tool_name == "start_sub_agent") => {
                let mut to_run = Vec::new();
                for exit in exits.iter().filter(|e| e.tool_name == "start_sub_agent") {
                    let args: serde_json::Value = serde_json::from_str(&exit.response).unwrap_or(serde_json::Value::Null);
                    let task = args.get("task").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let llm_config_id = args.get("llm_config_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let sub_llm = services
                        .registry
                        .get(&llm_config_id)
                        .unwrap_or_else(|| developer_llm.clone());
                    to_run.push((sub_llm, task));
                }
                let futures = to_run.iter().map(|(sub_llm, task)| {
                    run_sub_agent(
                        services,
                        sub_llm.clone(),
                        workspace_dir.clone(),
                        ticket_id,
                        task,
                        memories.clone(),
                        driver_config,
                        1,
                    )
                });
                let results = futures_util::future::join_all(futures).await;
                for result in results {
                    let terminal = result?;
                    let summary = match terminal {
                        Terminal::ToolRequestedExit { exits } => {
                            exits.into_iter().map(|e| e.response).collect::<Vec<_>>().join("; ")
                        }
                        Terminal::Completed(text) => text,
                        other => format!("sub-agent ended without completing: {other:?}"),
                    };
                    convo.messages.push(sa_domain::tool::Message::user(format!(
                        "Sub-agent finished: {summary}"
                    )));
                }
                continue;
            }
            Terminal::Completed(_) | Terminal::MaxIterationsReached { .. } if resets < MAX_CONTEXT_RESETS => {
                resets += 1;
                services.conversation_store.finish(ticket_id, &convo.id).await?;
                let mut next = ConversationData::new(
                    ticket_id.to_string(),
                    format!("Developer:{subtask_id}"),
                    ConversationRole::Developer,
                    ConversationStrategy::Compacting,
                    developer_llm.model.clone(),
                );
                super::compacting::refresh_fixed_prefix(
                    &mut next,
                    developer_system_prompt(),
                    &format!(
                        "You were working on subtask {subtask_id}. Decide whether to continue or take a fresh approach."
                    ),
                );
                convo = next;
                continue;
            }
            _ => {
                services.conversation_store.finish(ticket_id, &convo.id).await?;
                return Ok(());
            }
        }
    }
}

async fn find_developer_conversation(
    services: &TicketServices,
    ticket_id: &str,
    subtask_id: &str,
) -> Result<Option<ConversationData>> {
    let non_finalized = services.conversation_store.get_non_finalized(ticket_id).await?;
    Ok(non_finalized
        .into_iter()
        .find(|c| c.display_name == format!("Developer:{subtask_id}")))
}

/// Runs a sub-agent conversation sharing the parent's memories map, nudging
/// it to wrap up via `agent_task_complete` when it exhausts its iterations,
/// bounded by the ticket's remaining budget.
pub async fn run_sub_agent(
    services: &TicketServices,
    llm: Arc<sa_providers::LlmService>,
    workspace_dir: PathBuf,
    ticket_id: &str,
    task: &str,
    parent_memories: sa_domain::conversation::MemoriesMap,
    driver_config: &DriverConfig,
    sub_agent_depth: usize,
) -> Result<Terminal> {
    let mut convo = ConversationData::new(
        ticket_id.to_string(),
        format!("SubAgent:{}", uuid::Uuid::new_v4()),
        ConversationRole::SubAgent,
        ConversationStrategy::Compacting,
        llm.model.clone(),
    );
    super::compacting::refresh_fixed_prefix(&mut convo, sub_agent_system_prompt(), task);

    let mut llm = llm;
    loop {
        let ticket = services.ticket_store.get(ticket_id).await?;
        if matches!(ticket.remaining_budget(), Some(remaining) if remaining <= 0.0) {
            return Ok(Terminal::CostExceeded);
        }

        let ctx = make_context(
            services,
            ToolsetRole::SubAgent,
            llm.clone(),
            ticket_id,
            workspace_dir.clone(),
            parent_memories.clone(),
            None,
            None,
            sub_agent_depth,
        );
        let terminal = driver::run(&ctx, &mut convo, driver_config).await;
        services.conversation_store.upsert(ticket_id, &convo).await?;

        match terminal {
            Terminal::ModelChanged { new_provider_id } => {
                if let Some(new_llm) = services.registry.get(&new_provider_id) {
                    llm = new_llm;
                }
                continue;
            }
            Terminal::MaxIterationsReached { .. } => {
                convo.messages.push(sa_domain::tool::Message::user(
                    "Continue working. Call agent_task_complete when done.",
                ));
                continue;
            }
            other => {
                services.conversation_store.finish(ticket_id, &convo.id).await?;
                return Ok(other);
            }
        }
    }
}

fn planning_system_prompt() -> &'static str {
    "You are the planner for this ticket. Break the work into tasks and subtasks, \
     then hand off to a developer once the ticket is active."
}

fn developer_system_prompt() -> &'static str {
    "You are the developer working this ticket's active subtask. Use the available \
     tools to make the change, then call ticket_end_subtask when finished."
}

fn sub_agent_system_prompt() -> &'static str {
    "You are a sub-agent helping the developer with a narrow, delegated task. \
     Call agent_task_complete with a summary when you're done."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_role_depends_on_ticket_status() {
        assert_eq!(planning_role(TicketStatus::Backlog), ToolsetRole::PlanningBacklog);
        assert_eq!(planning_role(TicketStatus::Active), ToolsetRole::PlanningActive);
    }
}
