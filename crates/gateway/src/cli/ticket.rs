//! `serialagent ticket` — drive a ticket's Planner/Developer/Sub-agent
//! orchestration from the command line, the same entry point the server
//! would use for an activated ticket.

use std::path::PathBuf;
use std::sync::Arc;

use sa_domain::config::Config;

use crate::bootstrap;
use crate::runtime::orchestrator::driver::DriverConfig;
use crate::runtime::orchestrator::orchestrate::{self, TicketServices};

/// `serialagent ticket create` — file a new ticket in Backlog.
pub async fn create(config: Arc<Config>, title: String, description: String, branch_name: String, planner_llm: String) -> anyhow::Result<()> {
    let shutdown_tx = Arc::new(tokio::sync::Notify::new());
    let config_path = std::env::var("SA_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let state = bootstrap::build_app_state(config, config_path, shutdown_tx).await?;

    let ticket = state.ticket_store.create(title, description, branch_name).await?;
    let ticket = state.ticket_store.set_planner_llm(&ticket.id, planner_llm).await?;
    println!("created ticket {} ({})", ticket.id, ticket.title);
    Ok(())
}

/// `serialagent ticket run <id>` — clone the ticket's branch and drive its
/// Planner conversation (which hands off to Developer/Sub-agent
/// conversations on its own) to a terminal outcome.
pub async fn run(config: Arc<Config>, ticket_id: String, repo_url: String, workspace_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let shutdown_tx = Arc::new(tokio::sync::Notify::new());
    let config_path = std::env::var("SA_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let state = bootstrap::build_app_state(config, config_path, shutdown_tx).await?;

    let ticket = state.ticket_store.get(&ticket_id).await?;
    let llm = state
        .llm
        .get(&ticket.planner_llm_id)
        .ok_or_else(|| anyhow::anyhow!("ticket {ticket_id} has no usable planner LLM ('{}')", ticket.planner_llm_id))?;

    let workspace_dir = workspace_dir.unwrap_or_else(|| {
        state
            .config
            .workspace
            .state_path
            .join("tickets-workspace")
            .join(&ticket_id)
    });
    orchestrate::prepare_workspace(&workspace_dir, &repo_url, &ticket.branch_name).await?;

    let services = TicketServices {
        ticket_store: state.ticket_store.clone(),
        conversation_store: state.conversation_store.clone(),
        registry: state.llm.clone(),
        processes: state.processes.clone(),
        model_switch: state.model_switch.clone(),
        cancel: crate::runtime::cancel::CancelToken::new(),
    };

    let terminal = orchestrate::run_planner(&services, llm, workspace_dir, &ticket_id, &DriverConfig::default()).await?;
    println!("ticket {ticket_id} ended: {terminal:?}");
    Ok(())
}
