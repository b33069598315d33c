//! Tool Registry & Dispatch (C3).
//!
//! A tool is a JSON-schema definition paired with an async handler. Schemas
//! are hand-built (matching [`crate::runtime::tools::build_tool_definitions`]'s
//! style) rather than derived via a macro — `ToolContext` is injected and
//! never appears in the schema.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::task_local;

use sa_domain::conversation::MemoryLabel;
use sa_domain::ticket::SubtaskStatus;
use sa_tools::exec::{exec, ExecRequest};
use sa_tools::file_ops::{
    self, FileAppendRequest, FileDeleteRequest, FileListRequest, FileMoveRequest, FileReadRequest,
    FileWriteRequest,
};
use sa_tools::process::{handle_process, ProcessRequest};

use super::context::{ToolContext, ToolResult, ToolsetRole};

task_local! {
    /// The tool-call id of the call currently executing on this task, so a
    /// concurrently-dispatched sibling call never observes another call's id.
    /// Used by tools that reconstitute a nested conversation after a crash.
    pub static ACTIVE_TOOL_CALL_ID: String;
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

fn def(name: &str, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

/// All tool classes this build knows about, independent of role. Filtering
/// by [`ToolsetRole`] happens in [`tool_definitions_for`] / [`is_allowed`].
fn all_definitions() -> Vec<ToolDefinition> {
    vec![
        def(
            "shell",
            "Run a shell command. Background long-running commands with background=true, then poll with the process tool.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command to run via `sh -c`"},
                    "background": {"type": "boolean", "description": "Run detached and return a session id immediately"},
                    "workdir": {"type": "string", "description": "Working directory, relative to the workspace"},
                },
                "required": ["command"],
            }),
        ),
        def(
            "process",
            "Inspect or control a background shell session started by the shell tool.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "description": "list|poll|log|write|kill|clear|remove"},
                    "session_id": {"type": "string"},
                    "data": {"type": "string", "description": "stdin data for the write action"},
                },
                "required": ["action"],
            }),
        ),
        def(
            "file_read",
            "Read a file within the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer", "description": "0-indexed starting line"},
                    "limit": {"type": "integer", "description": "max lines to return"},
                },
                "required": ["path"],
            }),
        ),
        def(
            "file_write",
            "Create or overwrite a file within the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
            }),
        ),
        def(
            "file_edit",
            "Replace the first occurrence of a string in a file. Fails if the string isn't found or isn't unique and replace_all is false.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"},
                    "replace_all": {"type": "boolean"},
                },
                "required": ["path", "old_string", "new_string"],
            }),
        ),
        def(
            "file_multi_edit",
            "Apply a sequence of file_edit-style replacements to one file atomically.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "edits": {
                        "type": "array",
                        "description": "array of {old_string, new_string, replace_all}",
                    },
                },
                "required": ["path", "edits"],
            }),
        ),
        def(
            "file_list",
            "List a directory within the workspace.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
            }),
        ),
        def(
            "search_glob",
            "Find files within the workspace matching a glob pattern.",
            json!({
                "type": "object",
                "properties": {"pattern": {"type": "string"}},
                "required": ["pattern"],
            }),
        ),
        def(
            "search_grep",
            "Search file contents within the workspace for a regular expression.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "restrict the search to this subdirectory"},
                },
                "required": ["pattern"],
            }),
        ),
        def(
            "web_fetch",
            "Fetch a URL and return its text content.",
            json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"],
            }),
        ),
        def(
            "ticket_log",
            "Append an entry to the ticket's activity log.",
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"],
            }),
        ),
        def(
            "ticket_add_task",
            "Create or update a task on the ticket.",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string"}, "description": {"type": "string"}},
                "required": ["name", "description"],
            }),
        ),
        def(
            "ticket_add_subtask",
            "Create or update a subtask under a task.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                },
                "required": ["task_id", "name", "description"],
            }),
        ),
        def(
            "ticket_get_next_work_item",
            "Return the next incomplete subtask, or null if none remain.",
            json!({"type": "object", "properties": {}}),
        ),
        def(
            "ticket_update_llm_notes",
            "Record free-form strengths/weaknesses notes about an LLM service's observed performance.",
            json!({
                "type": "object",
                "properties": {
                    "provider_id": {"type": "string"},
                    "strengths": {"type": "string"},
                    "weaknesses": {"type": "string"},
                },
                "required": ["provider_id"],
            }),
        ),
        def(
            "ticket_end_subtask",
            "Mark the current subtask finished and exit the Developer loop.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "subtask_id": {"type": "string"},
                    "status": {"type": "string", "description": "complete|rejected|awaiting_review"},
                },
                "required": ["task_id", "subtask_id", "status"],
            }),
        ),
        def(
            "start_developer",
            "Start a Developer conversation for a task/subtask.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "subtask_id": {"type": "string"},
                    "llm_config_id": {"type": "string"},
                    "sub_agent_llm_config_id": {"type": "string"},
                },
                "required": ["task_id", "subtask_id", "llm_config_id"],
            }),
        ),
        def(
            "start_sub_agent",
            "Spawn a sub-agent conversation sharing this conversation's memories.",
            json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string"},
                    "llm_config_id": {"type": "string"},
                },
                "required": ["task", "llm_config_id"],
            }),
        ),
        def(
            "agent_task_complete",
            "Signal that the sub-agent has finished its assigned task.",
            json!({
                "type": "object",
                "properties": {"summary": {"type": "string"}},
                "required": ["summary"],
            }),
        ),
        def(
            "add_memory",
            "Record a durable note under a label (invariant, constraint, decision, reference, or open_item).",
            json!({
                "type": "object",
                "properties": {"label": {"type": "string"}, "text": {"type": "string"}},
                "required": ["label", "text"],
            }),
        ),
        def(
            "remove_memory",
            "Remove a previously recorded note (prefix-tolerant match).",
            json!({
                "type": "object",
                "properties": {"label": {"type": "string"}, "text": {"type": "string"}},
                "required": ["label", "text"],
            }),
        ),
        def(
            "summarize_history",
            "Replace the compressible tail of the conversation with a chapter summary.",
            json!({
                "type": "object",
                "properties": {"summary": {"type": "string"}},
                "required": ["summary"],
            }),
        ),
    ]
}

/// Whether `tool_name` is visible to `role`. Keeps Planning's task-creation
/// tools out of a Developer's hands and vice versa for the exit-only
/// signal tools below.
pub fn is_allowed(role: ToolsetRole, tool_name: &str) -> bool {
    use ToolsetRole::*;
    match tool_name {
        "shell" | "process" | "file_edit" | "file_multi_edit" => {
            matches!(role, Developer | SubAgent)
        }
        "file_write" => matches!(role, Developer | SubAgent),
        "file_read" | "file_list" | "search_glob" | "search_grep" | "web_fetch" | "ticket_log" => {
            matches!(role, PlanningBacklog | PlanningActive | Developer | SubAgent)
        }
        "ticket_add_task" | "ticket_add_subtask" => matches!(role, PlanningBacklog),
        "ticket_get_next_work_item" | "ticket_update_llm_notes" => matches!(role, PlanningActive),
        "ticket_end_subtask" => matches!(role, Developer),
        "start_developer" => matches!(role, PlanningActive),
        "start_sub_agent" => matches!(role, Developer),
        "agent_task_complete" => matches!(role, SubAgent),
        "add_memory" | "remove_memory" => matches!(
            role,
            PlanningBacklog | PlanningActive | Developer | SubAgent | Compaction
        ),
        "summarize_history" => matches!(role, Compaction),
        _ => false,
    }
}

pub fn tool_definitions_for(role: ToolsetRole) -> Vec<ToolDefinition> {
    all_definitions()
        .into_iter()
        .filter(|d| is_allowed(role, &d.name))
        .collect()
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn require_str(args: &Value, key: &str) -> std::result::Result<String, ToolResult> {
    arg_str(args, key)
        .map(str::to_string)
        .ok_or_else(|| ToolResult::error(format!("missing required argument '{key}'")))
}

fn parse_memory_label(raw: &str) -> Option<MemoryLabel> {
    match raw.to_ascii_lowercase().as_str() {
        "invariant" => Some(MemoryLabel::Invariant),
        "constraint" => Some(MemoryLabel::Constraint),
        "decision" => Some(MemoryLabel::Decision),
        "reference" => Some(MemoryLabel::Reference),
        "open_item" | "openitem" => Some(MemoryLabel::OpenItem),
        _ => None,
    }
}

fn parse_subtask_status(raw: &str) -> Option<SubtaskStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "complete" => Some(SubtaskStatus::Complete),
        "rejected" => Some(SubtaskStatus::Rejected),
        "awaiting_review" | "awaitingreview" => Some(SubtaskStatus::AwaitingReview),
        "in_progress" | "inprogress" => Some(SubtaskStatus::InProgress),
        _ => None,
    }
}

/// Dispatch one tool call. The caller is expected to have already checked
/// [`is_allowed`] and truncated the response via
/// [`super::context::truncate_response`].
pub async fn dispatch_tool(ctx: &ToolContext, name: &str, args: &Value) -> ToolResult {
    if !is_allowed(ctx.toolset_role, name) {
        return ToolResult::error(format!("tool '{name}' is not available in this context"));
    }

    match name {
        "shell" => dispatch_shell(ctx, args).await,
        "process" => dispatch_process(ctx, args).await,
        "file_read" => dispatch_file_read(ctx, args).await,
        "file_write" => dispatch_file_write(ctx, args).await,
        "file_edit" => dispatch_file_edit(ctx, args).await,
        "file_multi_edit" => dispatch_file_multi_edit(ctx, args).await,
        "file_list" => dispatch_file_list(ctx, args).await,
        "search_glob" => dispatch_search_glob(ctx, args),
        "search_grep" => dispatch_search_grep(ctx, args),
        "web_fetch" => dispatch_web_fetch(args).await,
        "ticket_log" => dispatch_ticket_log(ctx, args).await,
        "ticket_add_task" => dispatch_ticket_add_task(ctx, args).await,
        "ticket_add_subtask" => dispatch_ticket_add_subtask(ctx, args).await,
        "ticket_get_next_work_item" => dispatch_get_next_work_item(ctx).await,
        "ticket_update_llm_notes" => dispatch_update_llm_notes(ctx, args).await,
        "ticket_end_subtask" => dispatch_end_subtask(ctx, args).await,
        "start_developer" => dispatch_start_developer(args),
        "start_sub_agent" => dispatch_start_sub_agent(args),
        "agent_task_complete" => dispatch_agent_task_complete(args),
        "add_memory" => dispatch_add_memory(ctx, args),
        "remove_memory" => dispatch_remove_memory(ctx, args),
        "summarize_history" => dispatch_summarize_history(args),
        other => ToolResult::error(format!("unknown tool '{other}'")),
    }
}

async fn dispatch_shell(ctx: &ToolContext, args: &Value) -> ToolResult {
    let command = match require_str(args, "command") {
        Ok(c) => c,
        Err(r) => return r,
    };
    let req = ExecRequest {
        command,
        background: args.get("background").and_then(Value::as_bool).unwrap_or(false),
        yield_ms: None,
        timeout_sec: None,
        workdir: arg_str(args, "workdir").map(str::to_string),
        env: None,
    };
    let resp = exec(&ctx.processes, req).await;
    ToolResult::ok(serde_json::to_string_pretty(&resp).unwrap_or_default())
}

async fn dispatch_process(ctx: &ToolContext, args: &Value) -> ToolResult {
    let action = match require_str(args, "action") {
        Ok(a) => a,
        Err(r) => return r,
    };
    let req: ProcessRequest = match serde_json::from_value(json!({
        "action": action.to_ascii_lowercase(),
        "session_id": args.get("session_id"),
        "data": args.get("data"),
    })) {
        Ok(r) => r,
        Err(e) => return ToolResult::error(format!("invalid process arguments: {e}")),
    };
    let resp = handle_process(&ctx.processes, req).await;
    ToolResult::ok(serde_json::to_string_pretty(&resp).unwrap_or_default())
}

async fn dispatch_file_read(ctx: &ToolContext, args: &Value) -> ToolResult {
    let path = match require_str(args, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let req = FileReadRequest {
        path,
        offset: args.get("offset").and_then(Value::as_u64).map(|v| v as usize),
        limit: args.get("limit").and_then(Value::as_u64).map(|v| v as usize),
    };
    match file_ops::file_read(&ctx.workspace_dir, req).await {
        Ok(v) => ToolResult::ok(v.to_string()),
        Err(e) => ToolResult::error(e),
    }
}

async fn dispatch_file_write(ctx: &ToolContext, args: &Value) -> ToolResult {
    let path = match require_str(args, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let content = match require_str(args, "content") {
        Ok(c) => c,
        Err(r) => return r,
    };
    match file_ops::file_write(&ctx.workspace_dir, FileWriteRequest { path, content }).await {
        Ok(v) => ToolResult::ok(v.to_string()),
        Err(e) => ToolResult::error(e),
    }
}

/// `edit`/`multi-edit` have no counterpart in the file_ops module; they're
/// composed here from `file_read` + `file_write`, matching the read-modify-
/// write shape of the rest of that module's atomic writes.
async fn apply_one_edit(ctx: &ToolContext, path: &str, old: &str, new: &str, replace_all: bool) -> std::result::Result<(), String> {
    let read = file_ops::file_read(
        &ctx.workspace_dir,
        FileReadRequest { path: path.to_string(), offset: None, limit: None },
    )
    .await?;
    let content = read["content"].as_str().unwrap_or_default();

    let occurrences = content.matches(old).count();
    if occurrences == 0 {
        return Err(format!("'{old}' not found in {path}"));
    }
    if occurrences > 1 && !replace_all {
        return Err(format!(
            "'{old}' is not unique in {path} ({occurrences} occurrences); pass replace_all or widen the match"
        ));
    }
    let updated = if replace_all {
        content.replace(old, new)
    } else {
        content.replacen(old, new, 1)
    };
    file_ops::file_write(
        &ctx.workspace_dir,
        FileWriteRequest { path: path.to_string(), content: updated },
    )
    .await?;
    Ok(())
}

async fn dispatch_file_edit(ctx: &ToolContext, args: &Value) -> ToolResult {
    let path = match require_str(args, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let old_string = match require_str(args, "old_string") {
        Ok(s) => s,
        Err(r) => return r,
    };
    let new_string = match require_str(args, "new_string") {
        Ok(s) => s,
        Err(r) => return r,
    };
    let replace_all = args.get("replace_all").and_then(Value::as_bool).unwrap_or(false);
    match apply_one_edit(ctx, &path, &old_string, &new_string, replace_all).await {
        Ok(()) => ToolResult::ok(format!("edited {path}")),
        Err(e) => ToolResult::error(e),
    }
}

async fn dispatch_file_multi_edit(ctx: &ToolContext, args: &Value) -> ToolResult {
    let path = match require_str(args, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let edits = match args.get("edits").and_then(Value::as_array) {
        Some(e) => e,
        None => return ToolResult::error("missing required argument 'edits'"),
    };
    for (i, edit) in edits.iter().enumerate() {
        let old = edit.get("old_string").and_then(Value::as_str).unwrap_or_default();
        let new = edit.get("new_string").and_then(Value::as_str).unwrap_or_default();
        let replace_all = edit.get("replace_all").and_then(Value::as_bool).unwrap_or(false);
        if let Err(e) = apply_one_edit(ctx, &path, old, new, replace_all).await {
            return ToolResult::error(format!("edit {i} failed: {e}"));
        }
    }
    ToolResult::ok(format!("applied {} edits to {path}", edits.len()))
}

async fn dispatch_file_list(ctx: &ToolContext, args: &Value) -> ToolResult {
    let path = arg_str(args, "path").unwrap_or(".").to_string();
    match file_ops::file_list(&ctx.workspace_dir, FileListRequest { path }).await {
        Ok(v) => ToolResult::ok(v.to_string()),
        Err(e) => ToolResult::error(e),
    }
}

fn dispatch_search_glob(ctx: &ToolContext, args: &Value) -> ToolResult {
    let pattern = match require_str(args, "pattern") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let full_pattern = ctx.workspace_dir.join(&pattern);
    let full_pattern = full_pattern.to_string_lossy().to_string();
    let paths: Vec<String> = match glob::glob(&full_pattern) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|p| {
                p.strip_prefix(&ctx.workspace_dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().to_string())
            })
            .collect(),
        Err(e) => return ToolResult::error(format!("invalid glob pattern: {e}")),
    };
    ToolResult::ok(serde_json::to_string_pretty(&paths).unwrap_or_default())
}

fn dispatch_search_grep(ctx: &ToolContext, args: &Value) -> ToolResult {
    let pattern = match require_str(args, "pattern") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let re = match regex::Regex::new(&pattern) {
        Ok(r) => r,
        Err(e) => return ToolResult::error(format!("invalid regex: {e}")),
    };
    let subdir = arg_str(args, "path").unwrap_or(".");
    let root = ctx.workspace_dir.join(subdir);

    let mut matches = Vec::new();
    for entry in walk_files(&root) {
        let Ok(content) = std::fs::read_to_string(&entry) else {
            continue;
        };
        for (lineno, line) in content.lines().enumerate() {
            if re.is_match(line) {
                let rel = entry
                    .strip_prefix(&ctx.workspace_dir)
                    .unwrap_or(&entry)
                    .to_string_lossy()
                    .to_string();
                matches.push(format!("{rel}:{}: {line}", lineno + 1));
                if matches.len() >= 500 {
                    return ToolResult::ok(matches.join("\n"));
                }
            }
        }
    }
    ToolResult::ok(matches.join("\n"))
}

/// Plain recursive walk, skipping `.git` and other dot-directories — there is
/// no `walkdir`/`ignore` dependency in this workspace, so this stays
/// deliberately simple rather than reaching for one.
fn walk_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_dot = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if is_dot {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

async fn dispatch_web_fetch(args: &Value) -> ToolResult {
    let url = match require_str(args, "url") {
        Ok(u) => u,
        Err(r) => return r,
    };
    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .user_agent("kanbeast-agent/1.0")
        .build()
    {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("failed to build http client: {e}")),
    };
    match client.get(&url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => ToolResult::ok(super::context::truncate_response(&body)),
            Err(e) => ToolResult::error(format!("failed to read response body: {e}")),
        },
        Err(e) => ToolResult::error(format!("fetch failed: {e}")),
    }
}

async fn dispatch_ticket_log(ctx: &ToolContext, args: &Value) -> ToolResult {
    let message = match require_str(args, "message") {
        Ok(m) => m,
        Err(r) => return r,
    };
    match ctx.ticket_store.log_activity(&ctx.ticket_id, message).await {
        Ok(_) => ToolResult::ok("logged"),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn dispatch_ticket_add_task(ctx: &ToolContext, args: &Value) -> ToolResult {
    let name = match require_str(args, "name") {
        Ok(n) => n,
        Err(r) => return r,
    };
    let description = match require_str(args, "description") {
        Ok(d) => d,
        Err(r) => return r,
    };
    match ctx.ticket_store.add_task(&ctx.ticket_id, name, description).await {
        Ok(task) => ToolResult::ok(format!("created task {} ({})", task.name, task.id)),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn dispatch_ticket_add_subtask(ctx: &ToolContext, args: &Value) -> ToolResult {
    let task_id = match require_str(args, "task_id") {
        Ok(t) => t,
        Err(r) => return r,
    };
    let name = match require_str(args, "name") {
        Ok(n) => n,
        Err(r) => return r,
    };
    let description = match require_str(args, "description") {
        Ok(d) => d,
        Err(r) => return r,
    };
    match ctx
        .ticket_store
        .add_subtask(&ctx.ticket_id, &task_id, name, description)
        .await
    {
        Ok(sub) => ToolResult::ok(format!("created subtask {} ({})", sub.name, sub.id)),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn dispatch_get_next_work_item(ctx: &ToolContext) -> ToolResult {
    let ticket = match ctx.ticket_store.get(&ctx.ticket_id).await {
        Ok(t) => t,
        Err(e) => return ToolResult::error(e.to_string()),
    };
    for task in &ticket.tasks {
        for sub in &task.subtasks {
            if sub.status == SubtaskStatus::Incomplete {
                return ToolResult::ok(
                    json!({
                        "task_id": task.id,
                        "task_name": task.name,
                        "subtask_id": sub.id,
                        "subtask_name": sub.name,
                        "subtask_description": sub.description,
                    })
                    .to_string(),
                );
            }
        }
    }
    ToolResult::ok(json!(null).to_string())
}

async fn dispatch_update_llm_notes(ctx: &ToolContext, args: &Value) -> ToolResult {
    let provider_id = match require_str(args, "provider_id") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let strengths = arg_str(args, "strengths").map(str::to_string);
    let weaknesses = arg_str(args, "weaknesses").map(str::to_string);
    if ctx.registry.update_llm_notes(&provider_id, strengths, weaknesses) {
        ToolResult::ok(format!("updated notes for {provider_id}"))
    } else {
        ToolResult::error(format!("no such provider '{provider_id}'"))
    }
}

async fn dispatch_end_subtask(ctx: &ToolContext, args: &Value) -> ToolResult {
    let task_id = match require_str(args, "task_id") {
        Ok(t) => t,
        Err(r) => return r,
    };
    let subtask_id = match require_str(args, "subtask_id") {
        Ok(s) => s,
        Err(r) => return r,
    };
    let status_raw = match require_str(args, "status") {
        Ok(s) => s,
        Err(r) => return r,
    };
    let Some(status) = parse_subtask_status(&status_raw) else {
        return ToolResult::error(format!("unknown subtask status '{status_raw}'"));
    };
    match ctx
        .ticket_store
        .transition_subtask(&ctx.ticket_id, &task_id, &subtask_id, status)
        .await
    {
        Ok(_) => ToolResult::exit(format!("subtask {subtask_id} ended with status {status_raw}")),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

/// These four are "signal" tools: the heavy lifting (spawning a nested
/// conversation, deciding whether to reconstitute after a crash) is the
/// orchestrator's job, not the tool handler's. The handler's only
/// responsibility is to stop the current driver loop with a payload the
/// orchestrator can act on. A Developer's assistant turn may issue several
/// `start_sub_agent` calls at once; the driver collects every exit-flagged
/// call from the turn rather than acting on only the first.
fn dispatch_start_developer(args: &Value) -> ToolResult {
    ToolResult::exit(args.to_string())
}

fn dispatch_start_sub_agent(args: &Value) -> ToolResult {
    ToolResult::exit(args.to_string())
}

fn dispatch_agent_task_complete(args: &Value) -> ToolResult {
    let summary = arg_str(args, "summary").unwrap_or_default();
    ToolResult::exit(summary.to_string())
}

fn dispatch_summarize_history(args: &Value) -> ToolResult {
    let summary = arg_str(args, "summary").unwrap_or_default();
    ToolResult::exit(summary.to_string())
}

fn dispatch_add_memory(ctx: &ToolContext, args: &Value) -> ToolResult {
    let label_raw = match require_str(args, "label") {
        Ok(l) => l,
        Err(r) => return r,
    };
    let text = match require_str(args, "text") {
        Ok(t) => t,
        Err(r) => return r,
    };
    let Some(label) = parse_memory_label(&label_raw) else {
        return ToolResult::error(format!("unknown memory label '{label_raw}'"));
    };
    ctx.memories.add(label, text);
    ToolResult::ok("memory added")
}

fn dispatch_remove_memory(ctx: &ToolContext, args: &Value) -> ToolResult {
    let label_raw = match require_str(args, "label") {
        Ok(l) => l,
        Err(r) => return r,
    };
    let text = match require_str(args, "text") {
        Ok(t) => t,
        Err(r) => return r,
    };
    let Some(label) = parse_memory_label(&label_raw) else {
        return ToolResult::error(format!("unknown memory label '{label_raw}'"));
    };
    let removed = ctx.memories.remove(label, &text);
    ToolResult::ok(format!("removed {removed} matching entries"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_backlog_sees_task_creation_not_start_developer() {
        assert!(is_allowed(ToolsetRole::PlanningBacklog, "ticket_add_task"));
        assert!(!is_allowed(ToolsetRole::PlanningBacklog, "start_developer"));
    }

    #[test]
    fn planning_active_sees_start_developer_not_task_creation() {
        assert!(is_allowed(ToolsetRole::PlanningActive, "start_developer"));
        assert!(!is_allowed(ToolsetRole::PlanningActive, "ticket_add_task"));
    }

    #[test]
    fn developer_has_sub_agent_spawn_subagent_does_not() {
        assert!(is_allowed(ToolsetRole::Developer, "start_sub_agent"));
        assert!(!is_allowed(ToolsetRole::SubAgent, "start_sub_agent"));
        assert!(is_allowed(ToolsetRole::SubAgent, "agent_task_complete"));
    }

    #[test]
    fn compaction_only_sees_summarize_and_memory() {
        assert!(is_allowed(ToolsetRole::Compaction, "summarize_history"));
        assert!(is_allowed(ToolsetRole::Compaction, "add_memory"));
        assert!(!is_allowed(ToolsetRole::Compaction, "shell"));
        assert!(!is_allowed(ToolsetRole::Compaction, "file_read"));
    }

    #[test]
    fn memory_tools_available_to_every_role() {
        for role in [
            ToolsetRole::PlanningBacklog,
            ToolsetRole::PlanningActive,
            ToolsetRole::Developer,
            ToolsetRole::SubAgent,
            ToolsetRole::Compaction,
        ] {
            assert!(is_allowed(role, "add_memory"));
            assert!(is_allowed(role, "remove_memory"));
        }
    }
}
