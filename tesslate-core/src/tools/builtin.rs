//! Built-in tool set (§4.C) every environment exposes: filesystem
//! operations, the persistent and one-shot shell APIs, project metadata,
//! a bounded web fetch, and the session-scoped todo list.

use super::patch::{Edit, apply_multi_edit, apply_search_replace};
use super::{ParameterSpec, RunContext, ToolDescriptor, ToolRegistry, ToolResult, TodoItem};
use crate::naming;
use crate::orchestrator::OrchestratorError;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tesslate_commons::retry::with_retry;
use tokio::time::sleep;

fn param(name: &str, description: &str, required: bool) -> ParameterSpec {
    ParameterSpec { name: name.to_string(), description: description.to_string(), required }
}

fn is_retryable_orchestrator_error(error: &OrchestratorError) -> bool {
    matches!(
        error,
        OrchestratorError::Io(_) | OrchestratorError::Disconnected(_) | OrchestratorError::Timeout(_)
    )
}

fn str_param(params: &Value, name: &str) -> Result<String, String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing required parameter '{name}'"))
}

/// Register every built-in tool into `registry` (§4.C).
pub fn register_builtins(registry: &mut ToolRegistry) {
    registry.register(read_file());
    registry.register(write_file());
    registry.register(patch_file());
    registry.register(multi_edit());
    registry.register(bash_exec());
    registry.register(shell_open());
    registry.register(shell_exec());
    registry.register(shell_close());
    registry.register(get_project_info());
    registry.register(web_fetch());
    registry.register(todo_read());
    registry.register(todo_write());
}

fn read_file() -> ToolDescriptor {
    ToolDescriptor::new(
        "read_file",
        "filesystem",
        "Read the full content of a file relative to the project root.",
        vec![param("file_path", "Path relative to the project root", true)],
        vec![r#"{"file_path": "src/main.rs"}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let file_path = match str_param(&params, "file_path") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::err("read_file", e),
                };
                let result = with_retry(
                    || async { ctx.orchestrator.read_file(&ctx.user, &ctx.project, &file_path).await },
                    is_retryable_orchestrator_error,
                )
                .await;
                match result {
                    Ok(Some(content)) => ToolResult::ok("read_file", json!({ "content": content })),
                    Ok(None) => ToolResult::err("read_file", format!("file not found: {file_path}")),
                    Err(e) => ToolResult::err("read_file", e.to_string()),
                }
            })
        }),
    )
}

fn preview(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= 10 {
        return content.to_string();
    }
    let head = lines[..5].join("\n");
    let tail = lines[lines.len() - 5..].join("\n");
    format!("{head}\n... [{} lines elided] ...\n{tail}", lines.len() - 10)
}

fn write_file() -> ToolDescriptor {
    ToolDescriptor::new(
        "write_file",
        "filesystem",
        "Write the complete content of a file, creating parent directories as needed.",
        vec![
            param("file_path", "Path relative to the project root", true),
            param("content", "Full file content", true),
        ],
        vec![r#"{"file_path": "src/lib.rs", "content": "pub fn hello() {}"}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let file_path = match str_param(&params, "file_path") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::err("write_file", e),
                };
                let content = match str_param(&params, "content") {
                    Ok(c) => c,
                    Err(e) => return ToolResult::err("write_file", e),
                };
                let preview_text = preview(&content);
                let result = with_retry(
                    || {
                        let content = content.clone();
                        let file_path = file_path.clone();
                        let ctx = ctx.clone();
                        async move { ctx.orchestrator.write_file(&ctx.user, &ctx.project, &file_path, &content).await }
                    },
                    is_retryable_orchestrator_error,
                )
                .await;
                match result {
                    Ok(_) => ToolResult::ok("write_file", json!({ "preview": preview_text })),
                    Err(e) => ToolResult::err("write_file", e.to_string()),
                }
            })
        }),
    )
}

fn patch_file() -> ToolDescriptor {
    ToolDescriptor::new(
        "patch_file",
        "filesystem",
        "Apply a single search/replace edit to a file using progressive fuzzy matching.",
        vec![
            param("file_path", "Path relative to the project root", true),
            param("search", "Text to find", true),
            param("replace", "Replacement text", true),
        ],
        vec![r#"{"file_path": "src/lib.rs", "search": "fn old()", "replace": "fn new()"}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let file_path = match str_param(&params, "file_path") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::err("patch_file", e),
                };
                let search = match str_param(&params, "search") {
                    Ok(s) => s,
                    Err(e) => return ToolResult::err("patch_file", e),
                };
                let replace = match str_param(&params, "replace") {
                    Ok(r) => r,
                    Err(e) => return ToolResult::err("patch_file", e),
                };

                let existing = match ctx.orchestrator.read_file(&ctx.user, &ctx.project, &file_path).await {
                    Ok(Some(content)) => content,
                    Ok(None) => return ToolResult::err("patch_file", format!("file not found: {file_path}")),
                    Err(e) => return ToolResult::err("patch_file", e.to_string()),
                };

                let outcome = apply_search_replace(&existing, &search, &replace);
                if !outcome.success {
                    return ToolResult::err("patch_file", outcome.error.unwrap_or_default())
                        .with_suggestion("Re-read the file and retry with an exact excerpt from its current content.");
                }
                match ctx.orchestrator.write_file(&ctx.user, &ctx.project, &file_path, &outcome.content).await {
                    Ok(_) => ToolResult::ok(
                        "patch_file",
                        json!({ "match_method": format!("{:?}", outcome.match_method) }),
                    ),
                    Err(e) => ToolResult::err("patch_file", e.to_string()),
                }
            })
        }),
    )
}

fn multi_edit() -> ToolDescriptor {
    ToolDescriptor::new(
        "multi_edit",
        "filesystem",
        "Apply a sequence of search/replace edits to a file, each operating on the previous edit's result.",
        vec![
            param("file_path", "Path relative to the project root", true),
            param("edits", "Array of {search, replace} objects", true),
        ],
        vec![r#"{"file_path": "src/lib.rs", "edits": [{"search": "a", "replace": "b"}]}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let file_path = match str_param(&params, "file_path") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::err("multi_edit", e),
                };
                let edits: Vec<Edit> = match params.get("edits").and_then(Value::as_array) {
                    Some(arr) => arr
                        .iter()
                        .filter_map(|e| {
                            Some(Edit {
                                search: e.get("search")?.as_str()?.to_string(),
                                replace: e.get("replace")?.as_str()?.to_string(),
                            })
                        })
                        .collect(),
                    None => return ToolResult::err("multi_edit", "missing required parameter 'edits'"),
                };

                let existing = match ctx.orchestrator.read_file(&ctx.user, &ctx.project, &file_path).await {
                    Ok(Some(content)) => content,
                    Ok(None) => return ToolResult::err("multi_edit", format!("file not found: {file_path}")),
                    Err(e) => return ToolResult::err("multi_edit", e.to_string()),
                };

                let outcome = apply_multi_edit(&existing, &edits);
                if outcome.success {
                    if let Err(e) = ctx.orchestrator.write_file(&ctx.user, &ctx.project, &file_path, &outcome.content).await {
                        return ToolResult::err("multi_edit", e.to_string());
                    }
                }
                ToolResult {
                    success: outcome.success,
                    tool: "multi_edit".to_string(),
                    error: outcome.error,
                    suggestion: None,
                    required_action: None,
                    approval_required: None,
                    result: json!({ "applied_edits": outcome.applied_edits, "failed_index": outcome.failed_index }),
                }
            })
        }),
    )
}

async fn run_in_ephemeral_shell(ctx: &RunContext, command: &str, wait_seconds: f64) -> Result<(Vec<u8>, bool), String> {
    let id = ctx.shell.open(&ctx.user, &ctx.project, "/app").await.map_err(|e| e.to_string())?;
    let mut line = command.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    ctx.shell.write(id, line.as_bytes()).await.map_err(|e| e.to_string())?;
    sleep(Duration::from_secs_f64(wait_seconds)).await;
    let read = ctx.shell.read(id).map_err(|e| e.to_string());
    let _ = ctx.shell.close(id).await;
    read
}

fn bash_exec() -> ToolDescriptor {
    ToolDescriptor::new(
        "bash_exec",
        "shell",
        "Run a one-shot shell command: opens a session, writes the command, waits, reads output, closes the session.",
        vec![
            param("command", "Shell command to run", true),
            param("wait_seconds", "Seconds to wait before reading output (default 2.0)", false),
        ],
        vec![r#"{"command": "npm test"}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let command = match str_param(&params, "command") {
                    Ok(c) => c,
                    Err(e) => return ToolResult::err("bash_exec", e),
                };
                let wait_seconds = params.get("wait_seconds").and_then(Value::as_f64).unwrap_or(2.0);
                match run_in_ephemeral_shell(&ctx, &command, wait_seconds).await {
                    Ok((bytes, is_eof)) => ToolResult::ok(
                        "bash_exec",
                        json!({ "output": String::from_utf8_lossy(&bytes), "is_eof": is_eof }),
                    ),
                    Err(e) => ToolResult::err("bash_exec", e),
                }
            })
        }),
    )
}

fn shell_open() -> ToolDescriptor {
    ToolDescriptor::new(
        "shell_open",
        "shell",
        "Open a persistent interactive shell session, returning a session id.",
        vec![],
        vec!["{}".to_string()],
        Arc::new(|_params, ctx| {
            Box::pin(async move {
                match ctx.shell.open(&ctx.user, &ctx.project, "/app").await {
                    Ok(id) => ToolResult::ok("shell_open", json!({ "session_id": id.to_string() })),
                    Err(e) => ToolResult::err("shell_open", e.to_string()),
                }
            })
        }),
    )
}

fn shell_exec() -> ToolDescriptor {
    ToolDescriptor::new(
        "shell_exec",
        "shell",
        "Write a command into an existing shell session and read back whatever output accumulates.",
        vec![
            param("session_id", "Session id from shell_open", true),
            param("command", "Command to write (a trailing newline is added if missing)", true),
            param("wait_seconds", "Seconds to wait before reading output (default 2.0)", false),
        ],
        vec![r#"{"session_id": "...", "command": "ls -la"}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let session_id = match str_param(&params, "session_id").and_then(|s| {
                    s.parse::<uuid::Uuid>().map_err(|_| "invalid session_id".to_string())
                }) {
                    Ok(id) => id,
                    Err(e) => return ToolResult::err("shell_exec", e),
                };
                let command = match str_param(&params, "command") {
                    Ok(c) => c,
                    Err(e) => return ToolResult::err("shell_exec", e),
                };
                let wait_seconds = params.get("wait_seconds").and_then(Value::as_f64).unwrap_or(2.0);

                let mut line = command;
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if let Err(e) = ctx.shell.write(session_id, line.as_bytes()).await {
                    return ToolResult::err("shell_exec", e.to_string());
                }
                sleep(Duration::from_secs_f64(wait_seconds)).await;
                match ctx.shell.read(session_id) {
                    Ok((bytes, is_eof)) => ToolResult::ok(
                        "shell_exec",
                        json!({ "output": String::from_utf8_lossy(&bytes), "is_eof": is_eof }),
                    ),
                    Err(e) => ToolResult::err("shell_exec", e.to_string()),
                }
            })
        }),
    )
}

fn shell_close() -> ToolDescriptor {
    ToolDescriptor::new(
        "shell_close",
        "shell",
        "Close a persistent shell session.",
        vec![param("session_id", "Session id from shell_open", true)],
        vec![r#"{"session_id": "..."}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let session_id = match str_param(&params, "session_id").and_then(|s| {
                    s.parse::<uuid::Uuid>().map_err(|_| "invalid session_id".to_string())
                }) {
                    Ok(id) => id,
                    Err(e) => return ToolResult::err("shell_close", e),
                };
                match ctx.shell.close(session_id).await {
                    Ok(()) => ToolResult::ok("shell_close", Value::Null),
                    Err(e) => ToolResult::err("shell_close", e.to_string()),
                }
            })
        }),
    )
}

fn get_project_info() -> ToolDescriptor {
    ToolDescriptor::new(
        "get_project_info",
        "metadata",
        "Look up read-only project metadata (name, framework, repository url).",
        vec![],
        vec!["{}".to_string()],
        Arc::new(|_params, ctx| {
            Box::pin(async move {
                match ctx.project_info.get_project_info(&ctx.user, &ctx.project).await {
                    Some(info) => ToolResult::ok("get_project_info", serde_json::to_value(info).unwrap_or(Value::Null)),
                    None => ToolResult::err("get_project_info", "project not found"),
                }
            })
        }),
    )
}

const WEB_FETCH_TRUNCATE_BYTES: usize = 50 * 1024;

fn web_fetch() -> ToolDescriptor {
    ToolDescriptor::new(
        "web_fetch",
        "network",
        "HTTP GET a URL, following redirects, truncating the body at 50 KB.",
        vec![
            param("url", "URL to fetch", true),
            param("timeout", "Timeout in seconds (default 10)", false),
        ],
        vec![r#"{"url": "https://example.com"}"#.to_string()],
        Arc::new(|params, _ctx| {
            Box::pin(async move {
                let url = match str_param(&params, "url") {
                    Ok(u) => u,
                    Err(e) => return ToolResult::err("web_fetch", e),
                };
                let timeout_secs = params.get("timeout").and_then(Value::as_u64).unwrap_or(10);
                let client = match reqwest::Client::builder()
                    .timeout(Duration::from_secs(timeout_secs))
                    .build()
                {
                    Ok(c) => c,
                    Err(e) => return ToolResult::err("web_fetch", e.to_string()),
                };

                let result = with_retry(
                    || {
                        let client = client.clone();
                        let url = url.clone();
                        async move { client.get(&url).send().await }
                    },
                    |e: &reqwest::Error| e.is_timeout() || e.is_connect(),
                )
                .await;

                let response = match result {
                    Ok(response) => response,
                    Err(e) => return ToolResult::err("web_fetch", e.to_string()),
                };
                let status = response.status().as_u16();
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => return ToolResult::err("web_fetch", e.to_string()),
                };
                let truncated = body.len() > WEB_FETCH_TRUNCATE_BYTES;
                let content: String = body.chars().take(WEB_FETCH_TRUNCATE_BYTES).collect();
                ToolResult::ok(
                    "web_fetch",
                    json!({ "status": status, "content": content, "truncated": truncated }),
                )
            })
        }),
    )
}

fn todo_read() -> ToolDescriptor {
    ToolDescriptor::new(
        "todo_read",
        "planning",
        "Read the current session-scoped todo list.",
        vec![],
        vec!["{}".to_string()],
        Arc::new(|_params, ctx| {
            Box::pin(async move {
                let key = naming::project_key(&ctx.user, &ctx.project);
                let todos = ctx.todos.read(&key);
                ToolResult::ok("todo_read", json!({ "todos": todos }))
            })
        }),
    )
}

fn todo_write() -> ToolDescriptor {
    ToolDescriptor::new(
        "todo_write",
        "planning",
        "Replace the session-scoped todo list.",
        vec![param("todos", "Array of todo items", true)],
        vec![r#"{"todos": [{"id": "1", "content": "write tests", "status": "pending", "priority": "medium"}]}"#.to_string()],
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let todos: Vec<TodoItem> = match params.get("todos") {
                    Some(v) => match serde_json::from_value(v.clone()) {
                        Ok(todos) => todos,
                        Err(e) => return ToolResult::err("todo_write", format!("invalid todos payload: {e}")),
                    },
                    None => return ToolResult::err("todo_write", "missing required parameter 'todos'"),
                };
                let key = naming::project_key(&ctx.user, &ctx.project);
                ctx.todos.write(&key, todos);
                ToolResult::ok("todo_write", Value::Null)
            })
        }),
    )
}
