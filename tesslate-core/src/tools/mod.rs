//! Tool registry (§4.C): named, describable, independently invocable units
//! of agent capability, plus the built-in tool set every environment
//! exposes.

pub mod builtin;
pub mod patch;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::orchestrator::EnvironmentOrchestrator;
use crate::shell::ShellSessionManager;

/// Per-call context every tool executor receives: which (user, project) it
/// is scoped to and the collaborators it needs to act (orchestrator, shell
/// sessions, project metadata, the in-memory todo store).
#[derive(Clone)]
pub struct RunContext {
    pub user: String,
    pub project: String,
    pub orchestrator: Arc<dyn EnvironmentOrchestrator>,
    pub shell: Arc<ShellSessionManager>,
    pub project_info: Arc<dyn ProjectInfoProvider>,
    pub todos: Arc<TodoStore>,
    pub skip_approval_check: bool,
}

impl RunContext {
    /// A copy with `skip_approval_check` set, used to re-run a tool call
    /// once the agent loop has received an `allow_once`/`allow_all`
    /// decision for it.
    pub fn with_approval_skipped(&self) -> Self {
        let mut copy = self.clone();
        copy.skip_approval_check = true;
        copy
    }
}

/// External-database lookup the original system exposes via its own HTTP
/// routers (out of scope here, §11); `get_project_info` depends on it, so
/// it is represented as a narrow trait the embedding application supplies.
#[async_trait::async_trait]
pub trait ProjectInfoProvider: Send + Sync {
    async fn get_project_info(&self, user: &str, project: &str) -> Option<ProjectInfo>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub description: Option<String>,
    pub framework: Option<String>,
    pub repository_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub priority: TodoPriority,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Session-scoped todo list, keyed by (user, project) (§4.C).
#[derive(Default)]
pub struct TodoStore {
    lists: dashmap::DashMap<String, Vec<TodoItem>>,
}

impl TodoStore {
    pub fn read(&self, key: &str) -> Vec<TodoItem> {
        self.lists.get(key).map(|l| l.clone()).unwrap_or_default()
    }

    pub fn write(&self, key: &str, todos: Vec<TodoItem>) {
        self.lists.insert(key.to_string(), todos);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_required: Option<bool>,
    pub result: Value,
}

impl ToolResult {
    pub fn ok(tool: &str, result: Value) -> Self {
        Self {
            success: true,
            tool: tool.to_string(),
            error: None,
            suggestion: None,
            required_action: None,
            approval_required: None,
            result,
        }
    }

    pub fn err(tool: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            tool: tool.to_string(),
            error: Some(error.into()),
            suggestion: None,
            required_action: None,
            approval_required: None,
            result: Value::Null,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_required_action(mut self, action: impl Into<String>) -> Self {
        self.required_action = Some(action.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub description: String,
    pub required: bool,
}

type Executor = Arc<dyn Fn(Value, Arc<RunContext>) -> BoxFuture<'static, ToolResult> + Send + Sync>;

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub category: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub examples: Vec<String>,
    executor: Executor,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterSpec>,
        examples: Vec<String>,
        executor: Executor,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            description: description.into(),
            parameters,
            examples,
            executor,
        }
    }

    pub async fn invoke(&self, params: Value, ctx: Arc<RunContext>) -> ToolResult {
        (self.executor)(params, ctx).await
    }
}

/// Stores descriptors keyed by name. Re-registration overwrites and logs a
/// warning rather than erroring, since tool definitions are expected to be
/// refreshed at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        if self.tools.contains_key(&descriptor.name) {
            tracing::warn!(tool = %descriptor.name, "overwriting previously registered tool");
        }
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    pub async fn execute(&self, name: &str, params: Value, ctx: Arc<RunContext>) -> ToolResult {
        match self.tools.get(name) {
            Some(descriptor) => descriptor.invoke(params, ctx).await,
            None => {
                let available: Vec<&str> = self.tools.keys().map(String::as_str).collect();
                ToolResult::err(
                    name,
                    format!("Unknown tool '{name}'. Available: {}", available.join(", ")),
                )
            }
        }
    }

    /// Build an independent registry containing only the named tools.
    /// Missing names are logged and skipped; the result never mutates
    /// `self`.
    pub fn scoped(&self, whitelist: &[String]) -> ToolRegistry {
        let mut scoped = ToolRegistry::new();
        for name in whitelist {
            match self.tools.get(name) {
                Some(descriptor) => scoped.register(descriptor.clone()),
                None => tracing::warn!(tool = %name, "scoped registry requested unknown tool, skipping"),
            }
        }
        scoped
    }

    /// Render the tool listing included in the agent's system prompt,
    /// grouped by category.
    pub fn render_prompt_listing(&self) -> String {
        let mut by_category: HashMap<&str, Vec<&ToolDescriptor>> = HashMap::new();
        for tool in self.tools.values() {
            by_category.entry(tool.category.as_str()).or_default().push(tool);
        }
        let mut categories: Vec<&&str> = by_category.keys().collect();
        categories.sort();

        let mut out = String::new();
        for category in categories {
            out.push_str(&format!("## {category}\n"));
            let mut tools = by_category[category].clone();
            tools.sort_by(|a, b| a.name.cmp(&b.name));
            for tool in tools {
                out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
                for param in &tool.parameters {
                    let flag = if param.required { "required" } else { "optional" };
                    out.push_str(&format!("  - {} ({flag}): {}\n", param.name, param.description));
                }
                for example in &tool.examples {
                    out.push_str(&format!("  example: {example}\n"));
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor::new(
            name,
            "filesystem",
            "test tool",
            vec![],
            vec![],
            Arc::new(|_params, _ctx| Box::pin(async { ToolResult::ok("test", Value::Null) })),
        )
    }

    #[test]
    fn scoped_registry_skips_unknown_names() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("read_file"));
        let scoped = registry.scoped(&["read_file".to_string(), "nonexistent".to_string()]);
        assert_eq!(scoped.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn render_prompt_listing_groups_by_category() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("read_file"));
        let listing = registry.render_prompt_listing();
        assert!(listing.contains("## filesystem"));
        assert!(listing.contains("read_file"));
    }
}
