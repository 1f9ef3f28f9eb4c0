//! End-to-end scenario tests exercising the pieces that only cohere once
//! wired together: the iterative agent loop against a scripted model, the
//! shell quota/idle-reap behavior, and git conflict detection against a
//! fake orchestrator.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tesslate_core::agent::messages::ChatMessage;
use tesslate_core::agent::{
    AgentError, AgentRunConfig, ApprovalDecision, ApprovalWaiter, ModelAdapter, run_iterative_agent,
};
use tesslate_core::git::GitManager;
use tesslate_core::limiter::{LimiterConfig, ResourceLimiter};
use tesslate_core::orchestrator::{
    DeploymentKind, EnvironmentOrchestrator, EnvironmentStatus, GlobEntry, GrepMatch, OrchestratorError,
    StartOverrides,
};
use tesslate_core::shell::ShellSessionManager;
use tesslate_core::tools::{RunContext, TodoStore, ToolRegistry};
use tesslate_exec_events::AgentEvent;
use tokio::sync::mpsc;

/// In-memory stand-in for a running environment: files live in a map,
/// every other operation either no-ops or reports "not running".
#[derive(Default)]
struct FakeOrchestrator {
    files: DashMap<String, String>,
}

#[async_trait]
impl EnvironmentOrchestrator for FakeOrchestrator {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Docker
    }

    async fn start_container(
        &self,
        _user: &str,
        _project: &str,
        _project_path: &str,
        _slug: Option<&str>,
        _overrides: Option<StartOverrides>,
    ) -> Result<String, OrchestratorError> {
        Ok("http://fake.local".to_string())
    }

    async fn stop_container(&self, _user: &str, _project: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn restart_container(
        &self,
        _user: &str,
        _project: &str,
        _project_path: &str,
    ) -> Result<String, OrchestratorError> {
        Ok("http://fake.local".to_string())
    }

    async fn status(
        &self,
        _user: &str,
        _project: &str,
        _slug: Option<&str>,
    ) -> Result<EnvironmentStatus, OrchestratorError> {
        Ok(EnvironmentStatus::default())
    }

    async fn exec(
        &self,
        _user: &str,
        _project: &str,
        _command: &[String],
        _timeout: Duration,
    ) -> Result<String, OrchestratorError> {
        Ok(String::new())
    }

    async fn read_file(
        &self,
        _user: &str,
        _project: &str,
        relative_path: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        Ok(self.files.get(relative_path).map(|v| v.clone()))
    }

    async fn write_file(
        &self,
        _user: &str,
        _project: &str,
        relative_path: &str,
        content: &str,
    ) -> Result<bool, OrchestratorError> {
        self.files.insert(relative_path.to_string(), content.to_string());
        Ok(true)
    }

    async fn list_files(
        &self,
        _user: &str,
        _project: &str,
        _relative_path: &str,
    ) -> Result<Vec<GlobEntry>, OrchestratorError> {
        Ok(vec![])
    }

    async fn glob(&self, _user: &str, _project: &str, _pattern: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(vec![])
    }

    async fn grep(&self, _user: &str, _project: &str, _pattern: &str) -> Result<Vec<GrepMatch>, OrchestratorError> {
        Ok(vec![])
    }

    async fn track_activity(&self, _user: &str, _project: &str) {}

    async fn cleanup_idle(&self, _idle_minutes: u64) -> Vec<String> {
        vec![]
    }
}

/// A model whose responses are prerecorded and replayed one per call to
/// `stream`, each sent as a single chunk.
struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn new(responses: Vec<&str>) -> Self {
        Self { responses: Mutex::new(responses.into_iter().map(str::to_string).collect()) }
    }
}

#[async_trait]
impl ModelAdapter for ScriptedModel {
    async fn stream(&self, _messages: Vec<ChatMessage>, tx: mpsc::Sender<String>) -> Result<(), AgentError> {
        let next = self.responses.lock().unwrap().pop_front().unwrap_or_default();
        let _ = tx.send(next).await;
        Ok(())
    }
}

struct NeverApprove;
#[async_trait]
impl ApprovalWaiter for NeverApprove {
    async fn wait_for_decision(&self, _approval_id: uuid::Uuid) -> ApprovalDecision {
        ApprovalDecision::Stop
    }
}

fn test_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    tesslate_core::tools::builtin::register_builtins(&mut registry);
    registry
}

fn test_run_context(orchestrator: Arc<dyn EnvironmentOrchestrator>) -> Arc<RunContext> {
    struct NullProjectInfo;
    #[async_trait]
    impl tesslate_core::tools::ProjectInfoProvider for NullProjectInfo {
        async fn get_project_info(&self, _user: &str, _project: &str) -> Option<tesslate_core::tools::ProjectInfo> {
            None
        }
    }
    let shell = Arc::new(ShellSessionManager::new(
        Arc::new(NullPtyBroker),
        tesslate_config::ShellQuotaConfig::default(),
    ));
    Arc::new(RunContext {
        user: "u1".to_string(),
        project: "p1".to_string(),
        orchestrator,
        shell,
        project_info: Arc::new(NullProjectInfo),
        todos: Arc::new(TodoStore::default()),
        skip_approval_check: false,
    })
}

struct NullPtyWriter;
#[async_trait]
impl tesslate_core::pty::PtyWriter for NullPtyWriter {
    async fn write(&mut self, _bytes: &[u8]) -> Result<(), tesslate_core::pty::PtyError> {
        Ok(())
    }
    async fn close(&mut self) -> Result<(), tesslate_core::pty::PtyError> {
        Ok(())
    }
}

struct NullPtyBroker;
#[async_trait]
impl tesslate_core::pty::PtyBroker for NullPtyBroker {
    async fn open(
        &self,
        _user: &str,
        _project: &str,
        _cwd: &str,
        buffer_cap_bytes: usize,
        _idle_timeout: Duration,
    ) -> Result<tesslate_core::pty::PtySession, tesslate_core::pty::PtyError> {
        let buffer = tesslate_bash_runner::OutputBuffer::new(buffer_cap_bytes);
        let reader = tesslate_bash_runner::spawn_reader(buffer.clone(), || async { Ok(None) }, || {});
        Ok(tesslate_core::pty::PtySession::new(uuid::Uuid::new_v4(), buffer, reader, Box::new(NullPtyWriter)))
    }
}

/// S1 — happy-path iterative agent: write a file, read it back, then
/// declare completion. Expects two agent_step events (iterations 1 and 2)
/// followed by a `complete` with `iterations=3`.
#[tokio::test]
async fn happy_path_writes_reads_then_completes() {
    let orchestrator: Arc<dyn EnvironmentOrchestrator> = Arc::new(FakeOrchestrator::default());
    let run_context = test_run_context(orchestrator);
    let tools = test_registry();
    let limiter = Arc::new(ResourceLimiter::new(LimiterConfig::default()));

    let model = Arc::new(ScriptedModel::new(vec![
        r#"THOUGHT: I will write. <tool_call><tool_name>write_file</tool_name><parameters>{"file_path":"greeting.txt","content":"HELLO"}</parameters></tool_call>"#,
        r#"<tool_call><tool_name>read_file</tool_name><parameters>{"file_path":"greeting.txt"}</parameters></tool_call>"#,
        "Done. TASK_COMPLETE",
    ]));

    let config = AgentRunConfig {
        system_prompt: "You are a helpful file editor.".to_string(),
        specialization_prompt: String::new(),
        chat_history: Vec::new(),
        user_request: "Write the string HELLO into greeting.txt then confirm.".to_string(),
        deployment_mode: "docker".to_string(),
        container_name: "c1".to_string(),
        project_path: "/app".to_string(),
        run_id: "run-s1".to_string(),
    };

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let handle = tokio::spawn(run_iterative_agent(
        config,
        model,
        tools,
        run_context,
        limiter,
        Arc::new(NeverApprove),
        events_tx,
    ));

    let mut steps = Vec::new();
    let mut complete = None;
    while let Some(event) = events_rx.recv().await {
        match event {
            AgentEvent::AgentStep(step) => steps.push(step),
            AgentEvent::Complete { success, iterations, completion_reason, .. } => {
                complete = Some((success, iterations, completion_reason));
            }
            _ => {}
        }
    }
    handle.await.unwrap();

    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].iteration, 1);
    assert_eq!(steps[0].tool_calls[0].name, "write_file");
    assert_eq!(steps[1].iteration, 2);
    assert_eq!(steps[1].tool_calls[0].name, "read_file");
    assert!(steps[1].tool_results[0].success);

    let (success, iterations, reason) = complete.expect("expected a complete event");
    assert!(success);
    assert_eq!(iterations, 3);
    assert_eq!(reason, "task_complete_signal");
}

/// S2 — a malformed tool call surfaces as a `__parse_error__` step with a
/// required-action hint and does not end the run.
#[tokio::test]
async fn malformed_tool_call_recovers_without_completing() {
    let orchestrator: Arc<dyn EnvironmentOrchestrator> = Arc::new(FakeOrchestrator::default());
    let run_context = test_run_context(orchestrator);
    let tools = test_registry();
    let limiter = Arc::new(ResourceLimiter::new(LimiterConfig::default()));

    let model = Arc::new(ScriptedModel::new(vec![
        r#"<tool_call><tool_name>write_file</tool_name><parameters>{"file_path": "a", "content": "broken "quotes"}</parameters></tool_call>"#,
        "Done. TASK_COMPLETE",
    ]));

    let config = AgentRunConfig {
        system_prompt: "You are a helpful file editor.".to_string(),
        specialization_prompt: String::new(),
        chat_history: Vec::new(),
        user_request: "Write a file.".to_string(),
        deployment_mode: "docker".to_string(),
        container_name: "c1".to_string(),
        project_path: "/app".to_string(),
        run_id: "run-s2".to_string(),
    };

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let handle = tokio::spawn(run_iterative_agent(
        config,
        model,
        tools,
        run_context,
        limiter,
        Arc::new(NeverApprove),
        events_tx,
    ));

    let mut first_step = None;
    let mut saw_premature_complete = false;
    while let Some(event) = events_rx.recv().await {
        match event {
            AgentEvent::AgentStep(step) if first_step.is_none() => first_step = Some(step),
            AgentEvent::Complete { success, iterations, .. } if success && iterations == 1 => {
                saw_premature_complete = true;
            }
            _ => {}
        }
    }
    handle.await.unwrap();

    let step = first_step.expect("expected a parse-error agent_step");
    assert_eq!(step.tool_calls[0].name, "__parse_error__");
    assert!(!step.tool_results[0].success);
    assert!(step.tool_results[0].suggestion.as_deref().unwrap_or_default().contains("REQUIRED ACTION"));
    assert!(!saw_premature_complete);
}

/// S4 — idle reap closes sessions whose last activity is older than the
/// quota's idle timeout and leaves fresher sessions alone.
#[tokio::test]
async fn idle_sessions_are_reaped_active_ones_are_not() {
    let manager = ShellSessionManager::new(
        Arc::new(NullPtyBroker),
        tesslate_config::ShellQuotaConfig {
            max_sessions_per_user: 10,
            max_sessions_per_project: 10,
            idle_timeout_secs: 0,
            hard_kill_secs: 28_800,
            buffer_cap_bytes: 4096,
        },
    );

    let stale = manager.open("u1", "idle-project", "/app").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let fresh_manager = ShellSessionManager::new(
        Arc::new(NullPtyBroker),
        tesslate_config::ShellQuotaConfig {
            max_sessions_per_user: 10,
            max_sessions_per_project: 10,
            idle_timeout_secs: 3600,
            hard_kill_secs: 28_800,
            buffer_cap_bytes: 4096,
        },
    );
    let fresh = fresh_manager.open("u1", "fresh-project", "/app").await.unwrap();

    let reaped = manager.reap().await;
    assert_eq!(reaped, vec![stale]);
    assert!(manager.record(stale).is_none());

    let fresh_reaped = fresh_manager.reap().await;
    assert!(fresh_reaped.is_empty());
    assert!(fresh_manager.record(fresh).is_some());
}

/// S5 — a sixth session request for a user already at quota is rejected
/// and the rejection names every existing session.
#[tokio::test]
async fn sixth_session_over_quota_is_rejected_listing_existing() {
    let manager = ShellSessionManager::new(
        Arc::new(NullPtyBroker),
        tesslate_config::ShellQuotaConfig {
            max_sessions_per_user: 5,
            max_sessions_per_project: 10,
            idle_timeout_secs: 1800,
            hard_kill_secs: 28_800,
            buffer_cap_bytes: 4096,
        },
    );

    let mut existing = Vec::new();
    for i in 0..5 {
        existing.push(manager.open("u1", &format!("p{i}"), "/app").await.unwrap());
    }

    let err = manager.open("u1", "p-overflow", "/app").await.unwrap_err();
    match err {
        tesslate_core::shell::ShellError::TooManyUserSessions { user, existing: listed } => {
            assert_eq!(user, "u1");
            assert_eq!(listed.len(), 5);
            for id in &existing {
                assert!(listed.contains(id));
            }
        }
        other => panic!("expected TooManyUserSessions, got {other:?}"),
    }
}

/// S6 — pulling into a tree with a conflicting local change surfaces the
/// conflicting path rather than propagating the raw non-zero exit.
#[tokio::test]
async fn pull_conflict_reports_the_conflicting_path() {
    struct ConflictingPullOrchestrator;

    #[async_trait]
    impl EnvironmentOrchestrator for ConflictingPullOrchestrator {
        fn kind(&self) -> DeploymentKind {
            DeploymentKind::Docker
        }
        async fn start_container(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: Option<StartOverrides>,
        ) -> Result<String, OrchestratorError> {
            unimplemented!()
        }
        async fn stop_container(&self, _: &str, _: &str) -> Result<(), OrchestratorError> {
            unimplemented!()
        }
        async fn restart_container(&self, _: &str, _: &str, _: &str) -> Result<String, OrchestratorError> {
            unimplemented!()
        }
        async fn status(&self, _: &str, _: &str, _: Option<&str>) -> Result<EnvironmentStatus, OrchestratorError> {
            unimplemented!()
        }
        async fn exec(
            &self,
            _user: &str,
            _project: &str,
            command: &[String],
            _timeout: Duration,
        ) -> Result<String, OrchestratorError> {
            if command.iter().any(|a| a == "pull") {
                return Err(OrchestratorError::NonZeroExit { code: 1, output: "CONFLICT".to_string() });
            }
            if command.iter().any(|a| a == "status") {
                return Ok("UU README.md\n".to_string());
            }
            Ok(String::new())
        }
        async fn read_file(&self, _: &str, _: &str, _: &str) -> Result<Option<String>, OrchestratorError> {
            unimplemented!()
        }
        async fn write_file(&self, _: &str, _: &str, _: &str, _: &str) -> Result<bool, OrchestratorError> {
            unimplemented!()
        }
        async fn list_files(&self, _: &str, _: &str, _: &str) -> Result<Vec<GlobEntry>, OrchestratorError> {
            unimplemented!()
        }
        async fn glob(&self, _: &str, _: &str, _: &str) -> Result<Vec<String>, OrchestratorError> {
            unimplemented!()
        }
        async fn grep(&self, _: &str, _: &str, _: &str) -> Result<Vec<GrepMatch>, OrchestratorError> {
            unimplemented!()
        }
        async fn track_activity(&self, _: &str, _: &str) {}
        async fn cleanup_idle(&self, _: u64) -> Vec<String> {
            vec![]
        }
    }

    let git = GitManager::new(Arc::new(ConflictingPullOrchestrator), "u1", "p1");
    let result = git.pull(None, "origin").await.unwrap();
    assert!(!result.success);
    assert_eq!(result.conflicts, vec!["README.md".to_string()]);
}
