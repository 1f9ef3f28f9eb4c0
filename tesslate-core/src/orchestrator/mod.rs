//! Environment orchestrator (§4.H): the uniform contract agent tools use to
//! start, stop, and exec into a per-(user, project) development environment,
//! with one implementation per deployment back-end.

pub mod docker;
pub mod k8s;
pub mod manifest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Which back-end an orchestrator instance (and any name derived from it)
/// targets. `tesslate-config::DeploymentMode` is the on-disk/config-file
/// representation; this is the in-process equivalent used wherever code
/// needs to branch on back-end behavior rather than just serialize it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentKind {
    Docker,
    Kubernetes,
}

impl From<tesslate_config::DeploymentMode> for DeploymentKind {
    fn from(mode: tesslate_config::DeploymentMode) -> Self {
        match mode {
            tesslate_config::DeploymentMode::Docker => DeploymentKind::Docker,
            tesslate_config::DeploymentMode::Kubernetes => DeploymentKind::Kubernetes,
        }
    }
}

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("docker daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error("image build failed: {0}")]
    ImageBuildFailed(String),
    #[error("startup timed out after {0:?}")]
    StartupTimeout(Duration),
    #[error("project files missing at {0}")]
    MissingFiles(String),
    #[error("environment for {user}/{project} is not running")]
    EnvNotRunning { user: String, project: String },
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("environment disconnected: {0}")]
    Disconnected(String),
    #[error("command exited non-zero ({code}): {output}")]
    NonZeroExit { code: i32, output: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kubernetes api error: {0}")]
    Kube(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    #[default]
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Stopping,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub state: EnvironmentState,
    pub running: bool,
    pub url: Option<String>,
    pub hostname: Option<String>,
    pub health: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub replicas: Option<u32>,
    pub pods: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StartOverrides {
    pub start_command: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct GlobEntry {
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: u64,
    pub line: String,
}

/// Uniform environment lifecycle + filesystem + exec contract (§4.H). Every
/// path is interpreted relative to the project root regardless of back-end.
#[async_trait]
pub trait EnvironmentOrchestrator: Send + Sync {
    fn kind(&self) -> DeploymentKind;

    async fn start_container(
        &self,
        user: &str,
        project: &str,
        project_path: &str,
        slug: Option<&str>,
        overrides: Option<StartOverrides>,
    ) -> Result<String, OrchestratorError>;

    async fn stop_container(&self, user: &str, project: &str) -> Result<(), OrchestratorError>;

    async fn restart_container(
        &self,
        user: &str,
        project: &str,
        project_path: &str,
    ) -> Result<String, OrchestratorError>;

    async fn status(
        &self,
        user: &str,
        project: &str,
        slug: Option<&str>,
    ) -> Result<EnvironmentStatus, OrchestratorError>;

    async fn exec(
        &self,
        user: &str,
        project: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<String, OrchestratorError>;

    async fn read_file(
        &self,
        user: &str,
        project: &str,
        relative_path: &str,
    ) -> Result<Option<String>, OrchestratorError>;

    async fn write_file(
        &self,
        user: &str,
        project: &str,
        relative_path: &str,
        content: &str,
    ) -> Result<bool, OrchestratorError>;

    async fn list_files(
        &self,
        user: &str,
        project: &str,
        relative_path: &str,
    ) -> Result<Vec<GlobEntry>, OrchestratorError>;

    async fn glob(
        &self,
        user: &str,
        project: &str,
        pattern: &str,
    ) -> Result<Vec<String>, OrchestratorError>;

    async fn grep(
        &self,
        user: &str,
        project: &str,
        pattern: &str,
    ) -> Result<Vec<GrepMatch>, OrchestratorError>;

    async fn track_activity(&self, user: &str, project: &str);

    async fn cleanup_idle(&self, idle_minutes: u64) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_kind_converts_from_config_mode() {
        assert_eq!(
            DeploymentKind::from(tesslate_config::DeploymentMode::Docker),
            DeploymentKind::Docker
        );
        assert_eq!(
            DeploymentKind::from(tesslate_config::DeploymentMode::Kubernetes),
            DeploymentKind::Kubernetes
        );
    }

    #[test]
    fn environment_status_defaults_to_stopped() {
        let status = EnvironmentStatus::default();
        assert_eq!(status.state, EnvironmentState::Stopped);
        assert!(!status.running);
    }
}
