//! Docker + Traefik back-end (§4.H-D). Initialization is lazy and
//! memoized: the first call into any method pays for daemon detection,
//! Traefik network discovery, host-mount translation, and base-image
//! provisioning; every call after that reuses the cached [`DockerInit`].

use super::{
    DeploymentKind, EnvironmentOrchestrator, EnvironmentState, EnvironmentStatus, GlobEntry,
    GrepMatch, OrchestratorError, StartOverrides,
};
use crate::naming;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;

const READY_LOG_INDICATORS: &[&str] = &[
    "listening on",
    "ready in",
    "compiled successfully",
    "localhost:",
    "0.0.0.0:",
    "dev server running",
];

const LOG_PROBE_INTERVAL: Duration = Duration::from_secs(3);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct DockerInit {
    traefik_network: String,
    host_users_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct EnvironmentRecord {
    container_name: String,
    hostname: String,
    user: String,
    project: String,
    container_id: String,
}

pub struct DockerOrchestrator {
    config: tesslate_config::DockerConfig,
    domain: tesslate_config::DomainConfig,
    init: OnceCell<DockerInit>,
    environments: DashMap<String, EnvironmentRecord>,
    activity: DashMap<String, DateTime<Utc>>,
    http: reqwest::Client,
}

impl DockerOrchestrator {
    pub fn new(config: tesslate_config::DockerConfig, domain: tesslate_config::DomainConfig) -> Self {
        Self {
            config,
            domain,
            init: OnceCell::new(),
            environments: DashMap::new(),
            activity: DashMap::new(),
            http: reqwest::Client::new(),
        }
    }

    async fn ensure_init(&self) -> Result<&DockerInit, OrchestratorError> {
        self.init
            .get_or_try_init(|| async {
                self.detect_daemon().await?;
                let traefik_network = self.detect_traefik_network().await;
                let host_users_path = self.detect_host_mount().await;
                self.ensure_base_image().await?;
                self.ensure_network(&traefik_network).await?;
                Ok(DockerInit {
                    traefik_network,
                    host_users_path,
                })
            })
            .await
    }

    async fn detect_daemon(&self) -> Result<(), OrchestratorError> {
        let version = Command::new("docker").arg("--version").output().await?;
        if !version.status.success() {
            return Err(OrchestratorError::DaemonUnavailable(
                "docker --version failed".to_string(),
            ));
        }
        let info = Command::new("docker").arg("info").output().await?;
        if !info.status.success() {
            return Err(OrchestratorError::DaemonUnavailable(
                "docker info failed, daemon may not be running".to_string(),
            ));
        }
        Ok(())
    }

    /// Inspect the running Traefik container's network memberships,
    /// preferring one whose name contains `tesslate`, falling back through
    /// progressively looser matches: first network listed, then a
    /// `docker network ls` name match, and finally a hardcoded default.
    async fn detect_traefik_network(&self) -> String {
        let default = "tesslate-network".to_string();
        let output = match Command::new("docker")
            .args(["inspect", &self.config.traefik_container_name])
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            _ => return self.network_ls_fallback().await.unwrap_or(default),
        };

        let parsed: Option<Value> = serde_json::from_slice(&output.stdout).ok();
        let networks = parsed
            .as_ref()
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|entry| entry.pointer("/NetworkSettings/Networks"))
            .and_then(|v| v.as_object());

        let Some(networks) = networks else {
            return self.network_ls_fallback().await.unwrap_or(default);
        };
        let names: Vec<&String> = networks.keys().collect();
        if let Some(preferred) = names.iter().find(|n| n.contains("tesslate")) {
            return (*preferred).clone();
        }
        if let Some(first) = names.first() {
            return (*first).clone();
        }
        self.network_ls_fallback().await.unwrap_or(default)
    }

    /// Last-resort lookup run when the Traefik container can't be inspected
    /// at all: ask Docker directly for any network whose name matches
    /// `tesslate*`, taking the first one listed.
    async fn network_ls_fallback(&self) -> Option<String> {
        let output = Command::new("docker")
            .args(["network", "ls", "--filter", "name=tesslate", "--format", "{{.Name}}"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).lines().next().map(str::to_string)
    }

    /// Detect Docker-in-Docker host-mount paths by inspecting this
    /// process's own container for the mount backing `/app/users`.
    async fn detect_host_mount(&self) -> Option<PathBuf> {
        let self_id = std::fs::read_to_string("/etc/hostname").ok()?;
        let self_id = self_id.trim();
        let output = Command::new("docker")
            .args(["inspect", self_id])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let parsed: Value = serde_json::from_slice(&output.stdout).ok()?;
        let mounts = parsed.get(0)?.get("Mounts")?.as_array()?;
        for mount in mounts {
            if mount.get("Destination")?.as_str()? == "/app/users" {
                let source = mount.get("Source")?.as_str()?;
                return Some(PathBuf::from(source));
            }
        }
        None
    }

    async fn ensure_base_image(&self) -> Result<(), OrchestratorError> {
        let inspect = Command::new("docker")
            .args(["image", "inspect", &self.config.base_image])
            .output()
            .await?;
        if inspect.status.success() {
            return Ok(());
        }
        let build = Command::new("docker")
            .args(["build", "-t", &self.config.base_image, "."])
            .output()
            .await?;
        if !build.status.success() {
            return Err(OrchestratorError::ImageBuildFailed(
                String::from_utf8_lossy(&build.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn ensure_network(&self, network: &str) -> Result<(), OrchestratorError> {
        let inspect = Command::new("docker")
            .args(["network", "inspect", network])
            .output()
            .await?;
        if inspect.status.success() {
            return Ok(());
        }
        Command::new("docker")
            .args(["network", "create", network])
            .output()
            .await?;
        Ok(())
    }

    /// Container paths `/app/users/…` are rewritten to host paths before
    /// being supplied to the child `docker run`, because the daemon
    /// resolves bind mounts against the host filesystem.
    fn host_path(&self, init: &DockerInit, relative_project_path: &str) -> String {
        match &init.host_users_path {
            Some(host_users_path) => host_users_path
                .join(relative_project_path.trim_start_matches("users/"))
                .to_string_lossy()
                .to_string(),
            None => format!("/app/users/{}", relative_project_path.trim_start_matches("users/")),
        }
    }

    fn traefik_labels(&self, container_name: &str, hostname: &str, port: u16, network: &str) -> Vec<String> {
        let svc = container_name;
        vec![
            "traefik.enable=true".to_string(),
            format!("traefik.http.routers.{svc}.rule=Host(`{hostname}`)"),
            format!("traefik.http.routers.{svc}.entrypoints=web"),
            format!("traefik.http.services.{svc}.loadbalancer.server.port={port}"),
            format!("traefik.docker.network={network}"),
            format!("traefik.http.routers.{svc}-secure.rule=Host(`{hostname}`)"),
            format!("traefik.http.routers.{svc}-secure.entrypoints=websecure"),
            format!("traefik.http.routers.{svc}-secure.tls=true"),
            format!(
                "traefik.http.routers.{svc}-secure.tls.certresolver={}",
                self.config.traefik_cert_resolver
            ),
            format!("traefik.http.routers.{svc}-secure.tls.domains[0].main={hostname}"),
        ]
    }

    fn access_url(&self, hostname: &str) -> String {
        format!("{}://{}", self.domain.app_protocol, hostname)
    }

    async fn wait_for_readiness(&self, container_name: &str, url: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.readiness_timeout_secs);
        let mut log_ready = false;
        while tokio::time::Instant::now() < deadline {
            if !log_ready {
                if let Ok(output) = Command::new("docker")
                    .args(["logs", "--tail", "50", container_name])
                    .output()
                    .await
                {
                    let combined = format!(
                        "{}{}",
                        String::from_utf8_lossy(&output.stdout),
                        String::from_utf8_lossy(&output.stderr)
                    )
                    .to_lowercase();
                    if READY_LOG_INDICATORS.iter().any(|needle| combined.contains(needle)) {
                        log_ready = true;
                    }
                }
            } else if let Ok(Ok(response)) = timeout(HTTP_PROBE_TIMEOUT, self.http.get(url).send()).await {
                if response.status().as_u16() < 500 {
                    return true;
                }
            }
            tokio::time::sleep(LOG_PROBE_INTERVAL).await;
        }
        tracing::warn!(container_name, "readiness probe timed out, returning url anyway");
        false
    }

    fn key(user: &str, project: &str) -> String {
        naming::project_key(user, project)
    }

    fn parse_started_at(inspect_output: &Value) -> Option<DateTime<Utc>> {
        inspect_output
            .get(0)
            .and_then(|c| c.pointer("/State/StartedAt"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Baseline for an environment with no recorded activity yet (§4.H-D):
    /// the container's own `StartedAt`, not an already-expired synthetic
    /// timestamp, so a freshly started environment isn't reaped before it
    /// has lived through one full idle window.
    async fn container_started_at(&self, container_name: &str) -> Option<DateTime<Utc>> {
        let output = Command::new("docker").args(["inspect", container_name]).output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        let parsed: Value = serde_json::from_slice(&output.stdout).ok()?;
        Self::parse_started_at(&parsed)
    }
}

#[async_trait]
impl EnvironmentOrchestrator for DockerOrchestrator {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Docker
    }

    async fn start_container(
        &self,
        user: &str,
        project: &str,
        project_path: &str,
        slug: Option<&str>,
        overrides: Option<StartOverrides>,
    ) -> Result<String, OrchestratorError> {
        let init = self.ensure_init().await?;
        let container_name = naming::docker_container_name(user, project);
        let hostname = naming::hostname(user, project, slug, &self.domain.app_domain);

        let _ = self.stop_container(user, project).await;

        let host_path = self.host_path(init, project_path);

        let manifest_document =
            std::fs::read_to_string(format!("{host_path}/TESSLATE.md")).unwrap_or_default();
        let manifest = super::manifest::parse(&manifest_document);
        let port = overrides
            .as_ref()
            .and_then(|o| o.port)
            .or(manifest.port)
            .unwrap_or(5173);
        let start_command = overrides
            .and_then(|o| o.start_command)
            .or(manifest.start_command)
            .unwrap_or_else(|| "npm install --silent && npm run dev".to_string());

        let labels = self.traefik_labels(&container_name, &hostname, port, &init.traefik_network);
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.clone(),
            "--network".to_string(),
            init.traefik_network.clone(),
            "--workdir".to_string(),
            "/app".to_string(),
            "-v".to_string(),
            format!("{host_path}:/app"),
        ];
        for label in &labels {
            args.push("--label".to_string());
            args.push(label.clone());
        }
        for (key, value) in [
            ("APP_DOMAIN", self.domain.app_domain.as_str()),
            ("WILDCARD_DOMAIN", self.domain.wildcard_domain.as_str()),
            ("APP_PROTOCOL", self.domain.app_protocol.as_str()),
            (
                "VITE_HMR_PROTOCOL",
                if self.domain.app_protocol == "https" { "wss" } else { "ws" },
            ),
            ("CHOKIDAR_USEPOLLING", "true"),
        ] {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.config.base_image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(background_safe(&start_command));

        let run = Command::new("docker").args(&args).output().await?;
        if !run.status.success() {
            return Err(OrchestratorError::ImageBuildFailed(
                String::from_utf8_lossy(&run.stderr).to_string(),
            ));
        }
        let container_id = String::from_utf8_lossy(&run.stdout).trim().to_string();

        let url = self.access_url(&hostname);
        if !self.wait_for_readiness(&container_name, &url).await {
            // Still recorded: Traefik will route once the container finishes
            // starting even though our probe window elapsed first.
        }

        self.environments.insert(
            Self::key(user, project),
            EnvironmentRecord {
                container_name,
                hostname,
                user: user.to_string(),
                project: project.to_string(),
                container_id,
            },
        );
        self.track_activity(user, project).await;
        Ok(url)
    }

    async fn stop_container(&self, user: &str, project: &str) -> Result<(), OrchestratorError> {
        let container_name = naming::docker_container_name(user, project);
        let output = Command::new("docker")
            .args(["stop", &container_name])
            .output()
            .await?;
        if !output.status.success() {
            tracing::warn!(container_name, "stop_container: container was not running");
        }
        self.environments.remove(&Self::key(user, project));
        Ok(())
    }

    async fn restart_container(
        &self,
        user: &str,
        project: &str,
        project_path: &str,
    ) -> Result<String, OrchestratorError> {
        self.start_container(user, project, project_path, None, None).await
    }

    async fn status(
        &self,
        user: &str,
        project: &str,
        slug: Option<&str>,
    ) -> Result<EnvironmentStatus, OrchestratorError> {
        let container_name = naming::docker_container_name(user, project);
        let output = Command::new("docker")
            .args(["inspect", &container_name])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(EnvironmentStatus {
                state: EnvironmentState::Stopped,
                running: false,
                ..Default::default()
            });
        }
        let parsed: Value = serde_json::from_slice(&output.stdout).unwrap_or_default();
        let running = parsed
            .get(0)
            .and_then(|c| c.pointer("/State/Running"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let started_at = Self::parse_started_at(&parsed);

        let hostname = naming::hostname(user, project, slug, &self.domain.app_domain);
        Ok(EnvironmentStatus {
            state: if running {
                EnvironmentState::Running
            } else {
                EnvironmentState::Stopped
            },
            running,
            url: running.then(|| self.access_url(&hostname)),
            hostname: Some(hostname),
            health: None,
            started_at,
            replicas: None,
            pods: None,
        })
    }

    async fn exec(
        &self,
        user: &str,
        project: &str,
        command: &[String],
        timeout_duration: Duration,
    ) -> Result<String, OrchestratorError> {
        let container_name = naming::docker_container_name(user, project);
        let joined = shell_words::join(command);
        let mut child = Command::new("docker")
            .args(["exec", &container_name, "sh", "-c", &joined])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = timeout(timeout_duration, child.wait_with_output())
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout_duration))??;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            if output.status.code().is_none() {
                return Err(OrchestratorError::Disconnected(container_name));
            }
            return Err(OrchestratorError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            });
        }
        Ok(combined)
    }

    async fn read_file(
        &self,
        user: &str,
        project: &str,
        relative_path: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let sanitized = tesslate_commons::paths::sanitize_relative_path(relative_path);
        match self
            .exec(
                user,
                project,
                &["cat".to_string(), format!("/app/{sanitized}")],
                super::DEFAULT_EXEC_TIMEOUT,
            )
            .await
        {
            Ok(content) => Ok(Some(content)),
            Err(OrchestratorError::NonZeroExit { .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn write_file(
        &self,
        user: &str,
        project: &str,
        relative_path: &str,
        content: &str,
    ) -> Result<bool, OrchestratorError> {
        let sanitized = tesslate_commons::paths::sanitize_relative_path(relative_path);
        let marker = "TESSLATE_EOF_MARKER";
        let heredoc = format!(
            "mkdir -p \"$(dirname /app/{sanitized})\" && cat > /app/{sanitized} <<'{marker}'\n{content}\n{marker}"
        );
        self.exec(
            user,
            project,
            &["sh".to_string(), "-c".to_string(), heredoc],
            super::DEFAULT_EXEC_TIMEOUT,
        )
        .await?;
        Ok(true)
    }

    async fn list_files(
        &self,
        user: &str,
        project: &str,
        relative_path: &str,
    ) -> Result<Vec<GlobEntry>, OrchestratorError> {
        let sanitized = tesslate_commons::paths::sanitize_relative_path(relative_path);
        let output = self
            .exec(
                user,
                project,
                &[
                    "find".to_string(),
                    format!("/app/{sanitized}"),
                    "-maxdepth".to_string(),
                    "1".to_string(),
                    "-printf".to_string(),
                    "%y %p\\n".to_string(),
                ],
                super::DEFAULT_EXEC_TIMEOUT,
            )
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let (kind, path) = line.split_once(' ')?;
                Some(GlobEntry {
                    path: path.to_string(),
                    is_dir: kind == "d",
                })
            })
            .collect())
    }

    async fn glob(
        &self,
        user: &str,
        project: &str,
        pattern: &str,
    ) -> Result<Vec<String>, OrchestratorError> {
        let output = self
            .exec(
                user,
                project,
                &["sh".to_string(), "-c".to_string(), format!("cd /app && ls -1 {pattern}")],
                super::DEFAULT_EXEC_TIMEOUT,
            )
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn grep(
        &self,
        user: &str,
        project: &str,
        pattern: &str,
    ) -> Result<Vec<GrepMatch>, OrchestratorError> {
        let output = self
            .exec(
                user,
                project,
                &[
                    "grep".to_string(),
                    "-rn".to_string(),
                    pattern.to_string(),
                    "/app".to_string(),
                ],
                super::DEFAULT_EXEC_TIMEOUT,
            )
            .await
            .unwrap_or_default();
        Ok(output
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, ':');
                let path = parts.next()?.to_string();
                let line_number = parts.next()?.parse().ok()?;
                let text = parts.next()?.to_string();
                Some(GrepMatch {
                    path,
                    line_number,
                    line: text,
                })
            })
            .collect())
    }

    async fn track_activity(&self, user: &str, project: &str) {
        self.activity.insert(Self::key(user, project), Utc::now());
    }

    async fn cleanup_idle(&self, idle_minutes: u64) -> Vec<String> {
        let threshold = chrono::Duration::minutes(idle_minutes as i64);
        let now = Utc::now();
        let mut reaped = Vec::new();

        // Collect without holding any DashMap shard guard across the
        // `docker inspect` awaits below.
        let candidates: Vec<(String, String, Option<DateTime<Utc>>)> = self
            .environments
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().container_name.clone(), self.activity.get(entry.key()).map(|a| *a)))
            .collect();

        let mut stale_keys = Vec::new();
        for (key, container_name, activity) in candidates {
            let last_activity = match activity {
                Some(a) => a,
                None => self.container_started_at(&container_name).await.unwrap_or(now),
            };
            if now - last_activity > threshold {
                stale_keys.push(key);
            }
        }

        for key in stale_keys {
            if let Some((_, record)) = self.environments.remove(&key) {
                if self.stop_container(&record.user, &record.project).await.is_ok() {
                    reaped.push(key.clone());
                }
                self.activity.remove(&key);
            }
        }
        reaped
    }
}

/// If the command contains `&` without a trailing `wait`, append one so the
/// shell does not exit the moment only background processes remain.
fn background_safe(command: &str) -> String {
    let trimmed = command.trim_end();
    if trimmed.contains('&') && !trimmed.ends_with("wait") {
        format!("{command}; wait")
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_safe_appends_wait_only_when_needed() {
        assert_eq!(background_safe("npm run dev"), "npm run dev");
        assert_eq!(background_safe("npm run dev &"), "npm run dev &; wait");
        assert_eq!(background_safe("npm run dev &; wait"), "npm run dev &; wait");
    }

    #[test]
    fn traefik_labels_include_secure_router_and_cert_resolver() {
        let orchestrator = DockerOrchestrator::new(
            tesslate_config::DockerConfig::default(),
            tesslate_config::DomainConfig::default(),
        );
        let labels = orchestrator.traefik_labels("svc", "svc.tesslate.dev", 5173, "tesslate-network");
        assert!(labels.iter().any(|l| l == "traefik.enable=true"));
        assert!(labels
            .iter()
            .any(|l| l.contains("tls.certresolver=letsencrypt")));
        assert!(labels.iter().any(|l| l.contains("loadbalancer.server.port=5173")));
    }
}
