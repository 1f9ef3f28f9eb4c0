//! Kubernetes back-end (§4.H-K): one Deployment/Service/Ingress triad per
//! environment, all file and exec operations performed inside the pod via
//! the Kubernetes exec API rather than a host filesystem bind mount.

use super::{
    DeploymentKind, EnvironmentOrchestrator, EnvironmentState, EnvironmentStatus, GlobEntry,
    GrepMatch, OrchestratorError, StartOverrides,
};
use crate::naming;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{AttachParams, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

const DEV_SERVER_PORT: i32 = 5173;
const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct EnvironmentRecord {
    deployment_name: String,
    hostname: String,
    user: String,
    project: String,
}

pub struct KubernetesOrchestrator {
    client: Client,
    config: tesslate_config::KubernetesConfig,
    domain: tesslate_config::DomainConfig,
    environments: DashMap<String, EnvironmentRecord>,
    activity: DashMap<String, chrono::DateTime<chrono::Utc>>,
}

impl KubernetesOrchestrator {
    pub fn new(
        client: Client,
        config: tesslate_config::KubernetesConfig,
        domain: tesslate_config::DomainConfig,
    ) -> Self {
        Self {
            client,
            config,
            domain,
            environments: DashMap::new(),
            activity: DashMap::new(),
        }
    }

    fn names(&self, user: &str, project: &str) -> (String, String, String) {
        let base = naming::k8s_resource_name(user, project);
        (base.clone(), format!("{base}-service"), format!("{base}-ingress"))
    }

    fn deployment_manifest(
        &self,
        deployment_name: &str,
        user: &str,
        project: &str,
        command: &str,
    ) -> Deployment {
        let subpath = naming::project_path(user, project);
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": deployment_name,
                "namespace": self.config.namespace,
                "labels": { "app": deployment_name },
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": deployment_name } },
                "template": {
                    "metadata": { "labels": { "app": deployment_name, "dev-environment": "true" } },
                    "spec": {
                        "affinity": {
                            "podAffinity": {
                                "requiredDuringSchedulingIgnoredDuringExecution": [{
                                    "labelSelector": { "matchExpressions": [{
                                        "key": "dev-environment", "operator": "In", "values": ["true"]
                                    }]},
                                    "topologyKey": "kubernetes.io/hostname",
                                }]
                            }
                        },
                        "securityContext": {
                            "runAsNonRoot": true,
                            "runAsUser": 1000,
                            "fsGroup": 1000,
                            "seccompProfile": { "type": "RuntimeDefault" },
                        },
                        "imagePullSecrets": [{ "name": "registry-credentials" }],
                        "containers": [{
                            "name": "devserver",
                            "image": "tesslate-devserver:latest",
                            "command": ["sh", "-c", command],
                            "ports": [{ "containerPort": DEV_SERVER_PORT }],
                            "volumeMounts": [{
                                "name": "projects",
                                "mountPath": "/app",
                                "subPath": subpath,
                            }],
                            "readinessProbe": http_probe(),
                            "startupProbe": http_probe(),
                            "livenessProbe": http_probe(),
                        }],
                        "volumes": [{
                            "name": "projects",
                            "persistentVolumeClaim": { "claimName": self.config.pvc_name },
                        }],
                    }
                }
            }
        });
        serde_json::from_value(manifest).expect("well-formed deployment manifest")
    }

    fn service_manifest(&self, service_name: &str, deployment_name: &str) -> Service {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": service_name, "namespace": self.config.namespace },
            "spec": {
                "type": "ClusterIP",
                "selector": { "app": deployment_name },
                "ports": [{ "port": DEV_SERVER_PORT, "targetPort": DEV_SERVER_PORT }],
            }
        });
        serde_json::from_value(manifest).expect("well-formed service manifest")
    }

    fn ingress_manifest(&self, ingress_name: &str, service_name: &str, hostname: &str) -> Ingress {
        let manifest = json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "name": ingress_name,
                "namespace": self.config.namespace,
                "annotations": {
                    "kubernetes.io/ingress.class": self.config.ingress_class,
                    "nginx.ingress.kubernetes.io/auth-url": format!("{}://{}/api/auth/verify", self.domain.app_protocol, self.domain.app_domain),
                    "nginx.ingress.kubernetes.io/auth-response-headers": "X-Expected-User-ID,X-Original-URI,X-Forwarded-Host,Authorization",
                    "nginx.ingress.kubernetes.io/auth-cache-duration": "5m",
                    "nginx.ingress.kubernetes.io/enable-cors": "true",
                    "nginx.ingress.kubernetes.io/cors-allow-origin": format!("{}://{}", self.domain.app_protocol, self.domain.app_domain),
                    "nginx.ingress.kubernetes.io/websocket-services": service_name,
                    "cert-manager.io/cluster-issuer": "letsencrypt",
                },
            },
            "spec": {
                "tls": [{ "hosts": [hostname], "secretName": "tesslate-wildcard-tls" }],
                "rules": [{
                    "host": hostname,
                    "http": { "paths": [{
                        "path": "/", "pathType": "Prefix",
                        "backend": { "service": { "name": service_name, "port": { "number": DEV_SERVER_PORT } } },
                    }]}
                }]
            }
        });
        serde_json::from_value(manifest).expect("well-formed ingress manifest")
    }

    async fn wait_for_ready(&self, deployment_name: &str) -> bool {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.readiness_timeout_secs);
        while tokio::time::Instant::now() < deadline {
            if let Ok(deployment) = api.get(deployment_name).await {
                let ready = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                let wanted = deployment
                    .spec
                    .as_ref()
                    .and_then(|s| s.replicas)
                    .unwrap_or(1);
                if ready >= wanted {
                    return true;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        false
    }

    async fn find_pod_name(&self, deployment_name: &str) -> Result<String, OrchestratorError> {
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let list = pods
            .list(&kube::api::ListParams::default().labels(&format!("app={deployment_name}")))
            .await
            .map_err(|e| OrchestratorError::Kube(e.to_string()))?;
        list.items
            .first()
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| OrchestratorError::EnvNotRunning {
                user: String::new(),
                project: String::new(),
            })
    }

    /// `is_pod_ready(check_responsive)` (§4.H-K): distinguishes "Ready
    /// condition true" from "actually responsive" with a trivial exec.
    pub async fn is_pod_ready(
        &self,
        deployment_name: &str,
        check_responsive: bool,
    ) -> Result<PodReadiness, OrchestratorError> {
        let pod_name = match self.find_pod_name(deployment_name).await {
            Ok(name) => name,
            Err(_) => {
                return Ok(PodReadiness {
                    ready: false,
                    phase: "Unknown".to_string(),
                    conditions: vec![],
                    responsive: false,
                    message: "no pod found".to_string(),
                    pod_name: None,
                });
            }
        };
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let pod = pods
            .get(&pod_name)
            .await
            .map_err(|e| OrchestratorError::Kube(e.to_string()))?;
        let status = pod.status.unwrap_or_default();
        let phase = status.phase.unwrap_or_else(|| "Unknown".to_string());
        let conditions: Vec<String> = status
            .conditions
            .unwrap_or_default()
            .into_iter()
            .map(|c| format!("{}={}", c.type_, c.status))
            .collect();
        let ready_condition = conditions.iter().any(|c| c == "Ready=True");

        let responsive = if check_responsive && ready_condition {
            self.exec_in_pod(&pod_name, &["echo".to_string(), "ready".to_string()])
                .await
                .is_ok()
        } else {
            false
        };

        Ok(PodReadiness {
            ready: ready_condition,
            phase,
            conditions,
            responsive,
            message: if ready_condition { "ready".to_string() } else { "not ready".to_string() },
            pod_name: Some(pod_name),
        })
    }

    /// Commands whose first element is already `/bin/sh` or `/bin/bash`
    /// pass through untouched; everything else is wrapped in a shell with
    /// `cd /app && <cmd>` (§4.H-K).
    async fn exec_in_pod(&self, pod_name: &str, command: &[String]) -> Result<String, OrchestratorError> {
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let argv: Vec<String> = if matches!(command.first().map(String::as_str), Some("/bin/sh") | Some("/bin/bash")) {
            command.to_vec()
        } else {
            let joined = shell_words::join(command);
            vec!["/bin/sh".to_string(), "-c".to_string(), format!("cd /app && {joined}")]
        };

        let mut attached = pods
            .exec(pod_name, argv, &AttachParams::default().stdout(true).stderr(true))
            .await
            .map_err(|e| OrchestratorError::Kube(e.to_string()))?;

        let mut combined = String::new();
        if let Some(mut stdout) = attached.stdout() {
            let _ = stdout.read_to_string(&mut combined).await;
        }
        if let Some(mut stderr) = attached.stderr() {
            let mut err = String::new();
            let _ = stderr.read_to_string(&mut err).await;
            combined.push_str(&err);
        }
        Ok(combined)
    }

    fn key(user: &str, project: &str) -> String {
        naming::project_key(user, project)
    }

    /// Baseline for a deployment with no recorded activity yet, mirroring
    /// the Docker back-end's use of `StartedAt`: the Deployment's own
    /// creation timestamp, so a freshly started environment isn't reaped
    /// before it has lived through one full idle window.
    async fn deployment_started_at(&self, deployment_name: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let deployment = deployments.get(deployment_name).await.ok()?;
        deployment.metadata.creation_timestamp.map(|t| t.0)
    }
}

#[derive(Debug, Clone)]
pub struct PodReadiness {
    pub ready: bool,
    pub phase: String,
    pub conditions: Vec<String>,
    pub responsive: bool,
    pub message: String,
    pub pod_name: Option<String>,
}

fn http_probe() -> serde_json::Value {
    json!({
        "httpGet": { "path": "/", "port": DEV_SERVER_PORT },
        "initialDelaySeconds": 5,
        "periodSeconds": 10,
    })
}

#[async_trait]
impl EnvironmentOrchestrator for KubernetesOrchestrator {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Kubernetes
    }

    async fn start_container(
        &self,
        user: &str,
        project: &str,
        _project_path: &str,
        slug: Option<&str>,
        overrides: Option<StartOverrides>,
    ) -> Result<String, OrchestratorError> {
        let (deployment_name, service_name, ingress_name) = self.names(user, project);
        let hostname = naming::hostname(user, project, slug, &self.domain.app_domain);
        let command = overrides
            .and_then(|o| o.start_command)
            .unwrap_or_else(|| "npm install --silent && npm run dev".to_string());

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &self.config.namespace);

        let deployment = self.deployment_manifest(&deployment_name, user, project, &command);
        let patch_params = PatchParams::apply("tesslate-orchestrator").force();
        deployments
            .patch(&deployment_name, &patch_params, &Patch::Apply(&deployment))
            .await
            .map_err(|e| OrchestratorError::Kube(e.to_string()))?;

        let service = self.service_manifest(&service_name, &deployment_name);
        services
            .patch(&service_name, &patch_params, &Patch::Apply(&service))
            .await
            .map_err(|e| OrchestratorError::Kube(e.to_string()))?;

        let ingress = self.ingress_manifest(&ingress_name, &service_name, &hostname);
        ingresses
            .patch(&ingress_name, &patch_params, &Patch::Apply(&ingress))
            .await
            .map_err(|e| OrchestratorError::Kube(e.to_string()))?;

        let ready = self.wait_for_ready(&deployment_name).await;
        if !ready {
            tracing::warn!(deployment_name, "deployment did not reach readiness within timeout");
        }

        self.environments.insert(
            Self::key(user, project),
            EnvironmentRecord {
                deployment_name,
                hostname: hostname.clone(),
                user: user.to_string(),
                project: project.to_string(),
            },
        );
        self.track_activity(user, project).await;
        Ok(format!("{}://{hostname}", self.domain.app_protocol))
    }

    async fn stop_container(&self, user: &str, project: &str) -> Result<(), OrchestratorError> {
        let (deployment_name, service_name, ingress_name) = self.names(user, project);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &self.config.namespace);

        let _ = deployments.delete(&deployment_name, &DeleteParams::default()).await;
        let _ = services.delete(&service_name, &DeleteParams::default()).await;
        let _ = ingresses.delete(&ingress_name, &DeleteParams::default()).await;
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
        let (deployment_name, _, _) = self.names(user, project);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let hostname = naming::hostname(user, project, slug, &self.domain.app_domain);
        match deployments.get(&deployment_name).await {
            Ok(deployment) => {
                let ready_replicas = deployment.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
                let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                let running = ready_replicas >= replicas && replicas > 0;
                let pod_name = self.find_pod_name(&deployment_name).await.ok();
                let started_at = deployment.metadata.creation_timestamp.as_ref().map(|t| t.0);
                Ok(EnvironmentStatus {
                    state: if running { EnvironmentState::Running } else { EnvironmentState::Starting },
                    running,
                    url: running.then(|| format!("{}://{hostname}", self.domain.app_protocol)),
                    hostname: Some(hostname),
                    health: None,
                    started_at,
                    replicas: Some(replicas as u32),
                    pods: pod_name.map(|p| vec![p]),
                })
            }
            Err(_) => Ok(EnvironmentStatus {
                state: EnvironmentState::Stopped,
                running: false,
                hostname: Some(hostname),
                ..Default::default()
            }),
        }
    }

    async fn exec(
        &self,
        user: &str,
        project: &str,
        command: &[String],
        timeout_duration: Duration,
    ) -> Result<String, OrchestratorError> {
        let (deployment_name, _, _) = self.names(user, project);
        let pod_name = self.find_pod_name(&deployment_name).await?;
        timeout(timeout_duration, self.exec_in_pod(&pod_name, command))
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout_duration))?
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
            Ok(content) if !content.is_empty() => Ok(Some(content)),
            Ok(_) => Ok(None),
            Err(_) => Ok(None),
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
            &["/bin/sh".to_string(), "-c".to_string(), heredoc],
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
                Some(GlobEntry { path: path.to_string(), is_dir: kind == "d" })
            })
            .collect())
    }

    async fn glob(&self, user: &str, project: &str, pattern: &str) -> Result<Vec<String>, OrchestratorError> {
        let output = self
            .exec(
                user,
                project,
                &["/bin/sh".to_string(), "-c".to_string(), format!("cd /app && ls -1 {pattern}")],
                super::DEFAULT_EXEC_TIMEOUT,
            )
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn grep(&self, user: &str, project: &str, pattern: &str) -> Result<Vec<GrepMatch>, OrchestratorError> {
        let output = self
            .exec(
                user,
                project,
                &["grep".to_string(), "-rn".to_string(), pattern.to_string(), "/app".to_string()],
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
                Some(GrepMatch { path, line_number, line: text })
            })
            .collect())
    }

    async fn track_activity(&self, user: &str, project: &str) {
        self.activity.insert(Self::key(user, project), chrono::Utc::now());
    }

    async fn cleanup_idle(&self, idle_minutes: u64) -> Vec<String> {
        let threshold = chrono::Duration::minutes(idle_minutes as i64);
        let now = chrono::Utc::now();

        // Collect without holding any DashMap shard guard across the
        // deployment-lookup awaits below.
        let candidates: Vec<(String, EnvironmentRecord, Option<chrono::DateTime<chrono::Utc>>)> = self
            .environments
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone(), self.activity.get(entry.key()).map(|a| *a)))
            .collect();

        let mut stale = Vec::new();
        for (key, record, activity) in candidates {
            let last_activity = match activity {
                Some(a) => a,
                None => self.deployment_started_at(&record.deployment_name).await.unwrap_or(now),
            };
            if now - last_activity > threshold {
                stale.push((key, record));
            }
        }

        let mut reaped = Vec::new();
        for (key, record) in stale {
            let _ = self.stop_container(&record.user, &record.project).await;
            self.environments.remove(&key);
            self.activity.remove(&key);
            reaped.push(key);
        }
        reaped
    }
}
