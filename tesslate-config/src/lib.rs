//! Layered configuration for the Tesslate control plane.
//!
//! Three layers, lowest to highest precedence: compiled-in defaults, an
//! optional `tesslate.toml` file, and `TESSLATE_*` environment variables.
//! Mirrors the teacher crate's defaults → file → env loader shape, trimmed
//! to the settings this control plane actually reads (deployment mode,
//! Traefik/domain settings, resource-limiter defaults, shell-session
//! quotas, idle-reap cadence, and the credential encryption secret source).

mod loader;

pub use loader::{ConfigError, load_config, load_config_from_str};

use serde::{Deserialize, Serialize};

/// Deployment back-end selector driving which orchestrator implementation
/// is constructed (§4.H / §9 "Polymorphism over environments").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Docker,
    Kubernetes,
}

impl Default for DeploymentMode {
    fn default() -> Self {
        DeploymentMode::Docker
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Base application domain, e.g. `tesslate.dev`.
    pub app_domain: String,
    /// Wildcard domain used for HMR / allow-hosts lists, e.g. `*.tesslate.dev`.
    pub wildcard_domain: String,
    /// `http` or `https`; drives the HMR protocol derivation (§4.H-D step 4).
    pub app_protocol: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            app_domain: "tesslate.dev".to_string(),
            wildcard_domain: "*.tesslate.dev".to_string(),
            app_protocol: "https".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub base_image: String,
    pub traefik_container_name: String,
    pub traefik_cert_resolver: String,
    pub readiness_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            base_image: "tesslate-devserver:latest".to_string(),
            traefik_container_name: "traefik".to_string(),
            traefik_cert_resolver: "letsencrypt".to_string(),
            readiness_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub pvc_name: String,
    pub ingress_class: String,
    pub readiness_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "tesslate-envs".to_string(),
            pvc_name: "tesslate-projects-pvc".to_string(),
            ingress_class: "nginx".to_string(),
            readiness_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    pub max_cost_cents: i64,
    pub max_iterations: u64,
    pub max_cost_per_run_cents: i64,
    pub max_iterations_per_run: u64,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            max_cost_cents: 2000,
            max_iterations: 1000,
            max_cost_per_run_cents: 500,
            max_iterations_per_run: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellQuotaConfig {
    pub max_sessions_per_user: usize,
    pub max_sessions_per_project: usize,
    pub idle_timeout_secs: u64,
    pub hard_kill_secs: u64,
    pub buffer_cap_bytes: usize,
}

impl Default for ShellQuotaConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 5,
            max_sessions_per_project: 3,
            idle_timeout_secs: 30 * 60,
            hard_kill_secs: 8 * 60 * 60,
            buffer_cap_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleReapConfig {
    pub interval_secs: u64,
    pub idle_threshold_secs: u64,
}

impl Default for IdleReapConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            idle_threshold_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Name of the environment variable holding the process-wide secret
    /// the encryption key is derived from (§4.B).
    pub secret_env_var: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            secret_env_var: "TESSLATE_CREDENTIAL_SECRET".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TesslateConfig {
    pub deployment_mode: DeploymentMode,
    pub domain: DomainConfig,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    pub resource_limits: ResourceLimitsConfig,
    pub shell_quota: ShellQuotaConfig,
    pub idle_reap: IdleReapConfig,
    pub credentials: CredentialConfig,
}
