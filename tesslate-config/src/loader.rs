//! Defaults → `tesslate.toml` → `TESSLATE_*` env layering.

use crate::TesslateConfig;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse config string: {0}")]
    ParseStr(#[from] toml::de::Error),
}

/// Load configuration, applying `path` (if it exists) over the compiled-in
/// defaults, then applying recognized `TESSLATE_*` environment overrides.
pub fn load_config(path: &Path) -> Result<TesslateConfig, ConfigError> {
    let mut config = if path.exists() {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?
    } else {
        tracing::debug!(path = %path.display(), "no tesslate.toml found, using defaults");
        TesslateConfig::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration from an in-memory TOML string (tests, embedded
/// defaults), still applying environment overrides on top.
pub fn load_config_from_str(text: &str) -> Result<TesslateConfig, ConfigError> {
    let mut config: TesslateConfig = toml::from_str(text)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut TesslateConfig) {
    if let Ok(mode) = std::env::var("TESSLATE_DEPLOYMENT_MODE") {
        match mode.to_lowercase().as_str() {
            "docker" => config.deployment_mode = crate::DeploymentMode::Docker,
            "kubernetes" | "k8s" => config.deployment_mode = crate::DeploymentMode::Kubernetes,
            other => tracing::warn!(value = other, "unrecognized TESSLATE_DEPLOYMENT_MODE"),
        }
    }
    if let Ok(domain) = std::env::var("TESSLATE_APP_DOMAIN") {
        config.domain.app_domain = domain;
    }
    if let Ok(wildcard) = std::env::var("TESSLATE_WILDCARD_DOMAIN") {
        config.domain.wildcard_domain = wildcard;
    }
    if let Ok(protocol) = std::env::var("TESSLATE_APP_PROTOCOL") {
        config.domain.app_protocol = protocol;
    }
    if let Ok(namespace) = std::env::var("TESSLATE_K8S_NAMESPACE") {
        config.kubernetes.namespace = namespace;
    }
    if let Ok(secret_var) = std::env::var("TESSLATE_CREDENTIAL_SECRET_ENV_VAR") {
        config.credentials.secret_env_var = secret_var;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeploymentMode;

    #[test]
    fn defaults_when_file_absent() {
        let cfg = load_config(Path::new("/nonexistent/tesslate.toml")).unwrap();
        assert_eq!(cfg.deployment_mode, DeploymentMode::Docker);
        assert_eq!(cfg.domain.app_domain, "tesslate.dev");
    }

    #[test]
    fn file_overrides_defaults() {
        let toml = r#"
            deployment_mode = "kubernetes"

            [domain]
            app_domain = "example.com"
        "#;
        let cfg = load_config_from_str(toml).unwrap();
        assert_eq!(cfg.deployment_mode, DeploymentMode::Kubernetes);
        assert_eq!(cfg.domain.app_domain, "example.com");
        // fields not present in the TOML still pick up struct defaults.
        assert_eq!(cfg.domain.wildcard_domain, "*.tesslate.dev");
    }

    #[test]
    fn env_overrides_file() {
        // SAFETY: test is single-threaded w.r.t. this var via serial env access.
        unsafe {
            std::env::set_var("TESSLATE_APP_DOMAIN", "from-env.example");
        }
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.domain.app_domain, "from-env.example");
        unsafe {
            std::env::remove_var("TESSLATE_APP_DOMAIN");
        }
    }
}
