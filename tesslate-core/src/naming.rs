//! Resource-name derivation (§4.A): pure functions of `(user, project)` that
//! eliminate implicit naming conventions everywhere else in the crate. No
//! I/O here — every other component calls into this module rather than
//! formatting its own strings.

use crate::orchestrator::DeploymentKind;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("malformed container name: {0}")]
    MalformedContainerName(String),
}

/// Project filesystem path relative to the shared project storage root:
/// `users/<user>/<project>`.
pub fn project_path(user: &str, project: &str) -> String {
    format!("users/{user}/{project}")
}

/// Docker container name: `tesslate-dev-<user>-<project>`.
pub fn docker_container_name(user: &str, project: &str) -> String {
    format!("tesslate-dev-{user}-{project}")
}

/// Kubernetes resource name base: `dev-<user>-<project>` (already
/// DNS-1123-compliant as long as `user`/`project` are, which callers
/// guarantee since both are UUIDs or UUID-derived slugs).
pub fn k8s_resource_name(user: &str, project: &str) -> String {
    format!("dev-{user}-{project}")
}

pub fn container_name(mode: DeploymentKind, user: &str, project: &str) -> String {
    match mode {
        DeploymentKind::Docker => docker_container_name(user, project),
        DeploymentKind::Kubernetes => k8s_resource_name(user, project),
    }
}

/// Public hostname for an environment. Uses the project slug when supplied,
/// otherwise falls back to `<user>-<project>`.
pub fn hostname(user: &str, project: &str, slug: Option<&str>, app_domain: &str) -> String {
    match slug {
        Some(slug) if !slug.is_empty() => format!("{slug}.{app_domain}"),
        _ => format!("{user}-{project}.{app_domain}"),
    }
}

/// Inverse of [`container_name`]: recover `(user, project)` from a
/// container/pod name, raising on malformed input (§8 invariant 3).
pub fn parse_container_name(
    mode: DeploymentKind,
    name: &str,
) -> Result<(String, String), NamingError> {
    let prefix = match mode {
        DeploymentKind::Docker => "tesslate-dev-",
        DeploymentKind::Kubernetes => "dev-",
    };
    let rest = name
        .strip_prefix(prefix)
        .ok_or_else(|| NamingError::MalformedContainerName(name.to_string()))?;
    // user and project are themselves hyphen-free opaque identifiers
    // (UUIDs), so splitting on the first remaining hyphen recovers both.
    let mut parts = rest.splitn(2, '-');
    let user = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| NamingError::MalformedContainerName(name.to_string()))?;
    let project = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| NamingError::MalformedContainerName(name.to_string()))?;
    Ok((user.to_string(), project.to_string()))
}

/// The internal project-key used as a local map key (see GLOSSARY).
pub fn project_key(user: &str, project: &str) -> String {
    format!("user-{user}-project-{project}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_path_format() {
        assert_eq!(project_path("u1", "p1"), "users/u1/p1");
    }

    #[test]
    fn docker_and_k8s_names_differ_by_prefix() {
        assert_eq!(docker_container_name("u1", "p1"), "tesslate-dev-u1-p1");
        assert_eq!(k8s_resource_name("u1", "p1"), "dev-u1-p1");
    }

    #[test]
    fn hostname_prefers_slug() {
        assert_eq!(
            hostname("u1", "p1", Some("my-app"), "tesslate.dev"),
            "my-app.tesslate.dev"
        );
        assert_eq!(
            hostname("u1", "p1", None, "tesslate.dev"),
            "u1-p1.tesslate.dev"
        );
    }

    #[test]
    fn round_trips_for_every_mode() {
        for mode in [DeploymentKind::Docker, DeploymentKind::Kubernetes] {
            let name = container_name(mode, "user123", "project456");
            let (u, p) = parse_container_name(mode, &name).unwrap();
            assert_eq!(u, "user123");
            assert_eq!(p, "project456");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(parse_container_name(DeploymentKind::Docker, "not-a-match").is_err());
        assert!(parse_container_name(DeploymentKind::Kubernetes, "tesslate-dev-u-p").is_err());
    }
}
