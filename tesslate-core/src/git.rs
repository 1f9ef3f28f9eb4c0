//! Git manager (§4.I): every operation shells out to `git` inside the
//! target environment via the orchestrator's `exec`, scoped to one
//! (user, project) and always `cd`-ed to `/app`.

use crate::orchestrator::{EnvironmentOrchestrator, OrchestratorError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const LONG_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("invalid remote url: {0}")]
    InvalidRemoteUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Clean,
    Modified,
    Ahead,
    Behind,
    Diverged,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub staged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Deleted,
    Untracked,
    Modified,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastCommit {
    pub sha: String,
    pub author_name: String,
    pub author_email: String,
    pub subject: String,
    pub committed_at_unix: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitStatus {
    pub branch: String,
    pub status: StatusKind,
    pub changes: Vec<FileChange>,
    pub changes_count: usize,
    pub ahead: u32,
    pub behind: u32,
    pub last_commit: Option<LastCommit>,
}

#[derive(Debug, Clone)]
pub struct PullResult {
    pub success: bool,
    pub conflicts: Vec<String>,
}

static SSH_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^git@github\.com:(?P<path>.+)$").expect("valid regex")
});

/// Scoped to exactly one (user, project); construct a new instance per
/// target rather than threading `(user, project)` through every call.
pub struct GitManager {
    orchestrator: Arc<dyn EnvironmentOrchestrator>,
    user: String,
    project: String,
}

impl GitManager {
    pub fn new(orchestrator: Arc<dyn EnvironmentOrchestrator>, user: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            orchestrator,
            user: user.into(),
            project: project.into(),
        }
    }

    async fn exec(&self, args: &[&str], timeout: Duration) -> Result<String, GitError> {
        let command: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Ok(self
            .orchestrator
            .exec(&self.user, &self.project, &command, timeout)
            .await?)
    }

    pub async fn initialize_repository(&self, remote: Option<&str>, default_branch: &str) -> Result<(), GitError> {
        self.exec(&["git", "init", "-b", default_branch], DEFAULT_TIMEOUT).await?;
        self.exec(&["git", "config", "user.name", "Tesslate Agent"], DEFAULT_TIMEOUT).await?;
        self.exec(
            &["git", "config", "user.email", "agent@tesslate.dev"],
            DEFAULT_TIMEOUT,
        )
        .await?;
        if let Some(remote) = remote {
            self.exec(&["git", "remote", "add", "origin", remote], DEFAULT_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Token is injected by rewriting the URL to `https://<token>@github.com/…`
    /// (converting SSH `git@github.com:` URLs to HTTPS first). `direct_to_fs`
    /// is a Docker-mode-only optimization handled by the caller choosing a
    /// host-backed orchestrator rather than by this method.
    pub async fn clone_repository(
        &self,
        url: &str,
        branch: Option<&str>,
        token: Option<&str>,
    ) -> Result<(), GitError> {
        let url = normalize_remote_url(url, token)?;
        let mut args = vec!["git", "clone"];
        if let Some(branch) = branch {
            args.push("--branch");
            args.push(branch);
        }
        args.push(&url);
        args.push("/tmp/git-clone");
        self.exec(&args, LONG_TIMEOUT).await?;
        self.exec(
            &["sh", "-c", "cp -a /tmp/git-clone/. /app/ && rm -rf /tmp/git-clone"],
            LONG_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn get_status(&self) -> Result<GitStatus, GitError> {
        let branch = self
            .exec(&["git", "branch", "--show-current"], DEFAULT_TIMEOUT)
            .await?
            .trim()
            .to_string();
        let porcelain = self.exec(&["git", "status", "--porcelain"], DEFAULT_TIMEOUT).await?;
        let changes = parse_porcelain(&porcelain);

        let (ahead, behind) = self
            .exec(
                &[
                    "git",
                    "rev-list",
                    "--left-right",
                    "--count",
                    &format!("origin/{branch}...HEAD"),
                ],
                DEFAULT_TIMEOUT,
            )
            .await
            .ok()
            .and_then(|out| {
                let mut parts = out.split_whitespace();
                let behind: u32 = parts.next()?.parse().ok()?;
                let ahead: u32 = parts.next()?.parse().ok()?;
                Some((ahead, behind))
            })
            .unwrap_or((0, 0));

        let last_commit = self
            .exec(
                &["git", "log", "-1", "--pretty=format:%H|%an|%ae|%s|%ct"],
                DEFAULT_TIMEOUT,
            )
            .await
            .ok()
            .and_then(|line| parse_last_commit(&line));

        let status = if !changes.is_empty() {
            StatusKind::Modified
        } else if ahead > 0 && behind > 0 {
            StatusKind::Diverged
        } else if ahead > 0 {
            StatusKind::Ahead
        } else if behind > 0 {
            StatusKind::Behind
        } else {
            StatusKind::Clean
        };

        Ok(GitStatus {
            branch,
            status,
            changes_count: changes.len(),
            changes,
            ahead,
            behind,
            last_commit,
        })
    }

    pub async fn commit(&self, message: &str, files: Option<&[String]>) -> Result<String, GitError> {
        match files {
            Some(files) if !files.is_empty() => {
                let mut args = vec!["git".to_string(), "add".to_string()];
                args.extend(files.iter().cloned());
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.exec(&arg_refs, DEFAULT_TIMEOUT).await?;
            }
            _ => {
                self.exec(&["git", "add", "."], DEFAULT_TIMEOUT).await?;
            }
        }
        self.exec(&["git", "commit", "-m", message], DEFAULT_TIMEOUT).await?;
        let sha = self.exec(&["git", "rev-parse", "HEAD"], DEFAULT_TIMEOUT).await?;
        Ok(sha.trim().to_string())
    }

    pub async fn push(&self, branch: Option<&str>, remote: &str, force: bool) -> Result<(), GitError> {
        let mut args = vec!["git", "push", remote];
        if force {
            args.push("--force");
        }
        if let Some(branch) = branch {
            args.push(branch);
        }
        self.exec(&args, LONG_TIMEOUT).await?;
        Ok(())
    }

    pub async fn pull(&self, branch: Option<&str>, remote: &str) -> Result<PullResult, GitError> {
        self.exec(&["git", "fetch", remote], LONG_TIMEOUT).await?;
        let mut pull_args = vec!["git", "pull", remote];
        if let Some(branch) = branch {
            pull_args.push(branch);
        }
        match self.exec(&pull_args, LONG_TIMEOUT).await {
            Ok(_) => Ok(PullResult { success: true, conflicts: vec![] }),
            Err(GitError::Orchestrator(OrchestratorError::NonZeroExit { .. })) => {
                let porcelain = self.exec(&["git", "status", "--porcelain"], DEFAULT_TIMEOUT).await?;
                let conflicts: Vec<String> = porcelain
                    .lines()
                    .filter(|l| {
                        l.starts_with("UU") || l.starts_with("AA") || l.starts_with("DD")
                    })
                    .map(|l| l[3..].to_string())
                    .collect();
                if conflicts.is_empty() {
                    Err(GitError::Orchestrator(OrchestratorError::NonZeroExit {
                        code: 1,
                        output: porcelain,
                    }))
                } else {
                    Ok(PullResult { success: false, conflicts })
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    pub async fn get_commit_history(&self, limit: u32, branch: Option<&str>) -> Result<Vec<LastCommit>, GitError> {
        let limit_arg = format!("-{limit}");
        let mut args = vec!["git", "log", &limit_arg, "--pretty=format:%H|%an|%ae|%s|%ct"];
        if let Some(branch) = branch {
            args.push(branch);
        }
        let output = self.exec(&args, DEFAULT_TIMEOUT).await?;
        Ok(output.lines().filter_map(parse_last_commit).collect())
    }

    pub async fn list_branches(&self) -> Result<Vec<String>, GitError> {
        let output = self.exec(&["git", "branch", "--format=%(refname:short)"], DEFAULT_TIMEOUT).await?;
        Ok(output.lines().map(str::trim).map(str::to_string).collect())
    }

    pub async fn create_branch(&self, name: &str, checkout: bool) -> Result<(), GitError> {
        if checkout {
            self.exec(&["git", "checkout", "-b", name], DEFAULT_TIMEOUT).await?;
        } else {
            self.exec(&["git", "branch", name], DEFAULT_TIMEOUT).await?;
        }
        Ok(())
    }

    pub async fn switch_branch(&self, name: &str) -> Result<(), GitError> {
        self.exec(&["git", "checkout", name], DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    pub async fn get_diff(&self, file: Option<&str>, staged: bool) -> Result<String, GitError> {
        let mut args = vec!["git", "diff"];
        if staged {
            args.push("--staged");
        }
        if let Some(file) = file {
            args.push("--");
            args.push(file);
        }
        self.exec(&args, DEFAULT_TIMEOUT).await
    }
}

fn normalize_remote_url(url: &str, token: Option<&str>) -> Result<String, GitError> {
    let https_url = if let Some(caps) = SSH_URL_RE.captures(url) {
        format!("https://github.com/{}", &caps["path"])
    } else {
        url.to_string()
    };
    match token {
        Some(token) => {
            let without_scheme = https_url
                .strip_prefix("https://")
                .ok_or_else(|| GitError::InvalidRemoteUrl(url.to_string()))?;
            Ok(format!("https://{token}@{without_scheme}"))
        }
        None => Ok(https_url),
    }
}

fn parse_porcelain(porcelain: &str) -> Vec<FileChange> {
    porcelain
        .lines()
        .filter(|l| l.len() > 3)
        .map(|line| {
            let status = &line[0..2];
            let path = line[3..].to_string();
            let bytes = status.as_bytes();
            let kind = if status.starts_with("??") {
                ChangeKind::Untracked
            } else if bytes[0] == b'A' || bytes[1] == b'A' {
                ChangeKind::Added
            } else if bytes[0] == b'D' || bytes[1] == b'D' {
                ChangeKind::Deleted
            } else {
                ChangeKind::Modified
            };
            let staged = status.as_bytes()[0] != b' ' && status.as_bytes()[0] != b'?';
            FileChange { path, kind, staged }
        })
        .collect()
}

fn parse_last_commit(line: &str) -> Option<LastCommit> {
    let mut parts = line.splitn(5, '|');
    Some(LastCommit {
        sha: parts.next()?.to_string(),
        author_name: parts.next()?.to_string(),
        author_email: parts.next()?.to_string(),
        subject: parts.next()?.to_string(),
        committed_at_unix: parts.next()?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ssh_url_to_https_with_token() {
        let url = normalize_remote_url("git@github.com:tesslate/studio.git", Some("tok123")).unwrap();
        assert_eq!(url, "https://tok123@github.com/tesslate/studio.git");
    }

    #[test]
    fn leaves_https_url_untouched_without_token() {
        let url = normalize_remote_url("https://github.com/tesslate/studio.git", None).unwrap();
        assert_eq!(url, "https://github.com/tesslate/studio.git");
    }

    #[test]
    fn parses_porcelain_status_codes() {
        let porcelain = " M modified.txt\n?? new.txt\nA  added.txt\n D deleted.txt\n";
        let changes = parse_porcelain(porcelain);
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[1].kind, ChangeKind::Untracked);
        assert_eq!(changes[2].kind, ChangeKind::Added);
        assert_eq!(changes[3].kind, ChangeKind::Deleted);
    }

    #[test]
    fn parses_last_commit_line() {
        let commit = parse_last_commit("abc123|Jane Doe|jane@example.com|fix bug|1700000000").unwrap();
        assert_eq!(commit.sha, "abc123");
        assert_eq!(commit.committed_at_unix, 1700000000);
    }
}
