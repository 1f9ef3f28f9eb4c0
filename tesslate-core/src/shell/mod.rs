//! Shell session manager (§4.G): owns every live [`PtySession`], enforces
//! per-user/per-project quotas, and reaps sessions that have been idle too
//! long or have run past a hard wall-clock limit regardless of activity.

use crate::pty::{PtyBroker, PtyError, PtySession};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("too many sessions for user {user}: {existing:?}")]
    TooManyUserSessions { user: String, existing: Vec<Uuid> },
    #[error("too many sessions for project {project}: {existing:?}")]
    TooManyProjectSessions { project: String, existing: Vec<Uuid> },
    #[error("no such session: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

#[derive(Debug, Clone)]
pub struct ShellSessionRecord {
    pub id: Uuid,
    pub user: String,
    pub project: String,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

struct Entry {
    record: ShellSessionRecord,
    session: Arc<PtySession>,
}

pub struct ShellSessionManager {
    broker: Arc<dyn PtyBroker>,
    sessions: DashMap<Uuid, Entry>,
    max_sessions_per_user: usize,
    max_sessions_per_project: usize,
    buffer_cap_bytes: usize,
    idle_timeout: Duration,
    hard_kill: Duration,
}

impl ShellSessionManager {
    pub fn new(broker: Arc<dyn PtyBroker>, config: tesslate_config::ShellQuotaConfig) -> Self {
        Self {
            broker,
            sessions: DashMap::new(),
            max_sessions_per_user: config.max_sessions_per_user,
            max_sessions_per_project: config.max_sessions_per_project,
            buffer_cap_bytes: config.buffer_cap_bytes,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            hard_kill: Duration::from_secs(config.hard_kill_secs),
        }
    }

    fn sessions_for_user(&self, user: &str) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|e| e.value().record.user == user)
            .map(|e| *e.key())
            .collect()
    }

    fn sessions_for_project(&self, project: &str) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|e| e.value().record.project == project)
            .map(|e| *e.key())
            .collect()
    }

    pub async fn open(&self, user: &str, project: &str, cwd: &str) -> Result<Uuid, ShellError> {
        let existing_for_user = self.sessions_for_user(user);
        if existing_for_user.len() >= self.max_sessions_per_user {
            return Err(ShellError::TooManyUserSessions {
                user: user.to_string(),
                existing: existing_for_user,
            });
        }
        let existing_for_project = self.sessions_for_project(project);
        if existing_for_project.len() >= self.max_sessions_per_project {
            return Err(ShellError::TooManyProjectSessions {
                project: project.to_string(),
                existing: existing_for_project,
            });
        }

        let session = self
            .broker
            .open(user, project, cwd, self.buffer_cap_bytes, self.idle_timeout)
            .await?;
        let id = session.id;
        let now = Utc::now();
        self.sessions.insert(
            id,
            Entry {
                record: ShellSessionRecord {
                    id,
                    user: user.to_string(),
                    project: project.to_string(),
                    cwd: cwd.to_string(),
                    created_at: now,
                    last_activity: now,
                },
                session: Arc::new(session),
            },
        );
        Ok(id)
    }

    pub async fn write(&self, id: Uuid, bytes: &[u8]) -> Result<(), ShellError> {
        let mut entry = self.sessions.get_mut(&id).ok_or(ShellError::NotFound(id))?;
        entry.session.write(bytes).await?;
        entry.record.last_activity = Utc::now();
        Ok(())
    }

    pub fn read(&self, id: Uuid) -> Result<(Vec<u8>, bool), ShellError> {
        let entry = self.sessions.get(&id).ok_or(ShellError::NotFound(id))?;
        Ok(entry.session.read())
    }

    pub async fn close(&self, id: Uuid) -> Result<(), ShellError> {
        if let Some((_, entry)) = self.sessions.remove(&id) {
            entry.session.close().await?;
        }
        Ok(())
    }

    pub fn record(&self, id: Uuid) -> Option<ShellSessionRecord> {
        self.sessions.get(&id).map(|e| e.record.clone())
    }

    pub fn list_for_user(&self, user: &str) -> Vec<ShellSessionRecord> {
        self.sessions
            .iter()
            .filter(|e| e.value().record.user == user)
            .map(|e| e.value().record.clone())
            .collect()
    }

    /// Flush batched activity timestamps (§5, every 5 s in production).
    /// Idle sessions older than the quota's idle timeout, or sessions that
    /// have lived past the hard-kill wall clock limit regardless of
    /// activity, are closed.
    pub async fn reap(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter_map(|e| {
                let record = &e.value().record;
                let idle = now.signed_duration_since(record.last_activity);
                let age = now.signed_duration_since(record.created_at);
                let idle_expired = idle > chrono::Duration::from_std(self.idle_timeout).unwrap_or_default();
                let hard_expired = age > chrono::Duration::from_std(self.hard_kill).unwrap_or_default();
                (idle_expired || hard_expired).then_some(*e.key())
            })
            .collect();

        for id in &stale {
            let _ = self.close(*id).await;
        }
        stale
    }
}
