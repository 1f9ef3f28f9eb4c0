//! Docker PTY back-end: `docker exec -i <container> sh`, piping stdin for
//! writes and feeding combined stdout+stderr through the shared reader
//! loop.

use super::{PtyBroker, PtyError, PtySession, PtyWriter};
use crate::naming;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tesslate_bash_runner::{OutputBuffer, spawn_reader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex as AsyncMutex;

pub struct DockerPtyBroker;

impl DockerPtyBroker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DockerPtyBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct DockerPtyWriter {
    stdin: ChildStdin,
    child: Option<Child>,
}

#[async_trait]
impl PtyWriter for DockerPtyWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), PtyError> {
        self.stdin
            .write_all(bytes)
            .await
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), PtyError> {
        let _ = self.stdin.shutdown().await;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        Ok(())
    }
}

#[async_trait]
impl PtyBroker for DockerPtyBroker {
    async fn open(
        &self,
        user: &str,
        project: &str,
        cwd: &str,
        buffer_cap_bytes: usize,
        _idle_timeout: Duration,
    ) -> Result<PtySession, PtyError> {
        let container_name = naming::docker_container_name(user, project);
        let mut child = tokio::process::Command::new("docker")
            .args(["exec", "-i", "-w", cwd, &container_name, "sh"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| PtyError::SpawnFailed("no stdin".into()))?;
        let stdout = Arc::new(AsyncMutex::new(
            child.stdout.take().ok_or_else(|| PtyError::SpawnFailed("no stdout".into()))?,
        ));
        let stderr = Arc::new(AsyncMutex::new(
            child.stderr.take().ok_or_else(|| PtyError::SpawnFailed("no stderr".into()))?,
        ));

        let buffer = OutputBuffer::new(buffer_cap_bytes);
        let buffer_for_reader = buffer.clone();
        let reader = spawn_reader(
            buffer_for_reader,
            move || {
                let stdout = stdout.clone();
                let stderr = stderr.clone();
                async move {
                    let mut chunk = vec![0u8; 4096];
                    let read = stdout.lock().await.read(&mut chunk).await?;
                    if read == 0 {
                        // Drain any trailing stderr before signalling EOF.
                        let mut err_chunk = vec![0u8; 4096];
                        let err_read = stderr.lock().await.read(&mut err_chunk).await.unwrap_or(0);
                        if err_read > 0 {
                            return Ok(Some(err_chunk[..err_read].to_vec()));
                        }
                        return Ok(None);
                    }
                    Ok(Some(chunk[..read].to_vec()))
                }
            },
            || {},
        );

        let writer = Box::new(DockerPtyWriter { stdin, child: Some(child) });
        Ok(PtySession::new(uuid::Uuid::new_v4(), buffer, reader, writer))
    }
}
