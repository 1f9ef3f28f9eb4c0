//! PTY broker (§4.F): one interactive shell session per (user, project,
//! session id), backed by either a `docker exec -i` child process or a
//! Kubernetes pod-exec websocket. Both back-ends share the same
//! append-only output buffer and reader-loop primitives from
//! `tesslate-bash-runner` so the session-level invariants (§8 invariant 2)
//! hold regardless of which back-end is in play.

pub mod docker;
pub mod k8s;

use std::time::Duration;
use tesslate_bash_runner::{OutputBuffer, ReaderHandle};
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_BUFFER_CAP_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn pty: {0}")]
    SpawnFailed(String),
    #[error("pty session is closed")]
    Closed,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live interactive session. `writer` forwards bytes to the
/// underlying process/websocket stdin; `reader` owns the background task
/// draining its stdout/stderr into `buffer`.
pub struct PtySession {
    pub id: uuid::Uuid,
    buffer: OutputBuffer,
    reader: ReaderHandle,
    writer: Mutex<Box<dyn PtyWriter>>,
}

#[async_trait::async_trait]
pub trait PtyWriter: Send + Sync {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), PtyError>;
    async fn close(&mut self) -> Result<(), PtyError>;
}

impl PtySession {
    pub fn new(id: uuid::Uuid, buffer: OutputBuffer, reader: ReaderHandle, writer: Box<dyn PtyWriter>) -> Self {
        Self {
            id,
            buffer,
            reader,
            writer: Mutex::new(writer),
        }
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        self.writer.lock().await.write(bytes).await
    }

    /// §6 shell session transport: returns everything appended since the
    /// last read, base64-encoded by the caller at the wire boundary.
    pub fn read(&self) -> (Vec<u8>, bool) {
        self.buffer.read_since_offset()
    }

    pub fn is_eof(&self) -> bool {
        self.buffer.is_eof()
    }

    pub async fn close(&self) -> Result<(), PtyError> {
        self.reader.cancel();
        self.writer.lock().await.close().await
    }
}

/// Back-end-agnostic entry point used by the shell session manager (§4.G).
#[async_trait::async_trait]
pub trait PtyBroker: Send + Sync {
    async fn open(
        &self,
        user: &str,
        project: &str,
        cwd: &str,
        buffer_cap_bytes: usize,
        idle_timeout: Duration,
    ) -> Result<PtySession, PtyError>;
}
