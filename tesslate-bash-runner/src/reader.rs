//! Generic background reader loop shared by the Docker exec-socket and
//! Kubernetes pod-exec-websocket PTY back-ends (§4.F).

use crate::buffer::OutputBuffer;
use std::future::Future;
use std::io;
use tokio::task::JoinHandle;

/// Handle to a spawned reader task. Dropping or calling [`ReaderHandle::cancel`]
/// aborts the task, which the back-ends use to close the underlying socket.
pub struct ReaderHandle {
    join: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn cancel(&self) {
        self.join.abort();
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawn a task that calls `read_chunk` in a loop, appending whatever bytes
/// it returns to `buffer`, until it returns `Ok(None)` (EOF) or an error
/// (treated as EOF, since the underlying stream is assumed unusable past
/// that point). Each successful chunk also invokes `on_activity`, letting
/// callers bump a last-activity timestamp without a second mutex hop.
pub fn spawn_reader<F, Fut, A>(buffer: OutputBuffer, mut read_chunk: F, mut on_activity: A) -> ReaderHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<Option<Vec<u8>>>> + Send,
    A: FnMut() + Send + 'static,
{
    let join = tokio::spawn(async move {
        loop {
            match read_chunk().await {
                Ok(Some(chunk)) if !chunk.is_empty() => {
                    buffer.append(&chunk);
                    on_activity();
                }
                Ok(Some(_)) => {
                    // Zero-length read without an explicit EOF signal; treat
                    // as a transient empty poll, not end of stream.
                    continue;
                }
                Ok(None) => {
                    buffer.mark_eof();
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, "pty reader stream error, marking EOF");
                    buffer.mark_eof();
                    break;
                }
            }
        }
    });
    ReaderHandle { join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn appends_chunks_until_eof() {
        let buffer = OutputBuffer::new(1024);
        let chunks: Vec<io::Result<Option<Vec<u8>>>> =
            vec![Ok(Some(b"foo".to_vec())), Ok(Some(b"bar".to_vec())), Ok(None)];
        let idx = Arc::new(AtomicUsize::new(0));
        let chunks = Arc::new(chunks);
        let activity_count = Arc::new(AtomicUsize::new(0));
        let activity_count_clone = activity_count.clone();

        let handle = spawn_reader(
            buffer.clone(),
            move || {
                let i = idx.fetch_add(1, Ordering::SeqCst);
                let chunks = chunks.clone();
                async move {
                    match chunks.get(i) {
                        Some(Ok(Some(c))) => Ok(Some(c.clone())),
                        Some(Ok(None)) | None => Ok(None),
                        Some(Err(_)) => Ok(None),
                    }
                }
            },
            move || {
                activity_count_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.join().await;

        let (bytes, eof) = buffer.read_since_offset();
        assert_eq!(bytes, b"foobar");
        assert!(eof);
        assert_eq!(activity_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_stops_the_task() {
        let buffer = OutputBuffer::new(1024);
        let handle = spawn_reader(
            buffer.clone(),
            || async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(Some(b"never".to_vec()))
            },
            || {},
        );
        handle.cancel();
        // Aborting is best-effort async; just assert it doesn't hang the test.
    }
}
