//! Kubernetes PTY back-end: an interactive pod-exec session (`tty: true`)
//! over the Kubernetes API server's websocket upgrade.

use super::{PtyBroker, PtyError, PtySession, PtyWriter};
use crate::naming;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, ListParams};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tesslate_bash_runner::{OutputBuffer, spawn_reader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

pub struct KubernetesPtyBroker {
    client: Client,
    namespace: String,
}

impl KubernetesPtyBroker {
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }

    async fn find_pod_name(&self, deployment_name: &str) -> Result<String, PtyError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("app={deployment_name}")))
            .await
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        list.items
            .first()
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| PtyError::SpawnFailed("no pod found for deployment".to_string()))
    }
}

struct KubernetesPtyWriter {
    stdin: Box<dyn tokio::io::AsyncWrite + Send + Sync + Unpin>,
}

#[async_trait]
impl PtyWriter for KubernetesPtyWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), PtyError> {
        self.stdin
            .write_all(bytes)
            .await
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), PtyError> {
        let _ = self.stdin.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl PtyBroker for KubernetesPtyBroker {
    async fn open(
        &self,
        user: &str,
        project: &str,
        cwd: &str,
        buffer_cap_bytes: usize,
        _idle_timeout: Duration,
    ) -> Result<PtySession, PtyError> {
        let deployment_name = naming::k8s_resource_name(user, project);
        let pod_name = self.find_pod_name(&deployment_name).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        let mut attached = pods
            .exec(
                &pod_name,
                vec!["/bin/sh".to_string(), "-c".to_string(), format!("cd {cwd} && sh")],
                &AttachParams::default().stdin(true).stdout(true).stderr(true).tty(true),
            )
            .await
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let stdin = attached.stdin().ok_or_else(|| PtyError::SpawnFailed("no stdin stream".into()))?;
        let stdout = attached.stdout().ok_or_else(|| PtyError::SpawnFailed("no stdout stream".into()))?;
        let stdout = Arc::new(AsyncMutex::new(stdout));

        let buffer = OutputBuffer::new(buffer_cap_bytes);
        let buffer_for_reader = buffer.clone();
        let reader = spawn_reader(
            buffer_for_reader,
            move || {
                let stdout = stdout.clone();
                async move {
                    let mut chunk = vec![0u8; 4096];
                    let read = stdout.lock().await.read(&mut chunk).await?;
                    if read == 0 {
                        return Ok(None);
                    }
                    Ok(Some(chunk[..read].to_vec()))
                }
            },
            || {},
        );

        let writer = Box::new(KubernetesPtyWriter { stdin: Box::new(stdin) });
        Ok(PtySession::new(uuid::Uuid::new_v4(), buffer, reader, writer))
    }
}
