//! Blob put/get/list over the workspace-snapshot and artifact object store.
//! Treated as an external collaborator (§1): this wraps `object_store`'s
//! S3-compatible client just enough for snapshot persistence and the
//! HealthAggregator's connectivity probe.

use std::sync::Arc;

use common::error::{CoreError, CoreResult};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as _, PutPayload};

#[derive(Clone)]
pub struct ObjectStoreClient {
    inner: Arc<dyn object_store::ObjectStore>,
}

impl ObjectStoreClient {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str, bucket: &str) -> CoreResult<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key)
            .with_bucket_name(bucket)
            .with_allow_http(true)
            .build()
            .map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;
        Ok(Self { inner: Arc::new(store) })
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> CoreResult<()> {
        let path = ObjectPath::from(key);
        self.inner
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        let path = ObjectPath::from(key);
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;
        let bytes = result.bytes().await.map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;
        Ok(bytes.to_vec())
    }

    pub async fn list(&self, prefix: &str) -> CoreResult<Vec<String>> {
        use futures_util::StreamExt;
        let path = ObjectPath::from(prefix);
        let mut stream = self.inner.list(Some(&path));
        let mut keys = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;
            keys.push(meta.location.to_string());
        }
        Ok(keys)
    }

    /// Health probe: list with a throwaway prefix, any response (including
    /// an empty one) means the backend answered.
    pub async fn ping(&self) -> CoreResult<()> {
        self.list("health-check").await.map(|_| ())
    }
}

pub fn workspace_snapshot_key(workspace_id: &str, timestamp: &str) -> String {
    format!("workspaces/{workspace_id}/snapshot-{timestamp}.tar.gz")
}

pub fn artifact_key(session_id: &str, name: &str) -> String {
    format!("artifacts/{session_id}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_snapshot_key_matches_layout() {
        assert_eq!(
            workspace_snapshot_key("w1", "20260101_000000"),
            "workspaces/w1/snapshot-20260101_000000.tar.gz"
        );
    }

    #[test]
    fn artifact_key_matches_layout() {
        assert_eq!(artifact_key("s1", "log.txt"), "artifacts/s1/log.txt");
    }
}
