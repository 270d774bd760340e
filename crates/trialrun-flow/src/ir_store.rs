//! Durable storage for suite IR.
//!
//! IR is written once per run to `runs/{runId}/suite` with a create-only
//! precondition. Repeating a write with identical content is harmless;
//! writing different content for the same run is a caller error.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use trialrun_core::{RunId, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::paths;

/// Content type recorded for IR blobs.
pub const IR_CONTENT_TYPE: &str = "application/json";

/// Persists and reads suite IR.
#[async_trait]
pub trait IrStore: Send + Sync {
    /// Persists `ir` for `run_id` and returns its storage key.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for empty IR, or different IR already stored for the run
    /// - [`Error::StorageRejected`] when the payload exceeds the size limit
    /// - [`Error::StorageUnavailable`] on transient storage failure
    async fn put(&self, run_id: &RunId, ir: Bytes) -> Result<String>;

    /// Reads the IR stored under `storage_key`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if nothing is stored under the key
    /// - [`Error::StorageUnavailable`] on transient storage failure
    async fn get(&self, storage_key: &str) -> Result<Bytes>;
}

/// [`IrStore`] over a blob [`StorageBackend`].
#[derive(Clone)]
pub struct BlobIrStore {
    backend: Arc<dyn StorageBackend>,
    container: String,
    max_bytes: usize,
}

impl std::fmt::Debug for BlobIrStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobIrStore")
            .field("container", &self.container)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl BlobIrStore {
    /// Creates an IR store writing into `container`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        container: impl Into<String>,
        max_bytes: usize,
    ) -> Self {
        Self {
            backend,
            container: container.into(),
            max_bytes,
        }
    }

    /// Returns the container IR is written into.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }
}

#[async_trait]
impl IrStore for BlobIrStore {
    #[tracing::instrument(skip(self, ir), fields(run_id = %run_id, size = ir.len()))]
    async fn put(&self, run_id: &RunId, ir: Bytes) -> Result<String> {
        if ir.is_empty() {
            return Err(Error::validation("IR payload is empty"));
        }
        if ir.len() > self.max_bytes {
            return Err(Error::StorageRejected {
                message: format!(
                    "IR payload of {} bytes exceeds limit of {} bytes",
                    ir.len(),
                    self.max_bytes
                ),
            });
        }

        let key = paths::ir_key(run_id);
        let expected = digest(&ir);
        let result = self
            .backend
            .upload(
                &self.container,
                &key,
                ir,
                IR_CONTENT_TYPE,
                WritePrecondition::DoesNotExist,
            )
            .await?;

        match result {
            WriteResult::Success { version } => {
                tracing::debug!(key = %key, version = %version, "persisted IR");
                Ok(key)
            }
            WriteResult::PreconditionFailed { .. } => {
                let existing = self.backend.get(&self.container, &key).await?;
                if digest(&existing) == expected {
                    tracing::debug!(key = %key, "IR already persisted with identical content");
                    Ok(key)
                } else {
                    Err(Error::validation(format!(
                        "run {run_id} already has different IR at {key}"
                    )))
                }
            }
        }
    }

    async fn get(&self, storage_key: &str) -> Result<Bytes> {
        match self.backend.get(&self.container, storage_key).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_not_found() => Err(Error::validation(format!(
                "no IR stored at {storage_key}"
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use trialrun_core::MemoryBackend;

    fn store(max_bytes: usize) -> (MemoryBackend, BlobIrStore) {
        let backend = MemoryBackend::new();
        let ir_store = BlobIrStore::new(Arc::new(backend.clone()), "trialrun-ir", max_bytes);
        (backend, ir_store)
    }

    #[tokio::test]
    async fn put_writes_json_blob_at_run_key() {
        let (backend, ir_store) = store(1024);
        let run_id = RunId::generate();

        let key = ir_store
            .put(&run_id, Bytes::from_static(b"{\"steps\":[]}"))
            .await
            .unwrap();
        assert_eq!(key, format!("runs/{run_id}/suite"));

        let meta = backend.head("trialrun-ir", &key).await.unwrap().unwrap();
        assert_eq!(meta.content_type.as_deref(), Some(IR_CONTENT_TYPE));
        assert_eq!(ir_store.get(&key).await.unwrap(), Bytes::from_static(b"{\"steps\":[]}"));
    }

    #[tokio::test]
    async fn identical_rewrite_is_idempotent() {
        let (_, ir_store) = store(1024);
        let run_id = RunId::generate();
        let first = ir_store.put(&run_id, Bytes::from("{}")).await.unwrap();
        let second = ir_store.put(&run_id, Bytes::from("{}")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn different_content_is_validation_error() {
        let (_, ir_store) = store(1024);
        let run_id = RunId::generate();
        ir_store.put(&run_id, Bytes::from("{\"a\":1}")).await.unwrap();
        let err = ir_store
            .put(&run_id, Bytes::from("{\"a\":2}"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (backend, ir_store) = store(4);
        let err = ir_store
            .put(&RunId::generate(), Bytes::from("{\"big\":true}"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageRejected);
        assert!(!err.is_retryable());
        assert_eq!(backend.object_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_payload_is_validation_error() {
        let (_, ir_store) = store(1024);
        let err = ir_store.put(&RunId::generate(), Bytes::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn missing_key_is_validation_error() {
        let (_, ir_store) = store(1024);
        let err = ir_store.get("runs/missing/suite").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
