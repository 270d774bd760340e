//! Test storage implementations with operation tracing.
//!
//! Provides in-memory blob storage that records all operations for test
//! assertions and can fail or slow down on demand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use trialrun_core::error::{Error, Result};
use trialrun_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Container that was read.
        container: String,
        /// Key that was read.
        key: String,
    },
    /// Head operation (metadata only).
    Head {
        /// Container that was checked.
        container: String,
        /// Key that was checked.
        key: String,
    },
    /// Upload operation.
    Upload {
        /// Container that was written.
        container: String,
        /// Key that was written.
        key: String,
        /// Size of data written.
        size: usize,
        /// Content type recorded.
        content_type: String,
        /// Precondition used.
        precondition: WritePrecondition,
    },
}

/// In-memory storage backend with operation tracing.
///
/// Records all operations for later assertion in tests. Operations on keys
/// matching an injected failure prefix fail with a storage error before
/// touching the data.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage with simulated latency.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns the recorded uploads.
    #[must_use]
    pub fn uploads(&self) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(|op| matches!(op, StorageOp::Upload { .. }))
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Injects a failure for keys starting with `prefix` (`""` fails everything).
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().expect("lock").clear();
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.object_count().expect("lock")
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, container: &str, key: &str) -> Result<()> {
        let fail_prefixes = self.fail_prefixes.lock().expect("lock");
        if fail_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            return Err(Error::storage(format!(
                "injected failure for {container}/{key}"
            )));
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, container: &str, key: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.check_failure(container, key)?;
        self.record(StorageOp::Get {
            container: container.to_string(),
            key: key.to_string(),
        });
        self.inner.get(container, key).await
    }

    async fn upload(
        &self,
        container: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.check_failure(container, key)?;
        self.record(StorageOp::Upload {
            container: container.to_string(),
            key: key.to_string(),
            size: data.len(),
            content_type: content_type.to_string(),
            precondition: precondition.clone(),
        });
        self.inner
            .upload(container, key, data, content_type, precondition)
            .await
    }

    async fn head(&self, container: &str, key: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(container, key)?;
        self.record(StorageOp::Head {
            container: container.to_string(),
            key: key.to_string(),
        });
        self.inner.head(container, key).await
    }
}
