//! Blob storage abstraction (GCS, S3, Azure Blob, in-memory).
//!
//! This module defines the storage contract the IR store writes through:
//! - Objects are addressed by `(container, key)`
//! - Uploads carry a content type and an optional create-only precondition
//! - Object metadata exposes an opaque version token
//!
//! The version token is an opaque `String` so that each backend can use its
//! native versioning (GCS generation, S3 `ETag`, Azure `ETag`).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Container (bucket) holding the object.
    pub container: String,
    /// Object key within the container.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque version token.
    pub version: String,
    /// Content type recorded at upload.
    pub content_type: Option<String>,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for blob storage.
///
/// All storage backends (cloud object stores, memory) implement this trait.
/// Implementations return [`Error::NotFound`] for missing objects and
/// [`Error::Storage`] for transport or service failures.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, container: &str, key: &str) -> Result<Bytes>;

    /// Uploads an object with an optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not met.
    /// Never returns an error for precondition failure - that's a normal result.
    async fn upload(
        &self,
        container: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, container: &str, key: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings) to simulate GCS-like behavior.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    content_type: String,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, container: &str, key: &str) -> ObjectMeta {
        ObjectMeta {
            container: container.to_string(),
            key: key.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            content_type: Some(self.content_type.clone()),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

fn object_id(container: &str, key: &str) -> (String, String) {
    (container.to_string(), key.to_string())
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn object_count(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(|_| poisoned())?.len())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, container: &str, key: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(&object_id(container, key))
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {container}/{key}")))
    }

    async fn upload(
        &self,
        container: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let id = object_id(container, key);
        let current = objects.get(&id);

        if let (WritePrecondition::DoesNotExist, Some(obj)) = (&precondition, current) {
            return Ok(WriteResult::PreconditionFailed {
                current_version: obj.version.to_string(),
            });
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            id,
            StoredObject {
                data,
                version: new_version,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn head(&self, container: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .get(&object_id(container, key))
            .map(|obj| obj.meta(container, key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = "application/json";

    #[tokio::test]
    async fn upload_then_get_returns_content() {
        let backend = MemoryBackend::new();
        let data = Bytes::from_static(b"{\"steps\":[]}");

        let result = backend
            .upload("ir", "runs/a/suite", data.clone(), JSON, WritePrecondition::None)
            .await
            .expect("upload should succeed");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend.get("ir", "runs/a/suite").await.expect("get");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn containers_are_isolated() {
        let backend = MemoryBackend::new();
        backend
            .upload("a", "k", Bytes::from("1"), JSON, WritePrecondition::None)
            .await
            .expect("upload");

        let missing = backend.get("b", "k").await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn head_reports_content_type_and_size() {
        let backend = MemoryBackend::new();
        backend
            .upload("ir", "k", Bytes::from("data"), JSON, WritePrecondition::None)
            .await
            .expect("upload");

        let meta = backend
            .head("ir", "k")
            .await
            .expect("head")
            .expect("object should exist");
        assert_eq!(meta.size, 4);
        assert_eq!(meta.content_type.as_deref(), Some(JSON));
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn does_not_exist_precondition_blocks_second_write() {
        let backend = MemoryBackend::new();
        let first = backend
            .upload("ir", "k", Bytes::from("v1"), JSON, WritePrecondition::DoesNotExist)
            .await
            .expect("upload");
        assert!(matches!(first, WriteResult::Success { .. }));

        let second = backend
            .upload("ir", "k", Bytes::from("v2"), JSON, WritePrecondition::DoesNotExist)
            .await
            .expect("upload");
        assert!(matches!(second, WriteResult::PreconditionFailed { ref current_version } if current_version == "1"));

        let stored = backend.get("ir", "k").await.expect("get");
        assert_eq!(stored, Bytes::from("v1"));
    }

    #[tokio::test]
    async fn unconditional_upload_bumps_version() {
        let backend = MemoryBackend::new();
        for expected in ["1", "2"] {
            let result = backend
                .upload("ir", "k", Bytes::from("v"), JSON, WritePrecondition::None)
                .await
                .expect("upload");
            assert!(matches!(result, WriteResult::Success { ref version } if version == expected));
        }
        assert_eq!(backend.object_count().expect("count"), 1);
    }
}
