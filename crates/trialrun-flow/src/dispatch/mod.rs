//! Run dispatch onto a partition-ordered message bus.
//!
//! This module provides:
//!
//! - [`DispatchMessage`]: the JSON wire contract consumed by workers
//! - [`MessageBus`]: trait for publishing to an ordered, at-least-once bus
//! - [`Dispatcher`]: publishes messages and serializes dispatch per ordering key
//! - [`memory::InMemoryMessageBus`]: in-memory bus for testing
//!
//! ## Guarantees
//!
//! - **Per-key ordering**: messages sharing an ordering key are observed in publish order
//! - **At-least-once**: messages may be observed more than once; workers treat
//!   dispatch handling as idempotent keyed by run ID

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use trialrun_core::RunId;

use crate::error::{Error, Result};
use crate::run::{Run, TriggerKind};

/// Dispatch message published for a queued run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    /// Run to execute.
    pub run_id: RunId,
    /// Owning project, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Where the suite IR is stored.
    pub ir_storage_key: String,
    /// Who requested the run.
    pub actor: String,
    /// How the run was triggered.
    pub trigger: TriggerKind,
    /// Ordering key the message was published under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

impl DispatchMessage {
    /// Builds the message for a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the run has no IR storage key.
    pub fn for_run(run: &Run) -> Result<Self> {
        let ir_storage_key = run.ir_storage_key.clone().ok_or_else(|| {
            Error::validation(format!("run {} has no IR storage key", run.id))
        })?;
        Ok(Self {
            run_id: run.id,
            project_id: run.project_id.clone(),
            ir_storage_key,
            actor: run.actor.clone(),
            trigger: run.trigger,
            ordering_key: Some(run.ordering_key.clone()),
        })
    }

    /// Encodes the message as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the payload is not a dispatch message.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Acknowledgement returned by the bus for an accepted publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Bus-assigned message ID.
    pub message_id: String,
}

/// Failure reported by a message bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bus could not be reached or timed out.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// The bus refused the message.
    #[error("bus rejected message: {0}")]
    Rejected(String),
}

/// Ordered, at-least-once message bus.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent dispatchers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `payload` to `topic` under `ordering_key`.
    async fn publish(
        &self,
        topic: &str,
        ordering_key: &str,
        payload: Bytes,
    ) -> std::result::Result<PublishReceipt, BusError>;
}

/// Publishes dispatch messages and serializes dispatch per ordering key.
///
/// Holding the key lock while publishing the queued runs of a key in
/// `dispatch_seq` (creation) order keeps a later run from overtaking an earlier one.
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    topic: String,
    key_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::DispatchUnavailable {
        run_id: None,
        message: "dispatcher lock poisoned".into(),
        source: None,
    }
}

impl Dispatcher {
    /// Creates a dispatcher publishing to `topic`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the dispatch topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Acquires the dispatch lock for `ordering_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock table is poisoned.
    pub async fn lock_key(&self, ordering_key: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.key_locks.lock().map_err(poison_err)?;
            Arc::clone(locks.entry(ordering_key.to_string()).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Publishes the dispatch message for `run`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DispatchUnavailable`] if the bus fails or refuses the message.
    #[tracing::instrument(skip(self, run), fields(run_id = %run.id, ordering_key = %run.ordering_key))]
    pub async fn publish(&self, run: &Run) -> Result<PublishReceipt> {
        let message = DispatchMessage::for_run(run)?;
        let payload = message.to_payload()?;
        self.bus
            .publish(&self.topic, &run.ordering_key, payload)
            .await
            .map_err(|err| Error::DispatchUnavailable {
                run_id: Some(run.id),
                message: err.to_string(),
                source: Some(Box::new(err)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn queued_run() -> Run {
        let mut run = Run::new("checkout", "1", "alice", "P1", Utc::now()).with_project("P1");
        run.ir_storage_key = Some(format!("runs/{}/suite", run.id));
        run
    }

    #[test]
    fn dispatch_message_wire_format_is_camel_case() {
        let run = queued_run();
        let message = DispatchMessage::for_run(&run).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&message.to_payload().unwrap()).unwrap();

        assert_eq!(json["runId"], run.id.to_string());
        assert_eq!(json["projectId"], "P1");
        assert_eq!(json["irStorageKey"], format!("runs/{}/suite", run.id));
        assert_eq!(json["actor"], "alice");
        assert_eq!(json["trigger"], "MANUAL");
        assert_eq!(json["orderingKey"], "P1");
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let run_id = RunId::generate();
        let payload = format!(
            r#"{{"runId":"{run_id}","irStorageKey":"runs/{run_id}/suite","actor":"ci","trigger":"WEBHOOK"}}"#
        );
        let message = DispatchMessage::from_payload(payload.as_bytes()).unwrap();
        assert_eq!(message.project_id, None);
        assert_eq!(message.ordering_key, None);
        assert_eq!(message.trigger, TriggerKind::Webhook);
    }

    #[test]
    fn run_without_ir_key_cannot_be_dispatched() {
        let mut run = queued_run();
        run.ir_storage_key = None;
        assert!(DispatchMessage::for_run(&run).is_err());
    }

    #[tokio::test]
    async fn key_locks_are_per_key() {
        let bus = Arc::new(memory::InMemoryMessageBus::new());
        let dispatcher = Dispatcher::new(bus, "trialrun.dispatch");

        let p1 = dispatcher.lock_key("P1").await.unwrap();
        let p2 = tokio::time::timeout(std::time::Duration::from_millis(50), dispatcher.lock_key("P2"))
            .await;
        assert!(p2.is_ok(), "other keys must not block");

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), dispatcher.lock_key("P1"))
                .await;
        assert!(blocked.is_err(), "same key must block");
        drop(p1);
    }

    #[tokio::test]
    async fn bus_failure_becomes_dispatch_unavailable() {
        let bus = Arc::new(memory::InMemoryMessageBus::new());
        bus.set_available(false);
        let dispatcher = Dispatcher::new(bus, "trialrun.dispatch");

        let run = queued_run();
        let err = dispatcher.publish(&run).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DispatchUnavailable { run_id: Some(id), .. } if id == run.id
        ));
    }
}
