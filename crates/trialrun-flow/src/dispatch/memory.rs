//! In-memory message bus for testing.
//!
//! This module provides [`InMemoryMessageBus`], an implementation of the
//! [`MessageBus`] trait that models a partition-ordered, at-least-once bus:
//!
//! - Each `(topic, ordering key)` pair is a partition delivered in publish order
//! - A partition hands out one message at a time; the next message is only
//!   delivered after the previous one is acked
//! - Unacked messages can be redelivered, so consumers observe duplicates
//!
//! Publish failures can be injected with [`InMemoryMessageBus::set_available`]
//! and [`InMemoryMessageBus::fail_next`].
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no distribution

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use ulid::Ulid;

use super::{BusError, DispatchMessage, MessageBus, PublishReceipt};
use crate::error::{Error, Result};

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Bus-assigned message ID.
    pub message_id: String,
    /// Topic the message was published to.
    pub topic: String,
    /// Partition ordering key.
    pub ordering_key: String,
    /// Raw payload.
    pub payload: Bytes,
    /// How many times this message has been delivered (1 on first delivery).
    pub delivery_count: u32,
}

impl Delivery {
    /// Decodes the payload as a [`DispatchMessage`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the payload is not a dispatch message.
    pub fn message(&self) -> Result<DispatchMessage> {
        DispatchMessage::from_payload(&self.payload)
    }
}

#[derive(Debug, Default)]
struct Partition {
    queue: VecDeque<Delivery>,
    in_flight: Option<Delivery>,
}

#[derive(Debug, Default)]
struct BusState {
    partitions: HashMap<(String, String), Partition>,
    log: Vec<Delivery>,
}

/// In-memory ordered message bus.
///
/// ## Example
///
/// ```rust
/// use trialrun_flow::dispatch::memory::InMemoryMessageBus;
///
/// let bus = InMemoryMessageBus::new();
/// assert!(bus.published().unwrap().is_empty());
/// ```
#[derive(Debug)]
pub struct InMemoryMessageBus {
    state: RwLock<BusState>,
    available: AtomicBool,
    fail_remaining: AtomicU32,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a dispatch error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::DispatchUnavailable {
        run_id: None,
        message: "message bus lock poisoned".into(),
        source: None,
    }
}

fn partition_key(topic: &str, ordering_key: &str) -> (String, String) {
    (topic.to_string(), ordering_key.to_string())
}

impl InMemoryMessageBus {
    /// Creates an available, empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BusState::default()),
            available: AtomicBool::new(true),
            fail_remaining: AtomicU32::new(0),
        }
    }

    /// Makes every publish succeed (`true`) or fail (`false`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns every accepted message in publish order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self) -> Result<Vec<Delivery>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.log.clone())
    }

    /// Receives the next message of a partition.
    ///
    /// Returns `None` if the partition is empty or its head is in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn receive(&self, topic: &str, ordering_key: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(partition) = state.partitions.get_mut(&partition_key(topic, ordering_key)) else {
            drop(state);
            return Ok(None);
        };
        if partition.in_flight.is_some() {
            drop(state);
            return Ok(None);
        }
        let delivery = partition.queue.pop_front().map(|mut d| {
            d.delivery_count += 1;
            d
        });
        partition.in_flight.clone_from(&delivery);
        drop(state);
        Ok(delivery)
    }

    /// Acknowledges a delivery, releasing the next message of its partition.
    ///
    /// Returns `false` if the delivery is not the partition's in-flight message.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let acked = state
            .partitions
            .get_mut(&partition_key(&delivery.topic, &delivery.ordering_key))
            .is_some_and(|p| {
                let matches = p
                    .in_flight
                    .as_ref()
                    .is_some_and(|d| d.message_id == delivery.message_id);
                if matches {
                    p.in_flight = None;
                }
                matches
            });
        drop(state);
        Ok(acked)
    }

    /// Returns every in-flight message to the head of its partition.
    ///
    /// Models an acknowledgement deadline expiring: the messages will be
    /// delivered again. Returns how many messages were returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn redeliver_in_flight(&self) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut count = 0;
        for partition in state.partitions.values_mut() {
            if let Some(delivery) = partition.in_flight.take() {
                partition.queue.push_front(delivery);
                count += 1;
            }
        }
        drop(state);
        Ok(count)
    }

    /// Returns how many messages of a partition are not yet acked.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending(&self, topic: &str, ordering_key: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .partitions
            .get(&partition_key(topic, ordering_key))
            .map_or(0, |p| p.queue.len() + usize::from(p.in_flight.is_some())))
    }

    fn should_fail(&self) -> bool {
        if !self.available.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(
        &self,
        topic: &str,
        ordering_key: &str,
        payload: Bytes,
    ) -> std::result::Result<PublishReceipt, BusError> {
        if self.should_fail() {
            return Err(BusError::Unavailable("injected publish failure".into()));
        }

        let delivery = Delivery {
            message_id: Ulid::new().to_string(),
            topic: topic.to_string(),
            ordering_key: ordering_key.to_string(),
            payload,
            delivery_count: 0,
        };

        let mut state = self
            .state
            .write()
            .map_err(|_| BusError::Unavailable("message bus lock poisoned".into()))?;
        state.log.push(delivery.clone());
        state
            .partitions
            .entry(partition_key(topic, ordering_key))
            .or_default()
            .queue
            .push_back(delivery.clone());
        drop(state);

        Ok(PublishReceipt {
            message_id: delivery.message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "trialrun.dispatch";

    async fn publish(bus: &InMemoryMessageBus, key: &str, body: &'static str) -> String {
        bus.publish(TOPIC, key, Bytes::from_static(body.as_bytes()))
            .await
            .unwrap()
            .message_id
    }

    #[tokio::test]
    async fn partition_delivers_in_publish_order() {
        let bus = InMemoryMessageBus::new();
        publish(&bus, "P1", "a").await;
        publish(&bus, "P1", "b").await;

        let first = bus.receive(TOPIC, "P1").unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"a"));
        assert!(bus.receive(TOPIC, "P1").unwrap().is_none(), "head-of-line");

        assert!(bus.ack(&first).unwrap());
        let second = bus.receive(TOPIC, "P1").unwrap().unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let bus = InMemoryMessageBus::new();
        publish(&bus, "P1", "a").await;
        publish(&bus, "P2", "b").await;

        let _p1 = bus.receive(TOPIC, "P1").unwrap().unwrap();
        let p2 = bus.receive(TOPIC, "P2").unwrap().unwrap();
        assert_eq!(p2.payload, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered() {
        let bus = InMemoryMessageBus::new();
        let id = publish(&bus, "P1", "a").await;

        let first = bus.receive(TOPIC, "P1").unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        assert_eq!(bus.redeliver_in_flight().unwrap(), 1);

        let again = bus.receive(TOPIC, "P1").unwrap().unwrap();
        assert_eq!(again.message_id, id);
        assert_eq!(again.delivery_count, 2);
        assert!(bus.ack(&again).unwrap());
        assert_eq!(bus.pending(TOPIC, "P1").unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures() {
        let bus = InMemoryMessageBus::new();
        bus.fail_next(1);
        assert!(bus.publish(TOPIC, "P1", Bytes::from("x")).await.is_err());
        assert!(bus.publish(TOPIC, "P1", Bytes::from("x")).await.is_ok());

        bus.set_available(false);
        assert!(matches!(
            bus.publish(TOPIC, "P1", Bytes::from("x")).await,
            Err(BusError::Unavailable(_))
        ));
        assert_eq!(bus.published().unwrap().len(), 1);
    }
}
