//! Broker transport seam.
//!
//! Queues are addressed by name. A sender publishes bodies with string
//! properties carried as broker metadata (NATS headers), and a receiver yields
//! [`Delivery`] values that must be explicitly completed or abandoned.
//! [`NatsBroker`] is the production transport; [`MemoryBroker`] keeps the same
//! ack semantics in-process.

pub mod memory;
pub mod nats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

/// Broker metadata attached to a message, kept apart from its body.
pub type Properties = HashMap<String, String>;

/// A message on its way to a queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Stable id for tracing and broker-side de-duplication.
    pub message_id: Option<String>,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn json<T: serde::Serialize>(
        message_id: Option<String>,
        properties: Properties,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id,
            properties,
            body: serde_json::to_vec(body)?,
        })
    }
}

/// Delay before an abandoned message becomes visible again.
///
/// Doubles with every delivery, starting at `initial` and capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RedeliveryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl RedeliveryBackoff {
    /// Redeliver at once.
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay after the `delivery_count`-th delivery was abandoned.
    pub fn delay(&self, delivery_count: u64) -> Duration {
        let doublings = delivery_count.saturating_sub(1).min(16) as u32;
        self.initial.saturating_mul(1 << doublings).min(self.max)
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from the queue.
    async fn complete(&self) -> Result<(), BrokerError>;

    /// Hand the message back for redelivery after the backoff delay.
    async fn abandon(&self) -> Result<(), BrokerError>;
}

/// A received message awaiting settlement.
pub struct Delivery {
    pub message_id: Option<String>,
    pub properties: Properties,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        message_id: Option<String>,
        properties: Properties,
        body: Vec<u8>,
        delivery_count: u64,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            message_id,
            properties,
            body,
            delivery_count,
            acker,
        }
    }

    pub async fn complete(self) -> Result<(), BrokerError> {
        self.acker.complete().await
    }

    pub async fn abandon(self) -> Result<(), BrokerError> {
        self.acker.abandon().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("delivery_count", &self.delivery_count)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[async_trait]
pub trait QueueSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait QueueReceiver: Send {
    /// Wait for the next delivery. `Ok(None)` means the receiver was closed.
    async fn receive(&mut self) -> Result<Option<Delivery>, BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Factory for queue handles.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn sender(&self, queue: &str) -> Result<Arc<dyn QueueSender>, BrokerError>;

    /// Open a consumer on `queue` that buffers at most `prefetch` messages.
    async fn receiver(&self, queue: &str, prefetch: usize) -> Result<Box<dyn QueueReceiver>, BrokerError>;

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let backoff = RedeliveryBackoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(7), Duration::from_secs(60));
        assert_eq!(backoff.delay(u64::MAX), Duration::from_secs(60));
        assert_eq!(RedeliveryBackoff::immediate().delay(3), Duration::ZERO);
    }
}
