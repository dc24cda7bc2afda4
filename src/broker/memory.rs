//! In-process broker with explicit ack semantics.
//!
//! Abandoned messages go back to the tail of their queue with an incremented
//! delivery count; once `max_deliver` is exhausted they move to the queue's
//! dead-letter list. Used by tests and by local runs without a NATS server.
//!
//! Abandoned messages reappear after the broker's [`RedeliveryBackoff`], and a
//! delivery dropped without being settled is returned to the queue at once,
//! standing in for JetStream's ack-wait expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    Acknowledger, Broker, Delivery, OutboundMessage, Properties, QueueReceiver, QueueSender, RedeliveryBackoff,
};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct Stored {
    message_id: Option<String>,
    properties: Properties,
    body: Vec<u8>,
    delivery_count: u64,
}

#[derive(Default)]
struct MemoryQueue {
    pending: Mutex<VecDeque<Stored>>,
    dead_letters: Mutex<Vec<Stored>>,
    completed: AtomicUsize,
    abandoned: AtomicUsize,
    notify: Notify,
}

impl MemoryQueue {
    fn push(&self, stored: Stored) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(stored);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Stored> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

/// Broker whose queues live in process memory.
#[derive(Clone)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<MemoryQueue>>>>,
    max_deliver: u64,
    backoff: RedeliveryBackoff,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(5)
    }
}

impl MemoryBroker {
    pub fn new(max_deliver: u64) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            max_deliver: max_deliver.max(1),
            backoff: RedeliveryBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RedeliveryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Messages waiting to be received.
    pub fn pending(&self, queue: &str) -> usize {
        self.queue(queue)
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn completed(&self, queue: &str) -> usize {
        self.queue(queue).completed.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self, queue: &str) -> usize {
        self.queue(queue).abandoned.load(Ordering::SeqCst)
    }

    /// Bodies of messages that ran out of deliveries.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue)
            .dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.body.clone())
            .collect()
    }

    /// Peek at the bodies currently waiting on a queue.
    pub fn pending_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue)
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.body.clone())
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn sender(&self, queue: &str) -> Result<Arc<dyn QueueSender>, BrokerError> {
        Ok(Arc::new(MemorySender {
            queue: self.queue(queue),
        }))
    }

    async fn receiver(&self, queue: &str, _prefetch: usize) -> Result<Box<dyn QueueReceiver>, BrokerError> {
        Ok(Box::new(MemoryReceiver {
            name: queue.to_string(),
            queue: self.queue(queue),
            max_deliver: self.max_deliver,
            backoff: self.backoff,
            closed: false,
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct MemorySender {
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl QueueSender for MemorySender {
    async fn send(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        self.queue.push(Stored {
            message_id: message.message_id,
            properties: message.properties,
            body: message.body,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryReceiver {
    name: String,
    queue: Arc<MemoryQueue>,
    max_deliver: u64,
    backoff: RedeliveryBackoff,
    closed: bool,
}

#[async_trait]
impl QueueReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            if let Some(mut stored) = self.queue.pop() {
                stored.delivery_count += 1;
                let acker = MemoryAcker {
                    queue: self.queue.clone(),
                    stored: Mutex::new(Some(stored.clone())),
                    max_deliver: self.max_deliver,
                    backoff: self.backoff,
                };
                return Ok(Some(Delivery::new(
                    stored.message_id,
                    stored.properties,
                    stored.body,
                    stored.delivery_count,
                    Box::new(acker),
                )));
            }
            self.queue.notify.notified().await;
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        tracing::debug!(queue = %self.name, "Memory receiver closed");
        self.closed = true;
        Ok(())
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    stored: Mutex<Option<Stored>>,
    max_deliver: u64,
    backoff: RedeliveryBackoff,
}

impl MemoryAcker {
    fn take(&self) -> Result<Stored, BrokerError> {
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| BrokerError::Ack("message already settled".to_string()))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn complete(&self) -> Result<(), BrokerError> {
        self.take()?;
        self.queue.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abandon(&self) -> Result<(), BrokerError> {
        let stored = self.take()?;
        self.queue.abandoned.fetch_add(1, Ordering::SeqCst);
        if stored.delivery_count >= self.max_deliver {
            self.queue
                .dead_letters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(stored);
            return Ok(());
        }

        let delay = self.backoff.delay(stored.delivery_count);
        if delay.is_zero() {
            self.queue.push(stored);
        } else {
            let queue = self.queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.push(stored);
            });
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let unsettled = self
            .stored
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(stored) = unsettled {
            tracing::debug!(message_id = ?stored.message_id, "Unsettled delivery returned to queue");
            self.queue.push(stored);
        }
    }
}
