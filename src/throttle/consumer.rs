//! Bounded-concurrency consumer loop shared by every queue.
//!
//! A permit is taken from a semaphore *before* each receive, so at most
//! `max_concurrent` deliveries are ever held by the process. Each delivery is
//! settled exactly once:
//!
//! | condition                                   | settlement                |
//! |---------------------------------------------|---------------------------|
//! | transit token missing or wrong              | complete (dropped)        |
//! | body does not parse                         | abandon                   |
//! | handler ok                                  | complete                  |
//! | handler error, timeout or panic             | abandon                   |
//! | non-retryable error with a dead-letter queue| publish to DLQ, complete  |

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::broker::{Delivery, OutboundMessage, QueueReceiver, QueueSender};
use crate::error::{OfficeError, Result};
use crate::security::SecurityManager;

/// Type-erased per-item processing function.
pub(crate) type Process<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Property recording why a message was dead-lettered.
pub const DEAD_LETTER_REASON: &str = "deadLetterReason";

/// Suffix of the queue that receives unroutable messages.
pub const DEAD_LETTER_SUFFIX: &str = "dead-letter";

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.{}", queue, DEAD_LETTER_SUFFIX)
}

const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    /// Failed the transit check; completed without processing.
    Rejected,
    Abandoned,
    DeadLettered,
}

#[derive(Clone)]
pub(crate) struct ConsumerSettings {
    pub queue: String,
    pub max_concurrent: usize,
    pub shutdown_grace: Duration,
}

/// Settles a single delivery against `process`.
pub(crate) struct DeliveryProcessor<T> {
    pub queue: String,
    pub security: Arc<SecurityManager>,
    pub handler_timeout: Duration,
    pub dead_letter: Option<Arc<dyn QueueSender>>,
    pub process: Process<T>,
}

impl<T> Clone for DeliveryProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            security: self.security.clone(),
            handler_timeout: self.handler_timeout,
            dead_letter: self.dead_letter.clone(),
            process: self.process.clone(),
        }
    }
}

impl<T> DeliveryProcessor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub async fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        let message_id = delivery.message_id.clone().unwrap_or_else(|| "-".to_string());
        let queue = self.queue.as_str();

        if !self.security.validate_message_security(&delivery.properties, delivery.message_id.as_deref()) {
            tracing::warn!(
                target: "postoffice::security",
                queue = %queue,
                message_id = %message_id,
                "Dropping message that failed transit validation"
            );
            return self.settle(delivery, DeliveryOutcome::Rejected).await;
        }

        let item: T = match serde_json::from_slice(&delivery.body) {
            Ok(item) => item,
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    message_id = %message_id,
                    delivery_count = delivery.delivery_count,
                    "Message body could not be parsed: {}",
                    e
                );
                return self.settle(delivery, DeliveryOutcome::Abandoned).await;
            }
        };

        let invocation = AssertUnwindSafe((self.process)(item)).catch_unwind();
        let result = match tokio::time::timeout(self.handler_timeout, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(OfficeError::Handler("handler panicked".to_string())),
            Err(_elapsed) => Err(OfficeError::Timeout(self.handler_timeout)),
        };

        match result {
            Ok(()) => {
                tracing::debug!(queue = %queue, message_id = %message_id, "Message processed");
                self.settle(delivery, DeliveryOutcome::Completed).await
            }
            Err(e) if !e.is_retryable() && self.dead_letter.is_some() => {
                tracing::error!(
                    target: "postoffice::operator",
                    queue = %queue,
                    message_id = %message_id,
                    "Message cannot be processed, moving to dead-letter queue: {}",
                    e
                );
                self.move_to_dead_letter(delivery, &e).await
            }
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    message_id = %message_id,
                    delivery_count = delivery.delivery_count,
                    "Message failed, abandoning for redelivery: {}",
                    e
                );
                self.settle(delivery, DeliveryOutcome::Abandoned).await
            }
        }
    }

    async fn move_to_dead_letter(&self, delivery: Delivery, error: &OfficeError) -> DeliveryOutcome {
        let Some(sender) = &self.dead_letter else {
            return self.settle(delivery, DeliveryOutcome::Abandoned).await;
        };

        let mut properties = self.security.add_message_security(delivery.properties.clone());
        properties.insert(DEAD_LETTER_REASON.to_string(), error.to_string());

        // Distinct id so broker de-duplication does not swallow the copy.
        let message = OutboundMessage {
            message_id: delivery.message_id.as_ref().map(|id| format!("{}.{}", id, DEAD_LETTER_SUFFIX)),
            properties,
            body: delivery.body.clone(),
        };

        match sender.send(message).await {
            Ok(()) => self.settle(delivery, DeliveryOutcome::DeadLettered).await,
            Err(e) => {
                // Keep the message on the broker rather than lose it.
                tracing::error!(queue = %self.queue, "Dead-letter publish failed: {}", e);
                self.settle(delivery, DeliveryOutcome::Abandoned).await
            }
        }
    }

    async fn settle(&self, delivery: Delivery, outcome: DeliveryOutcome) -> DeliveryOutcome {
        let settled = match outcome {
            DeliveryOutcome::Abandoned => delivery.abandon().await,
            _ => delivery.complete().await,
        };
        if let Err(e) = settled {
            // The broker redelivers once the ack wait expires.
            tracing::error!(queue = %self.queue, ?outcome, "Failed to settle message: {}", e);
        }
        outcome
    }
}

/// A consumer loop running on its own task.
pub(crate) struct RunningConsumer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningConsumer {
    pub fn spawn<T>(
        settings: ConsumerSettings,
        receiver: Box<dyn QueueReceiver>,
        processor: DeliveryProcessor<T>,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(settings, receiver, processor, cancel.clone()));
        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop receiving and wait for the loop to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Consumer task ended abnormally: {}", e);
        }
    }
}

async fn run<T>(
    settings: ConsumerSettings,
    mut receiver: Box<dyn QueueReceiver>,
    processor: DeliveryProcessor<T>,
    cancel: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
{
    let queue = settings.queue.clone();
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
    let mut tasks = JoinSet::new();

    tracing::info!(queue = %queue, max_concurrent = settings.max_concurrent, "Consumer started");

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(queue = %queue, "Message task failed: {}", e);
                }
                continue;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = receiver.receive() => received,
        };

        match received {
            Ok(Some(delivery)) => {
                let processor = processor.clone();
                tasks.spawn(async move {
                    let outcome = processor.handle(delivery).await;
                    drop(permit);
                    outcome
                });
            }
            Ok(None) => {
                tracing::debug!(queue = %queue, "Receiver closed");
                break;
            }
            Err(e) => {
                drop(permit);
                tracing::error!(queue = %queue, "Receive failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                }
            }
        }
    }

    if let Err(e) = receiver.close().await {
        tracing::warn!(queue = %queue, "Failed to close receiver: {}", e);
    }

    let in_flight = tasks.len();
    if in_flight > 0 {
        tracing::info!(queue = %queue, in_flight, "Draining in-flight messages");
    }
    let drained = tokio::time::timeout(settings.shutdown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        // Unsettled deliveries are redelivered after the ack wait.
        tracing::warn!(queue = %queue, remaining = tasks.len(), "Grace period expired, aborting in-flight messages");
        tasks.abort_all();
    }

    tracing::info!(queue = %queue, "Consumer stopped");
}
