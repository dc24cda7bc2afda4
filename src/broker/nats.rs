//! NATS JetStream transport
//!
//! Every logical queue maps to the subject `queues.<name>` inside one
//! work-queue stream, consumed through a durable pull consumer with explicit
//! acks. Message properties travel as NATS headers and the message id doubles
//! as the JetStream de-duplication id. Abandoned messages are Nak'd with a
//! delay that grows with the delivery count.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;

use super::{
    Acknowledger, Broker, Delivery, OutboundMessage, Properties, QueueReceiver, QueueSender, RedeliveryBackoff,
};
use crate::config::BrokerConfig;
use crate::error::BrokerError;

const SUBJECT_PREFIX: &str = "queues";
const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

fn subject_for(queue: &str) -> String {
    format!("{}.{}", SUBJECT_PREFIX, queue)
}

/// Durable consumer names may not contain dots.
fn durable_name_for(queue: &str) -> String {
    queue.replace('.', "_")
}

#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: BrokerConfig,
}

impl NatsBroker {
    /// Connect to NATS and make sure the queue stream exists
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BrokerError::Connect(format!("{}: {}", config.url, e)))?;
        tracing::info!("Connected to NATS at {}", config.url);

        let jetstream = jetstream::new(client.clone());

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![format!("{}.>", SUBJECT_PREFIX)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                max_age: config.max_age(),
                max_bytes: config.max_bytes,
                storage: jetstream::stream::StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Connect(format!("stream '{}': {}", config.stream_name, e)))?;

        tracing::info!("JetStream stream '{}' ready", config.stream_name);

        Ok(Self {
            client,
            jetstream,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn sender(&self, queue: &str) -> Result<Arc<dyn QueueSender>, BrokerError> {
        Ok(Arc::new(NatsSender {
            jetstream: self.jetstream.clone(),
            queue: queue.to_string(),
            subject: subject_for(queue),
        }))
    }

    async fn receiver(&self, queue: &str, prefetch: usize) -> Result<Box<dyn QueueReceiver>, BrokerError> {
        let receive_err = |e: &dyn std::fmt::Display| BrokerError::Receive {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| receive_err(&e))?;

        let durable = durable_name_for(queue);
        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                &durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait(),
                    max_deliver: self.config.max_deliver,
                    filter_subject: subject_for(queue),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| receive_err(&e))?;

        // Keep the client-side buffer no larger than what can be processed,
        // so buffered messages do not burn their ack wait.
        let messages = consumer
            .stream()
            .max_messages_per_batch(prefetch.max(1))
            .messages()
            .await
            .map_err(|e| receive_err(&e))?;

        tracing::debug!(queue = %queue, consumer = %durable, "JetStream consumer ready");

        Ok(Box::new(NatsReceiver {
            queue: queue.to_string(),
            messages: Some(messages),
            backoff: self.config.backoff(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

struct NatsSender {
    jetstream: jetstream::Context,
    queue: String,
    subject: String,
}

#[async_trait]
impl QueueSender for NatsSender {
    async fn send(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let publish_err = |e: &dyn std::fmt::Display| BrokerError::Publish {
            queue: self.queue.clone(),
            reason: e.to_string(),
        };

        let mut headers = async_nats::HeaderMap::new();
        for (key, value) in &message.properties {
            headers.insert(key.as_str(), value.as_str());
        }
        if let Some(id) = &message.message_id {
            headers.insert(MESSAGE_ID_HEADER, id.as_str());
        }

        // Publish with JetStream (durable, acknowledged)
        let ack = self
            .jetstream
            .publish_with_headers(self.subject.clone(), headers, message.body.into())
            .await
            .map_err(|e| publish_err(&e))?;

        // Wait for acknowledgment
        ack.await.map_err(|e| publish_err(&e))?;

        tracing::debug!(
            "Published message {} to JetStream subject {}",
            message.message_id.as_deref().unwrap_or("-"),
            self.subject
        );

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct NatsReceiver {
    queue: String,
    messages: Option<jetstream::consumer::pull::Stream>,
    backoff: RedeliveryBackoff,
}

#[async_trait]
impl QueueReceiver for NatsReceiver {
    async fn receive(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let Some(messages) = self.messages.as_mut() else {
            return Ok(None);
        };

        let message = match messages.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                return Err(BrokerError::Receive {
                    queue: self.queue.clone(),
                    reason: e.to_string(),
                })
            }
            None => return Ok(None),
        };

        let mut properties = Properties::new();
        let mut message_id = None;
        if let Some(headers) = &message.headers {
            for (name, values) in headers.iter() {
                let Some(value) = values.first() else { continue };
                if name.to_string() == MESSAGE_ID_HEADER {
                    message_id = Some(value.as_str().to_string());
                } else {
                    properties.insert(name.to_string(), value.as_str().to_string());
                }
            }
        }

        let delivery_count = message.info().map(|info| info.delivered as u64).unwrap_or(1);
        let body = message.payload.to_vec();

        Ok(Some(Delivery::new(
            message_id,
            properties,
            body,
            delivery_count,
            Box::new(NatsAcker {
                message,
                redelivery_delay: self.backoff.delay(delivery_count),
            }),
        )))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.messages = None;
        Ok(())
    }
}

struct NatsAcker {
    message: jetstream::Message,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn complete(&self) -> Result<(), BrokerError> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn abandon(&self) -> Result<(), BrokerError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(Some(self.redelivery_delay)))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_and_durable_names() {
        assert_eq!(subject_for("ai-service"), "queues.ai-service");
        assert_eq!(durable_name_for("post-office.dead-letter"), "post-office_dead-letter");
    }
}
