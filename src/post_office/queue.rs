//! Consumer for the single post-office queue.
//!
//! Received envelopes are routed through the [`PostOffice`]. Messages whose
//! util has no letterbox cannot succeed on redelivery, so they are copied to
//! `<queue>.dead-letter` and completed instead of being retried.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use super::PostOffice;
use crate::broker::{Broker, QueueReceiver, QueueSender};
use crate::config::QueueSettings;
use crate::envelope::Message;
use crate::error::{OfficeError, Result};
use crate::manager::ManagedQueue;
use crate::security::SecurityManager;
use crate::throttle::consumer::{dead_letter_queue, ConsumerSettings, DeliveryProcessor, Process, RunningConsumer};

#[derive(Default)]
struct QueueState {
    receiver: Option<Box<dyn QueueReceiver>>,
    dead_letter: Option<Arc<dyn QueueSender>>,
    consumer: Option<RunningConsumer>,
}

pub struct PostOfficeQueue {
    settings: QueueSettings,
    broker: Arc<dyn Broker>,
    security: Arc<SecurityManager>,
    post_office: Arc<PostOffice>,
    handler_timeout: Duration,
    shutdown_grace: Duration,
    state: Mutex<QueueState>,
}

impl PostOfficeQueue {
    pub fn new(
        settings: QueueSettings,
        broker: Arc<dyn Broker>,
        security: Arc<SecurityManager>,
        post_office: Arc<PostOffice>,
        handler_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            settings,
            broker,
            security,
            post_office,
            handler_timeout,
            shutdown_grace,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue_name(&self) -> &str {
        &self.settings.queue_name
    }

    pub async fn initialize(&self) -> Result<()> {
        if !self.broker.is_connected() {
            return Err(OfficeError::NotInitialized("Broker connection".to_string()));
        }

        let needs_dead_letter = self.state().dead_letter.is_none();
        if needs_dead_letter {
            let sender = self.broker.sender(&dead_letter_queue(&self.settings.queue_name)).await?;
            self.state().dead_letter.get_or_insert(sender);
        }

        let needs_receiver = {
            let state = self.state();
            state.receiver.is_none() && !state.consumer.as_ref().is_some_and(RunningConsumer::is_running)
        };
        if needs_receiver {
            let receiver = self
                .broker
                .receiver(&self.settings.queue_name, self.settings.max_concurrent_jobs)
                .await?;
            self.state().receiver.get_or_insert(receiver);
        }

        tracing::info!(
            queue = %self.settings.queue_name,
            max_concurrent_jobs = self.settings.max_concurrent_jobs,
            "Post-office queue initialized"
        );
        Ok(())
    }

    pub async fn start_processing(&self) -> Result<()> {
        let mut state = self.state();
        if state.consumer.as_ref().is_some_and(RunningConsumer::is_running) {
            tracing::warn!(queue = %self.settings.queue_name, "Post-office queue is already processing");
            return Ok(());
        }
        let receiver = state
            .receiver
            .take()
            .ok_or_else(|| OfficeError::NotInitialized("Post-office queue".to_string()))?;

        let post_office = self.post_office.clone();
        let process: Process<Message> = Arc::new(move |message: Message| {
            let post_office = post_office.clone();
            async move { post_office.route_message(message).await.map(|_| ()) }.boxed()
        });

        tracing::info!(
            queue = %self.settings.queue_name,
            letterboxes = ?self.post_office.registered_utils(),
            "Starting post-office message processing"
        );

        state.consumer = Some(RunningConsumer::spawn(
            ConsumerSettings {
                queue: self.settings.queue_name.clone(),
                max_concurrent: self.settings.max_concurrent_jobs,
                shutdown_grace: self.shutdown_grace,
            },
            receiver,
            DeliveryProcessor {
                queue: self.settings.queue_name.clone(),
                security: self.security.clone(),
                handler_timeout: self.handler_timeout,
                dead_letter: state.dead_letter.clone(),
                process,
            },
        ));
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let (consumer, receiver, dead_letter) = {
            let mut state = self.state();
            (state.consumer.take(), state.receiver.take(), state.dead_letter.take())
        };

        if let Some(consumer) = consumer {
            consumer.shutdown().await;
        }
        if let Some(mut receiver) = receiver {
            receiver.close().await?;
        }
        if let Some(sender) = dead_letter {
            sender.close().await?;
        }

        tracing::info!(queue = %self.settings.queue_name, "Post-office queue stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state().consumer.as_ref().is_some_and(RunningConsumer::is_running)
    }
}

#[async_trait]
impl ManagedQueue for PostOfficeQueue {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn initialize(&self) -> Result<()> {
        PostOfficeQueue::initialize(self).await
    }

    async fn start(&self) -> Result<()> {
        self.start_processing().await
    }

    async fn stop(&self) -> Result<()> {
        PostOfficeQueue::stop(self).await
    }

    fn is_running(&self) -> bool {
        PostOfficeQueue::is_running(self)
    }
}
