//! Per-subsystem throttle queues.
//!
//! A [`ThrottleQueue`] owns one broker queue: a sender through which jobs are
//! enqueued and a consumer that runs at most `max_concurrent_jobs` of them at
//! a time. Every subsystem uses the same generic type, differing only in
//! settings, job type and handler.

pub mod consumer;
pub mod jobs;
pub mod webhook;

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::broker::{Broker, OutboundMessage, Properties, QueueReceiver, QueueSender};
use crate::config::QueueSettings;
use crate::error::{OfficeError, Result};
use crate::manager::ManagedQueue;
use crate::security::SecurityManager;

use consumer::{ConsumerSettings, DeliveryProcessor, Process, RunningConsumer};

pub use consumer::DeliveryOutcome;
pub use jobs::{LetterJob, ResponseHandler};
pub use webhook::WebhookJobHandler;

/// A unit of work that can travel on a throttle queue.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable id, used as the broker message id.
    fn id(&self) -> &str;

    fn kind(&self) -> &str;
}

/// Processes jobs taken off a throttle queue. An error means "retry me".
#[async_trait]
pub trait JobHandler<J>: Send + Sync {
    async fn handle(&self, job: J) -> Result<Value>;
}

#[async_trait]
impl<J, F, Fut> JobHandler<J> for F
where
    J: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, job: J) -> Result<Value> {
        (self)(job).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct QueueState {
    sender: Option<Arc<dyn QueueSender>>,
    receiver: Option<Box<dyn QueueReceiver>>,
    consumer: Option<RunningConsumer>,
}

pub struct ThrottleQueue<J: Job> {
    settings: QueueSettings,
    broker: Arc<dyn Broker>,
    security: Arc<SecurityManager>,
    handler_timeout: Duration,
    shutdown_grace: Duration,
    default_handler: Option<Arc<dyn JobHandler<J>>>,
    state: Mutex<QueueState>,
    _job: PhantomData<fn() -> J>,
}

impl<J: Job> ThrottleQueue<J> {
    pub fn new(
        settings: QueueSettings,
        broker: Arc<dyn Broker>,
        security: Arc<SecurityManager>,
        handler_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            settings,
            broker,
            security,
            handler_timeout,
            shutdown_grace,
            default_handler: None,
            state: Mutex::new(QueueState::default()),
            _job: PhantomData,
        }
    }

    /// Handler used when processing starts without an explicit one.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler<J>>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn queue_name(&self) -> &str {
        &self.settings.queue_name
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.settings.max_concurrent_jobs
    }

    /// The open sender, reopening it if a stop closed it.
    async fn sender(&self) -> Result<Arc<dyn QueueSender>> {
        let existing = lock(&self.state).sender.clone();
        if let Some(sender) = existing {
            return Ok(sender);
        }
        let sender = self.broker.sender(&self.settings.queue_name).await?;
        Ok(lock(&self.state).sender.get_or_insert(sender).clone())
    }

    /// Open the sender and receiver. Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        self.sender().await?;

        let needs_receiver = {
            let state = lock(&self.state);
            state.receiver.is_none() && !state.consumer.as_ref().is_some_and(RunningConsumer::is_running)
        };
        if needs_receiver {
            let receiver = self
                .broker
                .receiver(&self.settings.queue_name, self.settings.max_concurrent_jobs)
                .await?;
            lock(&self.state).receiver.get_or_insert(receiver);
        }

        tracing::info!(
            queue = %self.settings.name,
            queue_name = %self.settings.queue_name,
            max_concurrent_jobs = self.settings.max_concurrent_jobs,
            "Throttle queue initialized"
        );
        Ok(())
    }

    /// Stamp and publish a job, using its id as the message id.
    ///
    /// Works while the consumer is stopped; the job waits on the broker
    /// until processing starts again.
    pub async fn send_job(&self, job: &J) -> Result<()> {
        let sender = self.sender().await?;

        let mut properties = Properties::new();
        properties.insert("jobType".to_string(), job.kind().to_string());
        let properties = self.security.add_message_security(properties);

        sender
            .send(OutboundMessage::json(Some(job.id().to_string()), properties, job)?)
            .await?;

        tracing::info!(
            queue = %self.settings.name,
            job_id = %job.id(),
            job_type = %job.kind(),
            "Job queued: {}",
            job.id()
        );
        Ok(())
    }

    /// Start consuming with `handler`, or the default handler if none is given.
    ///
    /// Does nothing when the queue is already running.
    pub async fn start_processing(&self, handler: Option<Arc<dyn JobHandler<J>>>) -> Result<()> {
        let handler = handler
            .or_else(|| self.default_handler.clone())
            .ok_or_else(|| OfficeError::NotInitialized(format!("Job handler for '{}'", self.settings.name)))?;

        let mut state = lock(&self.state);
        if state.consumer.as_ref().is_some_and(RunningConsumer::is_running) {
            tracing::warn!(queue = %self.settings.name, "Throttle queue is already processing");
            return Ok(());
        }
        let receiver = state
            .receiver
            .take()
            .ok_or_else(|| OfficeError::NotInitialized(format!("Throttle queue '{}'", self.settings.name)))?;

        let name = self.settings.name.clone();
        let process: Process<J> = Arc::new(move |job: J| {
            let handler = handler.clone();
            let name = name.clone();
            async move {
                let job_id = job.id().to_string();
                tracing::info!(queue = %name, job_id = %job_id, "Processing job: {}", job_id);
                handler.handle(job).await?;
                tracing::info!(queue = %name, job_id = %job_id, "Job completed: {}", job_id);
                Ok(())
            }
            .boxed()
        });

        let processor = DeliveryProcessor {
            queue: self.settings.name.clone(),
            security: self.security.clone(),
            handler_timeout: self.handler_timeout,
            dead_letter: None,
            process,
        };

        state.consumer = Some(RunningConsumer::spawn(
            ConsumerSettings {
                queue: self.settings.name.clone(),
                max_concurrent: self.settings.max_concurrent_jobs,
                shutdown_grace: self.shutdown_grace,
            },
            receiver,
            processor,
        ));
        Ok(())
    }

    /// Close the sender and receiver, draining in-flight jobs. Safe to call
    /// on a queue that never started.
    pub async fn stop(&self) -> Result<()> {
        let (consumer, receiver, sender) = {
            let mut state = lock(&self.state);
            (state.consumer.take(), state.receiver.take(), state.sender.take())
        };

        if let Some(consumer) = consumer {
            consumer.shutdown().await;
        }
        if let Some(mut receiver) = receiver {
            receiver.close().await?;
        }
        if let Some(sender) = sender {
            sender.close().await?;
        }

        tracing::info!(queue = %self.settings.name, "Throttle queue stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state)
            .consumer
            .as_ref()
            .is_some_and(RunningConsumer::is_running)
    }
}

#[async_trait]
impl<J: Job> ManagedQueue for ThrottleQueue<J> {
    fn name(&self) -> &str {
        ThrottleQueue::name(self)
    }

    async fn initialize(&self) -> Result<()> {
        ThrottleQueue::initialize(self).await
    }

    async fn start(&self) -> Result<()> {
        self.start_processing(None).await
    }

    async fn stop(&self) -> Result<()> {
        ThrottleQueue::stop(self).await
    }

    fn is_running(&self) -> bool {
        ThrottleQueue::is_running(self)
    }
}
