//! Application wiring.
//!
//! [`App::builder`] constructs every long-lived component once and hands
//! them to each other as `Arc`s. Nothing in the crate reaches for a global.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::broker::Broker;
use crate::config::OfficeConfig;
use crate::error::Result;
use crate::manager::QueueManager;
use crate::post_office::{
    ForwardingLetterbox, Letterbox, PostOffice, PostOfficeQueue, Postman, WorkflowLetterbox, WORKFLOW_UTIL,
};
use crate::security::SecurityManager;
use crate::throttle::{JobHandler, LetterJob, ThrottleQueue, WebhookJobHandler};

pub struct App {
    pub config: OfficeConfig,
    pub broker: Arc<dyn Broker>,
    pub security: Arc<SecurityManager>,
    pub post_office: Arc<PostOffice>,
    pub postman: Arc<Postman>,
    pub manager: Arc<QueueManager>,
    pub throttle_queues: IndexMap<String, Arc<ThrottleQueue<LetterJob>>>,
}

pub struct AppBuilder {
    config: OfficeConfig,
    broker: Arc<dyn Broker>,
    letterboxes: Vec<(String, Arc<dyn Letterbox>)>,
    job_handlers: HashMap<String, Arc<dyn JobHandler<LetterJob>>>,
}

impl App {
    pub fn builder(config: OfficeConfig, broker: Arc<dyn Broker>) -> AppBuilder {
        AppBuilder {
            config,
            broker,
            letterboxes: Vec::new(),
            job_handlers: HashMap::new(),
        }
    }

    /// Build with the default letterboxes and webhook job handlers.
    pub async fn build(config: OfficeConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        Self::builder(config, broker).build().await
    }

    pub fn throttle_queue(&self, name: &str) -> Option<&Arc<ThrottleQueue<LetterJob>>> {
        self.throttle_queues.get(name)
    }

    /// Open every queue and start consuming.
    pub async fn start(&self) -> Result<()> {
        self.manager.initialize_all_queues().await?;
        self.manager.start_all_throttle_queues().await?;
        self.manager.start_post_office().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.manager.shutdown().await
    }
}

impl AppBuilder {
    /// Register an extra letterbox, replacing any built-in one for `util`.
    pub fn letterbox(mut self, util: impl Into<String>, letterbox: Arc<dyn Letterbox>) -> Self {
        self.letterboxes.push((util.into(), letterbox));
        self
    }

    /// Use `handler` for the named throttle queue instead of its webhook.
    pub fn job_handler(mut self, queue: impl Into<String>, handler: Arc<dyn JobHandler<LetterJob>>) -> Self {
        self.job_handlers.insert(queue.into(), handler);
        self
    }

    pub async fn build(mut self) -> Result<App> {
        let config = self.config;
        config.validate()?;

        let broker = self.broker;
        let security = Arc::new(SecurityManager::new(config.security.clone()));

        let post_office_sender = broker.sender(&config.post_office.queue_name).await?;
        let postman = Arc::new(Postman::new(
            security.clone(),
            post_office_sender,
            config.post_office.queue_name.clone(),
        ));

        let mut post_office = PostOffice::new();
        let mut throttle_queues = IndexMap::new();

        for settings in &config.throttle_queues {
            let handler: Option<Arc<dyn JobHandler<LetterJob>>> = match self.job_handlers.remove(&settings.name) {
                Some(handler) => Some(handler),
                None => match &settings.webhook_url {
                    Some(url) => {
                        let webhook: Arc<dyn JobHandler<LetterJob>> = Arc::new(
                            WebhookJobHandler::new(url, config.handler_timeout())?.with_postman(postman.clone()),
                        );
                        Some(webhook)
                    }
                    None => {
                        tracing::warn!(
                            queue = %settings.name,
                            "No job handler or webhook URL configured; queue will not process jobs"
                        );
                        None
                    }
                },
            };

            let mut queue = ThrottleQueue::new(
                settings.clone(),
                broker.clone(),
                security.clone(),
                config.handler_timeout(),
                config.shutdown_grace(),
            );
            if let Some(handler) = handler {
                queue = queue.with_handler(handler);
            }
            let queue = Arc::new(queue);

            post_office.register_letterbox(settings.name.clone(), Arc::new(ForwardingLetterbox::new(queue.clone())));
            throttle_queues.insert(settings.name.clone(), queue);
        }

        post_office.register_letterbox(WORKFLOW_UTIL, Arc::new(WorkflowLetterbox));
        for (util, letterbox) in self.letterboxes {
            post_office.register_letterbox(util, letterbox);
        }

        for name in self.job_handlers.keys() {
            tracing::warn!(queue = %name, "Job handler supplied for unknown throttle queue");
        }

        let post_office = Arc::new(post_office);
        tracing::info!(letterboxes = ?post_office.registered_utils(), "Post office ready");

        let post_office_queue = Arc::new(PostOfficeQueue::new(
            config.post_office.clone(),
            broker.clone(),
            security.clone(),
            post_office.clone(),
            config.handler_timeout(),
            config.shutdown_grace(),
        ));

        let manager = throttle_queues.values().fold(QueueManager::new(post_office_queue), |m, q| {
            m.with_throttle_queue(q.clone())
        });

        Ok(App {
            config,
            broker,
            security,
            post_office,
            postman,
            manager: Arc::new(manager),
            throttle_queues,
        })
    }
}
