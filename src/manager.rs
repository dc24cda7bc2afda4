//! Lifecycle control for every queue in the process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;

use crate::error::{OfficeError, Result};

/// A queue whose consumer can be started and stopped as a unit.
#[async_trait]
pub trait ManagedQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Open broker handles. Idempotent.
    async fn initialize(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Stop consuming and release broker handles. Safe when never started.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

pub struct QueueManager {
    post_office: Arc<dyn ManagedQueue>,
    throttle_queues: IndexMap<String, Arc<dyn ManagedQueue>>,
}

impl QueueManager {
    pub fn new(post_office: Arc<dyn ManagedQueue>) -> Self {
        Self {
            post_office,
            throttle_queues: IndexMap::new(),
        }
    }

    pub fn with_throttle_queue(mut self, queue: Arc<dyn ManagedQueue>) -> Self {
        self.throttle_queues.insert(queue.name().to_string(), queue);
        self
    }

    fn find(&self, name: &str) -> Result<&Arc<dyn ManagedQueue>> {
        if name == self.post_office.name() {
            return Ok(&self.post_office);
        }
        self.throttle_queues
            .get(name)
            .ok_or_else(|| OfficeError::UnknownQueue(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        std::iter::once(self.post_office.name().to_string())
            .chain(self.throttle_queues.keys().cloned())
            .collect()
    }

    /// Open broker handles for the post office and every throttle queue.
    pub async fn initialize_all_queues(&self) -> Result<()> {
        self.post_office.initialize().await?;
        for queue in self.throttle_queues.values() {
            queue.initialize().await?;
        }
        tracing::info!(queues = ?self.queue_names(), "All queues initialized");
        Ok(())
    }

    /// Start every throttle queue, reopening handles closed by an earlier
    /// stop. A queue that fails to start is logged and skipped so the rest
    /// still run.
    pub async fn start_all_throttle_queues(&self) -> Result<()> {
        for (name, queue) in &self.throttle_queues {
            let started = match queue.initialize().await {
                Ok(()) => queue.start().await,
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                tracing::warn!(queue = %name, "Throttle queue not started: {}", e);
            }
        }
        Ok(())
    }

    pub async fn stop_all_throttle_queues(&self) -> Result<()> {
        let results = join_all(self.throttle_queues.values().map(|q| q.stop())).await;
        for (name, result) in self.throttle_queues.keys().zip(results) {
            if let Err(e) = result {
                tracing::error!(queue = %name, "Failed to stop throttle queue: {}", e);
            }
        }
        tracing::info!("All throttle queues stopped");
        Ok(())
    }

    pub async fn start_post_office(&self) -> Result<()> {
        self.post_office.initialize().await?;
        self.post_office.start().await
    }

    pub async fn stop_post_office(&self) -> Result<()> {
        self.post_office.stop().await
    }

    /// Start one queue by name, opening its handles first if needed.
    pub async fn start_queue(&self, name: &str) -> Result<()> {
        let queue = self.find(name)?;
        queue.initialize().await?;
        queue.start().await
    }

    pub async fn stop_queue(&self, name: &str) -> Result<()> {
        self.find(name)?.stop().await
    }

    /// Running state of every queue, post office first.
    pub fn queue_status(&self) -> IndexMap<String, bool> {
        std::iter::once((self.post_office.name().to_string(), self.post_office.is_running()))
            .chain(
                self.throttle_queues
                    .iter()
                    .map(|(name, q)| (name.clone(), q.is_running())),
            )
            .collect()
    }

    /// Stop the router first so no new jobs are forwarded, then drain the
    /// throttle queues.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down post office and throttle queues");
        if let Err(e) = self.stop_post_office().await {
            tracing::error!("Failed to stop post-office queue: {}", e);
        }
        self.stop_all_throttle_queues().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeQueue {
        name: String,
        running: AtomicBool,
        fail_start: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeQueue {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                running: AtomicBool::new(false),
                fail_start: false,
                log,
            })
        }
    }

    #[async_trait]
    impl ManagedQueue for FakeQueue {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(OfficeError::NotInitialized("handler".to_string()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn manager(log: Arc<Mutex<Vec<String>>>) -> QueueManager {
        let broken = Arc::new(FakeQueue {
            name: "search-crawl".to_string(),
            running: AtomicBool::new(false),
            fail_start: true,
            log: log.clone(),
        });
        QueueManager::new(FakeQueue::new("post-office", log.clone()))
            .with_throttle_queue(FakeQueue::new("ai-service", log.clone()))
            .with_throttle_queue(FakeQueue::new("prep-media", log))
            .with_throttle_queue(broken)
    }

    #[tokio::test]
    async fn test_start_all_skips_failures() {
        let m = manager(Arc::default());
        m.initialize_all_queues().await.unwrap();
        m.start_all_throttle_queues().await.unwrap();

        let status = m.queue_status();
        assert_eq!(status.keys().collect::<Vec<_>>(), ["post-office", "ai-service", "prep-media", "search-crawl"]);
        assert!(!status["post-office"]);
        assert!(status["ai-service"]);
        assert!(status["prep-media"]);
        assert!(!status["search-crawl"]);
    }

    #[tokio::test]
    async fn test_start_and_stop_single_queue() {
        let m = manager(Arc::default());
        m.start_queue("ai-service").await.unwrap();
        assert!(m.queue_status()["ai-service"]);

        m.stop_queue("ai-service").await.unwrap();
        assert!(!m.queue_status()["ai-service"]);

        assert!(matches!(m.start_queue("nope").await, Err(OfficeError::UnknownQueue(_))));
        assert!(matches!(m.stop_queue("nope").await, Err(OfficeError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_post_office_first() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let m = manager(log.clone());
        m.start_post_office().await.unwrap();
        m.start_all_throttle_queues().await.unwrap();

        m.shutdown().await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log[0], "stop post-office");
        assert_eq!(log.len(), 4);
        assert!(m.queue_status().values().all(|running| !running));
    }
}
