use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::Message;
use crate::error::{OfficeError, Result};

/// Handler for one util. An error means "retry me".
///
/// The message is passed by value: a letterbox owns its copy of the workflow
/// context and cannot affect anyone else's.
#[async_trait]
pub trait Letterbox: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> Letterbox for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn deliver(&self, message: Message) -> Result<Value> {
        (self)(message).await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterHealth {
    pub registered_letterboxes: Vec<String>,
    pub letterbox_count: usize,
}

/// Registry mapping each util to its letterbox.
///
/// Filled in during start-up and only read afterwards.
#[derive(Default)]
pub struct PostOffice {
    letterboxes: IndexMap<String, Arc<dyn Letterbox>>,
}

impl PostOffice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `letterbox` for `util`, replacing any previous registration.
    pub fn register_letterbox(&mut self, util: impl Into<String>, letterbox: Arc<dyn Letterbox>) {
        let util = util.into();
        tracing::debug!(util = %util, "Letterbox registered");
        self.letterboxes.insert(util, letterbox);
    }

    /// Deliver `message` to the letterbox registered for its util.
    pub async fn route_message(&self, message: Message) -> Result<Value> {
        let util = message.util.clone();
        let kind = message.kind.clone();
        let batch_id = message.workflow.batch_id().to_string();

        tracing::debug!(util = %util, kind = %kind, batch_id = %batch_id, "Routing message");

        let Some(letterbox) = self.letterboxes.get(&util) else {
            tracing::error!(
                util = %util,
                available = ?self.registered_utils(),
                "No letterbox found for util: {}",
                util
            );
            return Err(OfficeError::UnknownUtil(util));
        };

        match letterbox.deliver(message).await {
            Ok(result) => {
                tracing::debug!(util = %util, kind = %kind, "Message delivered to {} letterbox", util);
                Ok(result)
            }
            Err(e) => {
                tracing::error!(
                    util = %util,
                    kind = %kind,
                    batch_id = %batch_id,
                    "Failed to deliver message to {} letterbox: {}",
                    util,
                    e
                );
                Err(e)
            }
        }
    }

    pub fn registered_utils(&self) -> Vec<String> {
        self.letterboxes.keys().cloned().collect()
    }

    pub fn has_letterbox(&self, util: &str) -> bool {
        self.letterboxes.contains_key(util)
    }

    pub fn health(&self) -> RouterHealth {
        RouterHealth {
            registered_letterboxes: self.registered_utils(),
            letterbox_count: self.letterboxes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowContext;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(util: &str) -> Message {
        Message::new(util, "t", WorkflowContext::create_batch("loc", None, None, None), json!({}))
    }

    fn counting(counter: Arc<AtomicUsize>, reply: &'static str) -> Arc<dyn Letterbox> {
        Arc::new(move |_message: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OfficeError>(json!(reply))
            }
        })
    }

    #[tokio::test]
    async fn test_routes_to_matching_letterbox_only() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let mut office = PostOffice::new();
        office.register_letterbox("a", counting(a.clone(), "from-a"));
        office.register_letterbox("b", counting(b.clone(), "from-b"));

        let result = office.route_message(message("a")).await.unwrap();

        assert_eq!(result, json!("from-a"));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_util() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut office = PostOffice::new();
        office.register_letterbox("a", counting(calls.clone(), "a"));

        let err = office.route_message(message("x")).await.unwrap_err();

        assert_eq!(err.to_string(), "Unknown util: x");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reregistration_overwrites() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut office = PostOffice::new();
        office.register_letterbox("a", counting(first.clone(), "1"));
        office.register_letterbox("a", counting(second.clone(), "2"));

        assert_eq!(office.route_message(message("a")).await.unwrap(), json!("2"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(office.health().letterbox_count, 1);
    }

    #[tokio::test]
    async fn test_handler_error_propagates_unchanged() {
        let mut office = PostOffice::new();
        office.register_letterbox(
            "a",
            Arc::new(|_m: Message| async { Err::<Value, _>(OfficeError::handler("downstream")) }),
        );

        let err = office.route_message(message("a")).await.unwrap_err();
        assert!(matches!(err, OfficeError::Handler(ref m) if m == "downstream"));
    }

    #[test]
    fn test_health_lists_utils_in_registration_order() {
        let mut office = PostOffice::new();
        office.register_letterbox("z", counting(Arc::new(AtomicUsize::new(0)), "z"));
        office.register_letterbox("a", counting(Arc::new(AtomicUsize::new(0)), "a"));

        assert!(office.has_letterbox("z"));
        assert!(!office.has_letterbox("q"));
        let health = serde_json::to_value(office.health()).unwrap();
        assert_eq!(health, json!({"registeredLetterboxes": ["z", "a"], "letterboxCount": 2}));
    }
}
