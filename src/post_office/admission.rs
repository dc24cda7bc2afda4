//! Admission gate in front of the post-office queue.
//!
//! Nothing reaches the broker unless the caller presented the admission
//! secret and the envelope has a util, a workflow context and an object
//! payload. The secret is checked first so an unauthenticated caller learns
//! nothing about the envelope rules.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::broker::{OutboundMessage, Properties, QueueSender};
use crate::envelope::{AdmissionRequest, Message};
use crate::error::{OfficeError, Result};
use crate::security::SecurityManager;

pub struct Postman {
    security: Arc<SecurityManager>,
    sender: Arc<dyn QueueSender>,
    queue_name: String,
}

impl Postman {
    pub fn new(security: Arc<SecurityManager>, sender: Arc<dyn QueueSender>, queue_name: impl Into<String>) -> Self {
        Self {
            security,
            sender,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Validate `request` and publish it on the post-office queue.
    ///
    /// Returns the message id the envelope was published under.
    pub async fn send_to_post_office(&self, request: AdmissionRequest) -> Result<String> {
        if let Err(e) = self.security.validate_admission_secret(request.presented_secret()) {
            tracing::warn!(
                target: "postoffice::security",
                util = request.util.as_deref().unwrap_or("-"),
                "Admission refused: {}",
                e
            );
            return Err(e);
        }

        let mut message = Self::validate(request.util, request.kind, request.workflow, request.payload)?;
        if let Value::Object(payload) = &mut message.payload {
            payload.remove("apiSecret");
        }
        let message_id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());

        self.publish(message, message_id).await
    }

    /// Admit a message produced inside this process, e.g. a job follow-up.
    pub async fn send_follow_up(&self, message: Message) -> Result<String> {
        let request = AdmissionRequest::from_message(message, self.security.admission_secret());
        self.send_to_post_office(request).await
    }

    fn validate(
        util: Option<String>,
        kind: Option<String>,
        workflow: Option<crate::workflow::WorkflowContext>,
        payload: Option<Value>,
    ) -> Result<Message> {
        let util = util
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| OfficeError::Admission("message.util is required".to_string()))?;

        let kind = match kind.filter(|k| !k.is_empty()) {
            Some(kind) => kind,
            None => {
                tracing::warn!(util = %util, "Admitting message without a type");
                String::new()
            }
        };

        let workflow = workflow
            .ok_or_else(|| OfficeError::Admission("message.workflow is required and must be an object".to_string()))?;

        let payload = match payload {
            Some(payload @ Value::Object(_)) => payload,
            _ => {
                return Err(OfficeError::Admission(
                    "message.payload is required and must be an object".to_string(),
                ))
            }
        };

        Ok(Message::new(util, kind, workflow, payload))
    }

    async fn publish(&self, message: Message, message_id: String) -> Result<String> {
        let mut properties = Properties::new();
        properties.insert("type".to_string(), message.kind.clone());
        let properties = self.security.add_message_security(properties);

        let outbound = OutboundMessage::json(Some(message_id.clone()), properties, &message)?;
        self.sender.send(outbound).await?;

        tracing::debug!(
            queue = %self.queue_name,
            util = %message.util,
            batch_id = %message.workflow.batch_id(),
            message_id = %message_id,
            "Message admitted to post office"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::error::BrokerError;
    use crate::workflow::WorkflowContext;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl QueueSender for RecordingSender {
        async fn send(&self, message: OutboundMessage) -> std::result::Result<(), BrokerError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&self) -> std::result::Result<(), BrokerError> {
            Ok(())
        }
    }

    fn postman() -> (Postman, Arc<RecordingSender>) {
        let security = Arc::new(SecurityManager::new(SecurityConfig {
            message_security_token: "transit".to_string(),
            admission_secret: "admission".to_string(),
            ..SecurityConfig::default()
        }));
        let sender = Arc::new(RecordingSender::default());
        (Postman::new(security, sender.clone(), "post-office"), sender)
    }

    fn request(secret: &str) -> AdmissionRequest {
        AdmissionRequest {
            util: Some("ai-service".to_string()),
            kind: Some("analyse".to_string()),
            workflow: Some(WorkflowContext::create_batch("loc", None, None, None)),
            payload: Some(json!({"url": "http://u"})),
            api_secret: Some(secret.to_string()),
            id: None,
        }
    }

    #[tokio::test]
    async fn test_wrong_secret_never_sends() {
        let (postman, sender) = postman();
        let err = postman.send_to_post_office(request("wrong")).await.unwrap_err();

        assert!(matches!(err, OfficeError::Unauthorized(_)));
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secret_checked_before_fields() {
        let (postman, sender) = postman();
        let err = postman
            .send_to_post_office(AdmissionRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, OfficeError::Unauthorized(_)));
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let (postman, sender) = postman();

        let mut no_util = request("admission");
        no_util.util = None;
        assert!(matches!(postman.send_to_post_office(no_util).await, Err(OfficeError::Admission(_))));

        let mut no_workflow = request("admission");
        no_workflow.workflow = None;
        assert!(postman.send_to_post_office(no_workflow).await.is_err());

        let mut array_payload = request("admission");
        array_payload.payload = Some(json!([1, 2]));
        assert!(postman.send_to_post_office(array_payload).await.is_err());

        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admitted_message_is_stamped() {
        let (postman, sender) = postman();
        let mut req = request("admission");
        req.kind = None;
        let id = postman.send_to_post_office(req.with_id("msg-1")).await.unwrap();

        assert_eq!(id, "msg-1");
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id.as_deref(), Some("msg-1"));
        assert_eq!(sent[0].properties.get("securityToken").map(String::as_str), Some("transit"));

        let body: Value = serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(body["util"], "ai-service");
        assert_eq!(body["type"], "");
        assert!(body.get("apiSecret").is_none());
    }

    #[tokio::test]
    async fn test_nested_secret_accepted_and_stripped() {
        let (postman, sender) = postman();
        let mut req = request("ignored");
        req.api_secret = None;
        req.payload = Some(json!({"url": "http://u", "apiSecret": "admission"}));

        postman.send_to_post_office(req).await.unwrap();

        let sent = sender.sent.lock().unwrap();
        let body: Value = serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(body["payload"]["url"], "http://u");
        assert!(body["payload"].get("apiSecret").is_none());
    }

    #[tokio::test]
    async fn test_follow_up_uses_configured_secret() {
        let (postman, sender) = postman();
        let message = Message::new(
            "workflow",
            "progress",
            WorkflowContext::create_batch("loc", None, None, None),
            json!({}),
        );
        postman.send_follow_up(message).await.unwrap();
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }
}
