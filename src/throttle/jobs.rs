//! Job records carried on throttle queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Job;
use crate::envelope::Message;
use crate::workflow::WorkflowContext;

/// Where to send the result of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHandler {
    pub util: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A routed message re-published onto a subsystem queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterJob {
    pub id: String,
    pub util: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub workflow: WorkflowContext,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_handler: Option<ResponseHandler>,
    pub queued_at: DateTime<Utc>,
}

/// `<prefix>_<unix-millis>_<random>`
pub fn generate_job_id(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), &random[..6])
}

impl LetterJob {
    /// Wrap a routed message, lifting any `responseHandler` out of its payload.
    pub fn from_message(message: Message) -> Self {
        let response_handler = message
            .payload
            .get("responseHandler")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        Self {
            id: generate_job_id(&message.util),
            util: message.util,
            kind: message.kind,
            workflow: message.workflow,
            payload: message.payload,
            response_handler,
            queued_at: Utc::now(),
        }
    }
}

impl Job for LetterJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow() -> WorkflowContext {
        WorkflowContext::create_batch("loc", None, None, None)
    }

    #[test]
    fn test_from_message_lifts_response_handler() {
        let message = Message::new(
            "ai-service",
            "analyse",
            workflow(),
            json!({"prompt": "p", "responseHandler": {"util": "prep-media", "type": "ai_response"}}),
        );
        let job = LetterJob::from_message(message);

        assert!(job.id.starts_with("ai-service_"));
        assert_eq!(
            job.response_handler,
            Some(ResponseHandler {
                util: "prep-media".to_string(),
                kind: "ai_response".to_string()
            })
        );
        assert_eq!(job.payload["prompt"], "p");
    }

    #[test]
    fn test_malformed_response_handler_is_ignored() {
        let message = Message::new("ai-service", "", workflow(), json!({"responseHandler": 3}));
        assert!(LetterJob::from_message(message).response_handler.is_none());
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(generate_job_id("x"), generate_job_id("x"));
    }
}
