//! Message envelopes carried through the post office
//!
//! `Message` is the validated routing envelope that travels on the broker.
//! `AdmissionRequest` is what a producer hands to the admission gate before
//! any of it has been checked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowContext;

/// Routing envelope published on the post-office queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key selecting the letterbox
    pub util: String,

    /// Sub-kind interpreted by the letterbox
    #[serde(rename = "type", default)]
    pub kind: String,

    pub workflow: WorkflowContext,

    /// Free-form JSON object
    pub payload: Value,
}

impl Message {
    pub fn new(util: impl Into<String>, kind: impl Into<String>, workflow: WorkflowContext, payload: Value) -> Self {
        Self {
            util: util.into(),
            kind: kind.into(),
            workflow,
            payload,
        }
    }
}

/// Unvalidated submission to the admission gate.
///
/// Every field is optional here so that validation can report exactly what is
/// missing instead of failing on deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionRequest {
    #[serde(default)]
    pub util: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub workflow: Option<WorkflowContext>,

    #[serde(default)]
    pub payload: Option<Value>,

    /// Shared admission secret
    #[serde(rename = "apiSecret", default, skip_serializing)]
    pub api_secret: Option<String>,

    /// Message id; reused for broker de-duplication when present
    #[serde(default)]
    pub id: Option<String>,
}

impl AdmissionRequest {
    /// Build a request from an already-formed message.
    pub fn from_message(message: Message, api_secret: impl Into<String>) -> Self {
        Self {
            util: Some(message.util),
            kind: Some(message.kind),
            workflow: Some(message.workflow),
            payload: Some(message.payload),
            api_secret: Some(api_secret.into()),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Secret carried by a raw admission body, read before the body is
    /// parsed so malformed envelopes are still authenticated first.
    pub fn secret_in(body: &Value) -> Option<&str> {
        body.get("apiSecret").and_then(Value::as_str).or_else(|| {
            body.get("payload")
                .and_then(|p| p.get("apiSecret"))
                .and_then(Value::as_str)
        })
    }

    /// The secret from the top level, falling back to one nested in the payload.
    pub fn presented_secret(&self) -> Option<&str> {
        self.api_secret.as_deref().or_else(|| {
            self.payload
                .as_ref()
                .and_then(|p| p.get("apiSecret"))
                .and_then(Value::as_str)
        })
    }
}

/// Response returned to a producer after admission
#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub message_id: String,
    pub status: AdmissionStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionStatus {
    Accepted,   // Queued on the post-office queue
    Rejected,   // Validation or authentication failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let message: Message = serde_json::from_value(json!({
            "util": "ai-service",
            "type": "analyse",
            "workflow": {"batchId": "b1", "stage": "analyse-media"},
            "payload": {"url": "http://u"}
        }))
        .unwrap();

        assert_eq!(message.kind, "analyse");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "analyse");
        assert_eq!(value["workflow"]["batchId"], "b1");
    }

    #[test]
    fn test_admission_request_is_lenient() {
        let request: AdmissionRequest = serde_json::from_value(json!({
            "util": "x",
            "payload": {"apiSecret": "nested"}
        }))
        .unwrap();

        assert!(request.workflow.is_none());
        assert!(request.kind.is_none());
        assert_eq!(request.presented_secret(), Some("nested"));
    }

    #[test]
    fn test_api_secret_never_serialized() {
        let request = AdmissionRequest {
            api_secret: Some("s".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("apiSecret").is_none());
    }
}
