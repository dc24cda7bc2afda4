//! Built-in letterboxes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Letterbox;
use crate::envelope::Message;
use crate::error::Result;
use crate::throttle::{LetterJob, ThrottleQueue};
use crate::workflow::{Metadata, Stage};

/// Util of the built-in workflow letterbox.
pub const WORKFLOW_UTIL: &str = "workflow";

/// Second hop: re-publish the message as a job on a subsystem queue.
pub struct ForwardingLetterbox {
    queue: Arc<ThrottleQueue<LetterJob>>,
}

impl ForwardingLetterbox {
    pub fn new(queue: Arc<ThrottleQueue<LetterJob>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Letterbox for ForwardingLetterbox {
    async fn deliver(&self, message: Message) -> Result<Value> {
        let job = LetterJob::from_message(message);
        self.queue.send_job(&job).await?;
        Ok(json!({ "queued": job.id, "queue": self.queue.name() }))
    }
}

/// Handles `progress`, `error` and `complete` notifications about a workflow.
pub struct WorkflowLetterbox;

impl WorkflowLetterbox {
    fn patch(payload: &Value, key: &str) -> Option<Metadata> {
        payload.get(key).and_then(Value::as_object).cloned()
    }
}

#[async_trait]
impl Letterbox for WorkflowLetterbox {
    async fn deliver(&self, message: Message) -> Result<Value> {
        let Message { kind, workflow, payload, .. } = message;

        let workflow = match kind.as_str() {
            "progress" => match payload.get("nextStage").and_then(Value::as_str) {
                Some(next) => {
                    let next: Stage = next.parse().map_err(crate::error::OfficeError::Admission)?;
                    workflow.progress_to_stage(next, Self::patch(&payload, "metadata"))
                }
                None => workflow,
            },
            "error" => {
                let error = payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified error");
                workflow.log_error(error)
            }
            "complete" => workflow.complete_stage(Self::patch(&payload, "results")),
            other => {
                tracing::warn!(batch_id = %workflow.batch_id(), "Unhandled workflow message type: {}", other);
                workflow
            }
        };

        let progress = workflow.get_progress();
        tracing::info!(
            batch_id = %progress.batch_id,
            item_id = progress.item_id.as_deref(),
            stage = %progress.current_stage,
            progress = progress.progress_percentage,
            errors = progress.error_count,
            "Workflow {}/{} stages complete",
            progress.completed_stages,
            progress.total_stages
        );

        Ok(serde_json::to_value(progress)?)
    }
}
