//! Default job handler: hand the job to a subsystem worker over HTTP.
//!
//! The worker answers with JSON. When the job names a response handler, the
//! answer is admitted back to the post office as a follow-up message that
//! carries the job's workflow context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{JobHandler, LetterJob};
use crate::envelope::Message;
use crate::error::{OfficeError, Result};
use crate::post_office::Postman;

pub struct WebhookJobHandler {
    client: reqwest::Client,
    url: String,
    postman: Option<Arc<Postman>>,
}

impl WebhookJobHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            postman: None,
        })
    }

    /// Send follow-ups for jobs that carry a response handler.
    pub fn with_postman(mut self, postman: Arc<Postman>) -> Self {
        self.postman = Some(postman);
        self
    }

    async fn follow_up(&self, job: &LetterJob, response: &Value) -> Result<()> {
        let (Some(handler), Some(postman)) = (&job.response_handler, &self.postman) else {
            return Ok(());
        };

        let message = Message::new(
            handler.util.clone(),
            handler.kind.clone(),
            job.workflow.clone(),
            json!({
                "jobId": job.id,
                "sourceUtil": job.util,
                "result": response,
            }),
        );

        let message_id = postman.send_follow_up(message).await?;
        tracing::debug!(
            job_id = %job.id,
            util = %handler.util,
            message_id = %message_id,
            "Follow-up admitted"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler<LetterJob> for WebhookJobHandler {
    async fn handle(&self, job: LetterJob) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(&job)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OfficeError::Handler(format!(
                "Worker at {} returned {}: {}",
                self.url,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let text = response.text().await?;
        let result = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        self.follow_up(&job, &result).await?;
        Ok(result)
    }
}
