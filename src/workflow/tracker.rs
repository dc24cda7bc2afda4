//! Stage transitions for [`WorkflowContext`].
//!
//! Every transition borrows the input context and returns a new one. The input
//! is never modified, so concurrently running handlers holding copies of the
//! same batch cannot interfere with each other.

use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use super::{ItemType, Metadata, Stage, StageError, WorkflowContext};

/// Read-only summary of how far a context has progressed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub batch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub current_stage: Stage,
    pub completed_stages: usize,
    pub total_stages: usize,
    pub progress_percentage: u8,
    pub has_errors: bool,
    pub error_count: usize,
}

/// Build a batch id of the form `batch_<seed>_<unix-millis>_<random>`.
pub fn generate_batch_id(seed: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "batch_{}_{}_{}",
        seed,
        Utc::now().timestamp_millis(),
        &random[..6]
    )
}

/// Recover the creation time embedded in a batch id.
pub fn batch_started_at(batch_id: &str) -> Option<DateTime<Utc>> {
    static BATCH_ID: OnceLock<Regex> = OnceLock::new();
    let re = BATCH_ID.get_or_init(|| {
        Regex::new(r"^batch_.+_(\d{10,})_[0-9a-zA-Z]+$").expect("batch id pattern is valid")
    });

    let millis: i64 = re.captures(batch_id)?.get(1)?.as_str().parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn merge(base: &Metadata, patch: Option<Metadata>) -> Metadata {
    let mut merged = base.clone();
    if let Some(patch) = patch {
        merged.extend(patch);
    }
    merged
}

fn with_stage_recorded(completed: &[Stage], stage: Stage) -> Vec<Stage> {
    let mut stages = completed.to_vec();
    if !stages.contains(&stage) {
        stages.push(stage);
    }
    stages
}

impl WorkflowContext {
    /// Start a new batch at [`Stage::FindLocation`].
    pub fn create_batch(
        location_id: impl Into<String>,
        location_name: Option<String>,
        country_code: Option<String>,
        queries: Option<Vec<String>>,
    ) -> Self {
        let location_id = location_id.into();
        let batch_id = generate_batch_id(&location_id);

        let mut metadata = Metadata::new();
        if let Some(queries) = &queries {
            metadata.insert("queries".to_string(), serde_json::json!(queries));
        }

        tracing::info!(
            batch_id = %batch_id,
            location_id = %location_id,
            query_count = queries.as_ref().map_or(0, Vec::len),
            "Workflow batch created for location {}",
            location_name.as_deref().unwrap_or(&location_id)
        );

        Self {
            batch_id,
            location_id: Some(location_id),
            location_name,
            country_code,
            stage: Stage::FindLocation,
            timestamp: Utc::now(),
            item_id: None,
            item_url: None,
            item_type: None,
            completed_stages: Vec::new(),
            metadata,
            errors: Vec::new(),
        }
    }

    /// Fork a per-item context out of a batch that has finished crawling.
    pub fn create_item_context(
        &self,
        item_id: impl Into<String>,
        item_url: impl Into<String>,
        item_type: ItemType,
    ) -> Self {
        let item_id = item_id.into();
        let item_url = item_url.into();

        tracing::info!(
            batch_id = %self.batch_id,
            item_id = %item_id,
            item_url = %item_url.chars().take(100).collect::<String>(),
            ?item_type,
            "Item context created"
        );

        Self {
            item_id: Some(item_id),
            item_url: Some(item_url),
            item_type: Some(item_type),
            stage: Stage::PrepMedia,
            timestamp: Utc::now(),
            completed_stages: with_stage_recorded(&self.completed_stages, Stage::CrawlMedia),
            ..self.clone()
        }
    }

    /// Move to `next`, recording the current stage as completed.
    pub fn progress_to_stage(&self, next: Stage, metadata: Option<Metadata>) -> Self {
        let updated = Self {
            stage: next,
            timestamp: Utc::now(),
            completed_stages: with_stage_recorded(&self.completed_stages, self.stage),
            metadata: merge(&self.metadata, metadata),
            ..self.clone()
        };

        tracing::info!(
            batch_id = %self.batch_id,
            item_id = self.item_id.as_deref(),
            completed = updated.completed_stages.len(),
            total = Stage::ALL.len(),
            "Workflow progressed to {}",
            next
        );

        updated
    }

    /// Record the current stage as completed without moving on.
    pub fn complete_stage(&self, results: Option<Metadata>) -> Self {
        let updated = Self {
            timestamp: Utc::now(),
            completed_stages: with_stage_recorded(&self.completed_stages, self.stage),
            metadata: merge(&self.metadata, results),
            ..self.clone()
        };

        tracing::info!(
            batch_id = %self.batch_id,
            item_id = self.item_id.as_deref(),
            completed = updated.completed_stages.len(),
            total = Stage::ALL.len(),
            "Stage completed: {}",
            self.stage
        );

        if updated.is_complete() {
            let duration = batch_started_at(&self.batch_id)
                .map(|start| format!("{}s", (Utc::now() - start).num_seconds()))
                .unwrap_or_else(|| "unknown".to_string());
            tracing::info!(
                batch_id = %self.batch_id,
                item_id = self.item_id.as_deref(),
                duration = %duration,
                "Workflow complete for {}",
                if self.item_id.is_some() { "item" } else { "batch" }
            );
        }

        updated
    }

    /// Append an error for the current stage.
    pub fn log_error(&self, error: impl std::fmt::Display) -> Self {
        let now = Utc::now();
        let message = error.to_string();

        tracing::error!(
            batch_id = %self.batch_id,
            stage = %self.stage,
            item_id = self.item_id.as_deref(),
            "Workflow error: {}",
            message
        );

        let mut errors = self.errors.clone();
        errors.push(StageError {
            stage: self.stage,
            error: message,
            timestamp: now,
        });

        Self {
            timestamp: now,
            errors,
            ..self.clone()
        }
    }

    pub fn get_progress(&self) -> Progress {
        let total = Stage::ALL.len();
        // Distinct stages only; a context from the wire may repeat entries.
        let completed = Stage::ALL.iter().filter(|stage| self.has_completed(**stage)).count();
        let percentage = ((completed as f64 / total as f64) * 100.0).round() as u8;

        Progress {
            batch_id: self.batch_id.clone(),
            item_id: self.item_id.clone(),
            current_stage: self.stage,
            completed_stages: completed,
            total_stages: total,
            progress_percentage: percentage,
            has_errors: !self.errors.is_empty(),
            error_count: self.errors.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: serde_json::Value) -> Option<Metadata> {
        value.as_object().cloned()
    }

    fn batch() -> WorkflowContext {
        WorkflowContext::create_batch(
            "paris",
            Some("Paris".to_string()),
            Some("FR".to_string()),
            Some(vec!["hotels in paris".to_string()]),
        )
    }

    #[test]
    fn test_create_batch() {
        let ctx = batch();
        assert!(ctx.batch_id().starts_with("batch_paris_"));
        assert_eq!(ctx.stage(), Stage::FindLocation);
        assert!(ctx.completed_stages().is_empty());
        assert_eq!(ctx.metadata()["queries"], json!(["hotels in paris"]));
        assert!(batch_started_at(ctx.batch_id()).is_some());
    }

    #[test]
    fn test_progress_appends_previous_stage_once() {
        let ctx = batch();
        let once = ctx.progress_to_stage(Stage::Control, None);
        let twice = ctx.progress_to_stage(Stage::Control, None);

        assert_eq!(once.completed_stages(), &[Stage::FindLocation]);
        assert_eq!(twice.completed_stages(), &[Stage::FindLocation]);

        // Re-applying on an already-advanced context does not duplicate either.
        let again = once.complete_stage(None).progress_to_stage(Stage::CrawlMedia, None);
        assert_eq!(again.completed_stages(), &[Stage::FindLocation, Stage::Control]);
    }

    #[test]
    fn test_transitions_do_not_touch_input() {
        let ctx = batch();
        let before = ctx.clone();

        let _ = ctx.progress_to_stage(Stage::Control, patch(json!({"a": 1})));
        let _ = ctx.complete_stage(patch(json!({"b": 2})));
        let _ = ctx.log_error("boom");
        let _ = ctx.create_item_context("i", "http://u", ItemType::Image);

        assert_eq!(ctx, before);
    }

    #[test]
    fn test_progress_always_changes_stage_and_merges_metadata() {
        let ctx = batch();
        let next = ctx.progress_to_stage(Stage::Control, patch(json!({"queries": ["q2"], "extra": true})));

        assert_eq!(next.stage(), Stage::Control);
        assert_eq!(next.metadata()["queries"], json!(["q2"]));
        assert_eq!(next.metadata()["extra"], json!(true));
    }

    #[test]
    fn test_complete_stage_keeps_stage() {
        let ctx = batch().progress_to_stage(Stage::Control, None);
        let done = ctx.complete_stage(patch(json!({"result": "ok"})));

        assert_eq!(done.stage(), Stage::Control);
        assert!(done.has_completed(Stage::Control));
        assert_eq!(done.metadata()["result"], "ok");
        assert!(done.metadata().contains_key("queries"));
    }

    #[test]
    fn test_item_context_fork() {
        let crawling = batch()
            .progress_to_stage(Stage::Control, None)
            .progress_to_stage(Stage::CrawlMedia, None);

        let item = crawling.create_item_context("item1", "http://u", ItemType::Video);

        assert_eq!(item.stage(), Stage::PrepMedia);
        assert_eq!(item.item_id(), Some("item1"));
        assert_eq!(item.item_url(), Some("http://u"));
        assert_eq!(item.item_type(), Some(ItemType::Video));
        assert!(item.has_completed(Stage::CrawlMedia));
        assert_eq!(item.batch_id(), crawling.batch_id());
        assert_eq!(item.metadata(), crawling.metadata());
    }

    #[test]
    fn test_log_error_keeps_stage() {
        let ctx = batch().log_error("timeout").log_error("again");

        assert_eq!(ctx.stage(), Stage::FindLocation);
        assert_eq!(ctx.errors().len(), 2);
        assert_eq!(ctx.errors()[0].error, "timeout");
        assert_eq!(ctx.errors()[0].stage, Stage::FindLocation);
    }

    #[test]
    fn test_progress_full_and_errors() {
        let mut ctx = batch();
        for stage in Stage::ALL.iter().skip(1) {
            ctx = ctx.progress_to_stage(*stage, None);
        }
        let ctx = ctx.complete_stage(None);

        assert!(ctx.is_complete());
        let progress = ctx.get_progress();
        assert_eq!(progress.progress_percentage, 100);
        assert_eq!(progress.completed_stages, 6);
        assert!(!progress.has_errors);

        let progress = ctx.log_error("late failure").get_progress();
        assert_eq!(progress.progress_percentage, 100);
        assert!(progress.has_errors);
        assert_eq!(progress.error_count, 1);
    }

    #[test]
    fn test_partial_progress_rounds() {
        let ctx = batch().progress_to_stage(Stage::Control, None);
        // 1 of 6 stages
        assert_eq!(ctx.get_progress().progress_percentage, 17);
    }

    #[test]
    fn test_batch_started_at_rejects_garbage() {
        assert!(batch_started_at("b1").is_none());
        assert!(batch_started_at("batch_x_notanumber_abc").is_none());

        let parsed = batch_started_at("batch_loc_with_underscores_1700000000000_abc123").unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_progress_ignores_duplicate_stages_from_the_wire() {
        let ctx: WorkflowContext = serde_json::from_value(json!({
            "batchId": "batch_loc_1700000000000_abc123",
            "stage": "enrich-venue",
            "completedStages": ["control", "control", "control", "crawl-media", "crawl-media", "control", "control"]
        }))
        .unwrap();

        let progress = ctx.get_progress();
        assert_eq!(progress.completed_stages, 2);
        assert_eq!(progress.progress_percentage, 33);
    }
}
