//! Workflow context propagated through every message.
//!
//! A [`WorkflowContext`] is created once per batch and copied-and-extended at
//! every stage boundary. It has no public mutators: the transition methods in
//! [`tracker`] take `&self` and return a fresh value, so two handlers can never
//! observe each other's changes.

pub mod tracker;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use tracker::{batch_started_at, generate_batch_id, Progress};

/// Accumulated stage outputs keyed by name.
pub type Metadata = serde_json::Map<String, Value>;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    FindLocation,
    /// Query generation
    Control,
    CrawlMedia,
    /// Download and prepare
    PrepMedia,
    AnalyseMedia,
    EnrichVenue,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::FindLocation,
        Stage::Control,
        Stage::CrawlMedia,
        Stage::PrepMedia,
        Stage::AnalyseMedia,
        Stage::EnrichVenue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FindLocation => "find-location",
            Stage::Control => "control",
            Stage::CrawlMedia => "crawl-media",
            Stage::PrepMedia => "prep-media",
            Stage::AnalyseMedia => "analyse-media",
            Stage::EnrichVenue => "enrich-venue",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown stage: {}", s))
    }
}

/// Kind of media item a per-item context tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Video,
    Image,
    Post,
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(ItemType::Video),
            "image" => Ok(ItemType::Image),
            "post" => Ok(ItemType::Post),
            other => Err(format!("Unknown item type: {}", other)),
        }
    }
}

/// One entry of the append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Identity, stage and history of a batch (or one item forked from it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub(crate) batch_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) location_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) location_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) country_code: Option<String>,

    pub(crate) stage: Stage,

    #[serde(default = "Utc::now")]
    pub(crate) timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) item_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) item_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) item_type: Option<ItemType>,

    #[serde(default)]
    pub(crate) completed_stages: Vec<Stage>,

    #[serde(default)]
    pub(crate) metadata: Metadata,

    #[serde(default)]
    pub(crate) errors: Vec<StageError>,
}

impl WorkflowContext {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn location_id(&self) -> Option<&str> {
        self.location_id.as_deref()
    }

    pub fn location_name(&self) -> Option<&str> {
        self.location_name.as_deref()
    }

    pub fn country_code(&self) -> Option<&str> {
        self.country_code.as_deref()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn item_id(&self) -> Option<&str> {
        self.item_id.as_deref()
    }

    pub fn item_url(&self) -> Option<&str> {
        self.item_url.as_deref()
    }

    pub fn item_type(&self) -> Option<ItemType> {
        self.item_type
    }

    pub fn completed_stages(&self) -> &[Stage] {
        &self.completed_stages
    }

    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    /// True once every known stage has been recorded as completed.
    pub fn is_complete(&self) -> bool {
        Stage::ALL.iter().all(|s| self.completed_stages.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_order_and_names() {
        assert_eq!(Stage::FindLocation.next(), Some(Stage::Control));
        assert_eq!(Stage::EnrichVenue.next(), None);
        assert_eq!("analyse-media".parse::<Stage>().unwrap(), Stage::AnalyseMedia);
        assert!("unknown".parse::<Stage>().is_err());
        assert_eq!(serde_json::to_value(Stage::CrawlMedia).unwrap(), json!("crawl-media"));
    }

    #[test]
    fn test_deserialize_minimal_context() {
        let ctx: WorkflowContext = serde_json::from_value(json!({
            "batchId": "b1",
            "stage": "find-location",
            "completedStages": []
        }))
        .expect("minimal context should parse");

        assert_eq!(ctx.batch_id(), "b1");
        assert_eq!(ctx.stage(), Stage::FindLocation);
        assert!(ctx.metadata().is_empty());
        assert!(ctx.errors().is_empty());
        assert!(ctx.item_id().is_none());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let ctx: WorkflowContext = serde_json::from_value(json!({
            "batchId": "b1",
            "locationId": "loc",
            "stage": "prep-media",
            "itemId": "i1",
            "itemType": "video",
            "completedStages": ["find-location"]
        }))
        .unwrap();

        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["batchId"], "b1");
        assert_eq!(value["itemType"], "video");
        assert_eq!(value["completedStages"], json!(["find-location"]));
        assert!(value.get("locationName").is_none());
    }
}
