//! # Postoffice: broker-backed orchestration for multi-stage pipelines
//!
//! Postoffice is the substrate that lets independent pipeline stages talk to
//! each other exclusively through a durable message broker (NATS JetStream).
//!
//! ## Features
//!
//! - **Single routing queue**: every message enters through one post-office
//!   queue and is dispatched by `util` to a registered letterbox
//! - **Throttle queues**: one bounded-concurrency queue per expensive
//!   downstream subsystem, all built from the same generic type
//! - **Workflow tracking**: an immutable context value carried in every
//!   message records stage, history, metadata and errors
//! - **Admission and transit checks**: shared secrets gate what may be
//!   published and what may be processed
//! - **Explicit acknowledgement**: every delivery is completed, abandoned
//!   for redelivery, or dead-lettered
//!
//! ## Message envelope
//!
//! ```json
//! {
//!   "util": "ai-service",
//!   "type": "analyse",
//!   "workflow": { "batchId": "batch_paris_1700000000000_a1b2c3", "stage": "analyse-media" },
//!   "payload": { "url": "https://example.com/image.jpg" }
//! }
//! ```
//!
//! ## Wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use postoffice::{App, MemoryBroker, OfficeConfig};
//!
//! # async fn run() -> postoffice::Result<()> {
//! let config = OfficeConfig::from_env()?;
//! let app = App::build(config, Arc::new(MemoryBroker::default())).await?;
//! app.start().await?;
//! # Ok(())
//! # }
//! ```

// Core types
pub mod config;
pub mod envelope;
pub mod error;
pub mod security;
pub mod workflow;

// Transport
pub mod broker;

// Queues and routing
pub mod manager;
pub mod post_office;
pub mod throttle;

// Process wiring
pub mod api;
pub mod app;
pub mod logging;

// Re-export key types
pub use app::{App, AppBuilder};
pub use broker::{Broker, Delivery, MemoryBroker, NatsBroker, OutboundMessage, Properties, RedeliveryBackoff};
pub use config::{BrokerConfig, OfficeConfig, QueueSettings, SecurityConfig};
pub use envelope::{AdmissionRequest, AdmissionResponse, AdmissionStatus, Message};
pub use error::{BrokerError, OfficeError, Result};
pub use manager::{ManagedQueue, QueueManager};
pub use post_office::{Letterbox, PostOffice, PostOfficeQueue, Postman};
pub use security::SecurityManager;
pub use throttle::{DeliveryOutcome, Job, JobHandler, LetterJob, ResponseHandler, ThrottleQueue, WebhookJobHandler};
pub use workflow::{ItemType, Metadata, Progress, Stage, StageError, WorkflowContext};
