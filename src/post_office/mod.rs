//! The post office: one inbound routing queue in front of many letterboxes.
//!
//! Producers go through the [`Postman`] admission gate, which publishes onto
//! the single post-office queue. The [`PostOfficeQueue`] consumer validates
//! each delivery and hands it to the [`PostOffice`] router, which picks the
//! letterbox registered for the message's util.

pub mod admission;
pub mod letterboxes;
pub mod queue;
pub mod router;

pub use admission::Postman;
pub use letterboxes::{ForwardingLetterbox, WorkflowLetterbox, WORKFLOW_UTIL};
pub use queue::PostOfficeQueue;
pub use router::{Letterbox, PostOffice, RouterHealth};
