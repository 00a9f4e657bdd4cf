//! Learner service: orders chosen values into the log and serves reads.

#![warn(clippy::pedantic)]

pub mod api;
pub mod catchup;
pub mod ledger;
pub mod notify;
pub mod service;

pub use api::{ApiState, router};
pub use ledger::Ledger;
pub use notify::SubscriptionRegistry;
pub use service::LearnerService;
