//! Acceptor service: the durable voter of the cluster.

#![warn(clippy::pedantic)]

pub mod api;
pub mod metrics;
pub mod service;
pub mod store;

pub use api::{ApiState, router};
pub use metrics::{AcceptorMetrics, MetricsEncoder, SharedMetrics};
pub use service::AcceptorService;
pub use store::SlotStore;
