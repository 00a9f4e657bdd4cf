//! Proposer service: drives consensus and holds leadership.

#![warn(clippy::pedantic)]

pub mod api;
pub mod election;
pub mod node;
pub mod state;

pub use api::{ApiState, router};
pub use node::{NodeConfig, ProposerNode};
pub use state::RoundStore;
