//! Shared types, wire messages, and cluster plumbing for the chorus store.

#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod messages;
pub mod rpc;
pub mod types;

pub use config::{Peers, quorum_size};
pub use error::{ConfigError, RpcError, StoreFatal};
pub use rpc::{BackoffConfig, RpcClient};
pub use types::{
    AcceptorId, ClientId, Command, Consistency, Epoch, InstanceId, LearnerId, ProposalNum,
    ProposerId, Role, Slot,
};
