//! Client gateway: routes writes to the leader and reads per consistency.

#![warn(clippy::pedantic)]

pub mod api;
pub mod routing;

pub use api::{ApiState, router};
pub use routing::Gateway;
