//! Marker error types. Use `error_stack::Report<_>` with context attachments
//! for details.

use core::fmt;

/// An RPC to a peer failed at the transport level (refused, timed out, or
/// returned an unparseable body). Callers retry with backoff; the failure is
/// only surfaced once an outer deadline expires.
#[derive(Debug)]
pub struct RpcError;

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("rpc request failed")
    }
}

impl core::error::Error for RpcError {}

/// Invalid or inconsistent configuration at startup.
#[derive(Debug)]
pub struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid configuration")
    }
}

impl core::error::Error for ConfigError {}

/// The durable store could not persist state. An acceptor must never send an
/// affirmative reply after this; it is treated as fatal for the process.
#[derive(Debug)]
pub struct StoreFatal;

impl fmt::Display for StoreFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("durable store failure")
    }
}

impl core::error::Error for StoreFatal {}
