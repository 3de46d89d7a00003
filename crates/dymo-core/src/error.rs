//! Error types for the DYMO engine.

use crate::address::Address;
use thiserror::Error;

/// DYMO error type
///
/// Only conditions the engine cannot recover from are surfaced here. Dropped
/// control traffic (rate limiting, metric overflow, lost sequence number) is
/// logged and counted instead.
#[derive(Error, Debug)]
pub enum DymoError {
    /// Routing table was asked to remove an entry it does not hold
    #[error("unknown routing entry {address}/{prefix}")]
    UnknownEntry { address: Address, prefix: u8 },

    /// Frame carried a message kind this engine does not understand
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u8),

    /// Frame was truncated or otherwise malformed
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Symbolic destination name could not be mapped to an address
    #[error("cannot resolve destination {0:?}")]
    UnresolvedDestination(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON error while loading configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for DYMO operations
pub type Result<T> = std::result::Result<T, DymoError>;
