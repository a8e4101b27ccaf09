//! Bridge Error Taxonomy
//!
//! Classifies failures so call sites can tell fatal conditions apart
//! from locally-recoverable ones. Application code otherwise uses
//! `anyhow` for propagation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or unparsable startup document. Fatal; the process
    /// exits non-zero after reporting one outbound error record.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// A corrupt message file or unreadable inbox directory. Always
    /// recovered locally (skip and log), never fatal.
    #[error("channel read failed: {0}")]
    ChannelRead(String),

    /// External backend executable missing or unlaunchable. Terminal
    /// for that invocation and surfaced, never a crash by itself.
    #[error("backend spawn failed: {0}")]
    BackendSpawn(String),

    /// The streaming backend's reasoning loop raised mid-invocation.
    /// Fatal for the whole process: continuity state after a partial
    /// failure cannot be trusted, so there is no automatic retry.
    #[error("backend runtime error: {0}")]
    BackendRuntime(String),
}
