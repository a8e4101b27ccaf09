//! Emissary -- Sandbox Agent Bridge
//!
//! Runs an autonomous conversational agent inside an isolated sandbox
//! and bridges it to a host process through a mounted filesystem: live
//! message injection, a stop sentinel, and a resumable query loop over
//! pluggable agent backends.

pub mod types;
pub mod error;
pub mod input;
pub mod channel;
pub mod output;
pub mod driver;
pub mod hooks;
pub mod orchestrator;
