//! Side-Effect Hooks
//!
//! Extension points fired during a streaming invocation. Both recover
//! locally on failure -- log and continue, never abort the run.

pub mod archive;
pub mod scrub;
