//! Outbound Side-Channel
//!
//! Every reportable event -- partial or final result text, a
//! session-update, a fatal error -- is appended as one JSON record per
//! line to an output file the host watches. The external collaborator
//! never has to infer failure from silence: a fatal condition always
//! produces exactly one error record before the process exits.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::types::OutputRecord;

/// Append-only writer for the outbound record stream. Shared between
/// the orchestrator and the active driver, since both report through
/// the same side-channel.
#[derive(Debug)]
pub struct OutputWriter {
    path: PathBuf,
}

impl OutputWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize one record and append it as a single line.
    pub fn write(&self, record: &OutputRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialize output record")?;
        debug!("Outbound record: {}", line);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open output file {}", self.path.display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }
}
