//! External-Process Backend
//!
//! Runs one subprocess per invocation: the prompt and any prior
//! session id go in as arguments, the captured stdout comes back as
//! the result text. There is no live message feed -- input arriving
//! mid-invocation waits for the next one. A batch call also gives us
//! no way to learn a newly assigned session id, so continuity degrades
//! to echoing back what was passed in; that limitation is surfaced,
//! not hidden.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;
use crate::output::OutputWriter;
use crate::types::{AgentDriver, OutputRecord, QueryResult};

use super::DriverConfig;

pub struct SubprocessDriver {
    config: DriverConfig,
    writer: Arc<OutputWriter>,
}

impl SubprocessDriver {
    pub fn new(config: DriverConfig, writer: Arc<OutputWriter>) -> Self {
        Self { config, writer }
    }
}

#[async_trait]
impl AgentDriver for SubprocessDriver {
    async fn run(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        resume_at: Option<&str>,
    ) -> Result<QueryResult> {
        let mut cmd = Command::new(&self.config.agent_bin);
        cmd.arg(prompt);
        if let Some(sid) = session_id {
            cmd.args(["--session", sid]);
        }
        cmd.arg("--tool-bridge").arg(&self.config.tool_bridge);
        cmd.env_clear().envs(&self.config.env);
        cmd.stdin(Stdio::null());

        if resume_at.is_some() {
            debug!("Resume marker is not supported by the subprocess backend; ignored");
        }
        info!("Spawning {} for one-shot invocation", self.config.agent_bin);

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                let message = format!("{}: {}", self.config.agent_bin, e);
                if let Err(w) = self.writer.write(&OutputRecord::error(&message)) {
                    error!("Failed to report spawn failure: {:#}", w);
                }
                return Err(BridgeError::BackendSpawn(message).into());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string();
        let stderr = String::from_utf8_lossy(&output.stderr)
            .trim_end()
            .to_string();

        if output.status.success() {
            self.writer
                .write(&OutputRecord::success(stdout, session_id.map(str::to_string)))?;
        } else {
            warn!("Backend exited with {}", output.status);
            self.writer.write(&OutputRecord::error(stderr))?;
        }

        if session_id.is_none() {
            warn!(
                "Subprocess backend cannot report a newly assigned session id; \
                 session continuity is degraded for this conversation"
            );
        }

        Ok(QueryResult {
            session_id: session_id.map(str::to_string),
            resume_at: resume_at.map(str::to_string),
            closed_during_query: false,
        })
    }
}
