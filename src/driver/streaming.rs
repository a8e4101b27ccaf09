//! Streaming (In-Process) Backend
//!
//! Runs the agent CLI once per invocation in stream-json mode: the
//! prompt and any live-injected messages are pushed onto its stdin
//! while the reasoning loop is active, and typed events are parsed off
//! its stdout. A poller task drains the live-message channel at a
//! fixed interval for the lifetime of the invocation only; when the
//! stop sentinel appears the input feed is closed, signaling
//! end-of-input, and the backend winds down on its own.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{MessageChannel, POLL_INTERVAL};
use crate::error::BridgeError;
use crate::hooks::{archive, scrub};
use crate::output::OutputWriter;
use crate::types::{AgentDriver, AgentEvent, OutputRecord, QueryResult};

use super::DriverConfig;

/// Items flowing into the child's stdin. Single producer role (the
/// poller, plus the initial prompt), single consumer role (the stdin
/// writer task).
enum FeedItem {
    /// The initial prompt. Not requeued if the backend never takes it.
    Prompt(String),
    /// Live-injected user text. Already consumed from the inbox, so it
    /// is handed back to the channel if the backend can no longer
    /// accept input.
    User(String),
    /// A raw control payload (permission replies).
    Control(Value),
    /// End of input: close stdin so the reasoning loop can wind down.
    Close,
}

pub struct StreamingDriver {
    config: DriverConfig,
    channel: MessageChannel,
    writer: Arc<OutputWriter>,
}

impl StreamingDriver {
    pub fn new(config: DriverConfig, channel: MessageChannel, writer: Arc<OutputWriter>) -> Self {
        Self {
            config,
            channel,
            writer,
        }
    }
}

#[async_trait]
impl AgentDriver for StreamingDriver {
    async fn run(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        resume_at: Option<&str>,
    ) -> Result<QueryResult> {
        let mut cmd = Command::new(&self.config.agent_bin);
        cmd.args([
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
        ]);
        cmd.arg("--mcp-config").arg(&self.config.tool_bridge);
        if let Some(sid) = session_id {
            cmd.args(["--resume", sid]);
        }
        if let Some(marker) = resume_at {
            cmd.args(["--resume-session-at", marker]);
        }
        cmd.env_clear().envs(&self.config.env);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", self.config.agent_bin, e);
                if let Err(w) = self.writer.write(&OutputRecord::error(&message)) {
                    error!("Failed to report spawn failure: {:#}", w);
                }
                return Err(BridgeError::BackendSpawn(message).into());
            }
        };

        let mut stdin = child.stdin.take().context("Backend stdin was not piped")?;
        let stdout = child.stdout.take().context("Backend stdout was not piped")?;
        let mut stderr = child.stderr.take().context("Backend stderr was not piped")?;

        let (feed_tx, mut feed_rx) = mpsc::channel::<FeedItem>(64);
        feed_tx
            .send(FeedItem::Prompt(prompt.to_string()))
            .await
            .ok();

        // Consumes the feed and writes stream-json lines to stdin.
        // Dropping stdin on Close is what signals end-of-input. Once a
        // write fails the backend is no longer accepting input; from
        // then on live-injected messages are collected and returned so
        // the caller can put them back on the channel instead of
        // losing them.
        let stdin_task = tokio::spawn(async move {
            let mut undelivered: Vec<String> = Vec::new();
            let mut broken = false;
            while let Some(item) = feed_rx.recv().await {
                match item {
                    FeedItem::Close => break,
                    FeedItem::Prompt(text) => {
                        if !broken && write_line(&mut stdin, &user_message(&text)).await.is_err() {
                            broken = true;
                        }
                    }
                    FeedItem::User(text) => {
                        if broken {
                            undelivered.push(text);
                        } else if write_line(&mut stdin, &user_message(&text)).await.is_err() {
                            broken = true;
                            undelivered.push(text);
                        }
                    }
                    FeedItem::Control(value) => {
                        if !broken && write_line(&mut stdin, &value).await.is_err() {
                            broken = true;
                        }
                    }
                }
            }
            undelivered
        });

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        // The poller is the only other activity during the invocation.
        // It stops via the oneshot once the reasoning loop completes,
        // and only at a tick boundary: a batch it has already drained
        // from disk is always forwarded into the feed, never dropped
        // half-consumed.
        let closed_during_query = Arc::new(AtomicBool::new(false));
        let (poller_stop, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let poller = {
            let channel = self.channel.clone();
            let feed_tx = feed_tx.clone();
            let closed = Arc::clone(&closed_during_query);
            tokio::spawn(async move {
                let mut stop_rx = stop_rx;
                let mut ticker = tokio::time::interval(POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => return,
                        _ = ticker.tick() => {}
                    }
                    // Drain before checking the sentinel so a message
                    // racing the sentinel is still delivered.
                    for message in channel.drain_pending() {
                        info!("Injecting live message into active query");
                        if feed_tx.send(FeedItem::User(message)).await.is_err() {
                            return;
                        }
                    }
                    if channel.is_terminate_requested() {
                        info!("Stop sentinel observed mid-query; closing input feed");
                        closed.store(true, Ordering::SeqCst);
                        let _ = feed_tx.send(FeedItem::Close).await;
                        return;
                    }
                }
            })
        };

        let secret_names: Vec<String> = self.config.input.secrets.keys().cloned().collect();
        let mut reader = BufReader::new(stdout).lines();
        let mut new_session_id: Option<String> = None;
        let mut resume_marker: Option<String> = None;
        let mut result_seen = false;
        let mut runtime_error: Option<String> = None;

        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    runtime_error = Some(format!("failed reading backend output: {}", e));
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Skipping unparsable backend line: {}", e);
                    continue;
                }
            };

            match parse_event(&value) {
                AgentEvent::SessionStarted { session_id } => {
                    debug!("Backend session: {}", session_id);
                    new_session_id = Some(session_id);
                }
                AgentEvent::AssistantTurn { turn_id } => {
                    if let Some(id) = turn_id {
                        resume_marker = Some(id);
                    }
                }
                AgentEvent::ResultText { text, is_error } => {
                    // Partial results are visible to the host before
                    // the invocation resolves.
                    result_seen = true;
                    let record = if is_error {
                        OutputRecord::error(text)
                    } else {
                        OutputRecord::success(text, new_session_id.clone())
                    };
                    if let Err(e) = self.writer.write(&record) {
                        error!("Failed to forward result record: {:#}", e);
                    }
                }
                AgentEvent::CompactBoundary => {
                    let sid = new_session_id.as_deref().or(session_id);
                    if let Some(sid) = sid {
                        match archive::archive_conversation(
                            sid,
                            &self.config.group_dir,
                            self.config.input.agent_name.as_deref(),
                        ) {
                            Ok(path) => info!("Archived conversation to {}", path.display()),
                            Err(e) => warn!("Conversation archival failed: {:#}", e),
                        }
                    }
                }
                AgentEvent::PermissionRequest {
                    request_id,
                    tool_name,
                    input,
                } => {
                    let response =
                        permission_response(&request_id, &tool_name, input, &secret_names);
                    if feed_tx.send(FeedItem::Control(response)).await.is_err() {
                        debug!("Feed closed; dropping permission response");
                    }
                }
                AgentEvent::Other => {}
            }
        }

        let _ = poller_stop.send(());
        let _ = poller.await;
        drop(feed_tx);
        let undelivered = stdin_task.await.unwrap_or_default();
        if !undelivered.is_empty() {
            warn!(
                "Returning {} undelivered message(s) to the inbox",
                undelivered.len()
            );
            self.channel.requeue(&undelivered);
        }

        let status = child
            .wait()
            .await
            .context("Failed waiting for backend process")?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if let Some(message) = runtime_error {
            if let Err(w) = self.writer.write(&OutputRecord::error(&message)) {
                error!("Failed to report runtime failure: {:#}", w);
            }
            return Err(BridgeError::BackendRuntime(message).into());
        }

        if !status.success() {
            if result_seen {
                // The failure was already forwarded as a result event.
                warn!("Backend exited with {} after reporting a result", status);
            } else {
                let message = format!(
                    "backend exited with {}: {}",
                    status,
                    tail(&stderr_text, 500)
                );
                if let Err(w) = self.writer.write(&OutputRecord::error(&message)) {
                    error!("Failed to report backend failure: {:#}", w);
                }
                return Err(BridgeError::BackendRuntime(message).into());
            }
        }

        Ok(QueryResult {
            session_id: new_session_id.or_else(|| session_id.map(str::to_string)),
            resume_at: resume_marker,
            closed_during_query: closed_during_query.load(Ordering::SeqCst),
        })
    }
}

/// Classify one stream-json line.
fn parse_event(value: &Value) -> AgentEvent {
    match value.get("type").and_then(Value::as_str) {
        Some("system") => match value.get("subtype").and_then(Value::as_str) {
            Some("init") => match value.get("session_id").and_then(Value::as_str) {
                Some(sid) => AgentEvent::SessionStarted {
                    session_id: sid.to_string(),
                },
                None => AgentEvent::Other,
            },
            Some("compact_boundary") => AgentEvent::CompactBoundary,
            _ => AgentEvent::Other,
        },
        Some("assistant") => AgentEvent::AssistantTurn {
            turn_id: value
                .get("uuid")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        Some("result") => AgentEvent::ResultText {
            text: value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        Some("control_request") => {
            let request_id = value
                .get("request_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let request = value.get("request");
            let subtype = request
                .and_then(|r| r.get("subtype"))
                .and_then(Value::as_str);
            if subtype != Some("can_use_tool") {
                return AgentEvent::Other;
            }
            AgentEvent::PermissionRequest {
                request_id,
                tool_name: request
                    .and_then(|r| r.get("tool_name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: request
                    .and_then(|r| r.get("input"))
                    .cloned()
                    .unwrap_or(Value::Null),
            }
        }
        _ => AgentEvent::Other,
    }
}

/// Allow the tool invocation, scrubbing secret-bearing environment
/// variables out of shell commands on the way through.
fn permission_response(
    request_id: &str,
    tool_name: &str,
    mut input: Value,
    secret_names: &[String],
) -> Value {
    if tool_name == "Bash" {
        if let Some(object) = input.as_object_mut() {
            if let Some(command) = object.get("command").and_then(Value::as_str) {
                let scrubbed = scrub::scrub_command(command, secret_names);
                object.insert("command".to_string(), Value::String(scrubbed));
            }
        }
    }
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": { "behavior": "allow", "updatedInput": input },
        },
    })
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    value: &Value,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

fn user_message(text: &str) -> Value {
    serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim_end();
    }
    let start = text
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].trim_end()
}
