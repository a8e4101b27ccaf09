//! Emissary - Type Definitions
//!
//! Shared types for the sandbox agent bridge: the one-shot container
//! input document, per-invocation query results, the outbound record
//! format, and the driver capability trait.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Container Input ─────────────────────────────────────────────

/// The one-shot initialization document written by the host before the
/// container starts. Read once from a transient path and deleted
/// immediately -- it carries secret values that must not persist on
/// disk. Owned exclusively by the orchestrator for the lifetime of one
/// container run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    /// Initial prompt text for the first invocation.
    pub prompt: String,
    /// Prior session to resume, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Workspace/group identifier.
    pub group_id: String,
    /// Conversation/channel identifier.
    pub channel_id: String,
    /// Whether this conversation is the group's primary context.
    #[serde(default)]
    pub is_main_chat: bool,
    /// Set when the run was started by a scheduler, not a user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled: Option<bool>,
    /// Display name for the agent persona.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Which backend runs the reasoning loop.
    #[serde(default)]
    pub backend: BackendKind,
    /// Secret name -> value, injected into the backend environment and
    /// never written back to disk.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Closed enumeration of agent backends. Selected once at startup; no
/// dynamic loading.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process streaming loop over the agent CLI's stream-json
    /// interface. Accepts live message injection mid-query.
    #[default]
    Streaming,
    /// One-shot external binary per invocation. No live feed.
    Subprocess,
}

// ─── Query Result ────────────────────────────────────────────────

/// Outcome of a single driver invocation. The orchestrator, not the
/// driver, owns continuity across invocations: these fields update its
/// mutable (session_id, resume_at) state and are passed back in on the
/// next call. Drivers never cache them internally.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// New or continued session identifier.
    pub session_id: Option<String>,
    /// Marker of the last agent-authored turn, used to resume a
    /// conversation mid-stream rather than from its beginning.
    pub resume_at: Option<String>,
    /// True when the terminate sentinel was observed while the
    /// invocation was still running.
    pub closed_during_query: bool,
}

// ─── Outbound Records ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Error,
}

/// One line of the outbound side-channel. The host watches these
/// records to relay result text to the end user and to persist session
/// continuity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub status: OutputStatus,
    /// Result text, or null on errors and session-update-only records.
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OutputRecord {
    pub fn success(result: impl Into<String>, new_session_id: Option<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            result: Some(result.into()),
            new_session_id,
            error: None,
        }
    }

    /// A success record with no result text, emitted so the host can
    /// persist the current session id between invocations.
    pub fn session_update(session_id: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            result: None,
            new_session_id: Some(session_id.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }
}

// ─── Streaming Events ────────────────────────────────────────────

/// Typed progress events parsed from the streaming backend's output.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    /// Initialization-class event carrying the assigned session id.
    SessionStarted { session_id: String },
    /// An agent-authored turn. `turn_id` becomes the next resume marker.
    AssistantTurn { turn_id: Option<String> },
    /// Terminal/result-class event. Text is forwarded to the outbound
    /// side-channel immediately, before the invocation resolves.
    ResultText { text: String, is_error: bool },
    /// The backend is about to trim conversation history.
    CompactBoundary,
    /// The backend asks permission to run a tool.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    /// Anything the driver does not act on.
    Other,
}

// ─── Driver Contract ─────────────────────────────────────────────

/// Capability interface shared by both backend variants. A single
/// invocation may suspend for seconds to minutes but must always
/// eventually resolve, and it reports its outcome on the outbound
/// side-channel before resolving.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        resume_at: Option<&str>,
    ) -> anyhow::Result<QueryResult>;
}
