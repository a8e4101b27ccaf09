//! Pre-Compaction Conversation Archival
//!
//! Before the backend trims conversation history, the transcript so
//! far is written out as a markdown file under the group's
//! conversations directory, so nothing the user said is lost to
//! compaction. Failures here are logged and swallowed by the caller.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Longest turn text carried into an archive file.
const MAX_TURN_CHARS: usize = 2000;

/// Longest slug used in archive file names.
const MAX_SLUG_CHARS: usize = 48;

/// Archive the transcript of the given session into
/// `<group_dir>/conversations/`. The title comes from the backend's
/// session-summary index when one exists, else a timestamp fallback.
pub fn archive_conversation(
    session_id: &str,
    group_dir: &Path,
    agent_name: Option<&str>,
) -> Result<PathBuf> {
    let project_dir = project_dir()?;
    let transcript = project_dir.join(format!("{}.jsonl", session_id));
    let title = lookup_summary(&project_dir, session_id)
        .unwrap_or_else(|| format!("conversation-{}", Utc::now().format("%H%M%S")));

    archive_transcript(&transcript, group_dir, &title, agent_name)
}

/// Write a markdown archive of one transcript file. Split out from
/// [`archive_conversation`] so the transcript location can be supplied
/// directly.
pub fn archive_transcript(
    transcript: &Path,
    group_dir: &Path,
    title: &str,
    agent_name: Option<&str>,
) -> Result<PathBuf> {
    let contents = fs::read_to_string(transcript)
        .with_context(|| format!("Failed to read transcript {}", transcript.display()))?;

    let turns = extract_turns(&contents);
    if turns.is_empty() {
        bail!("transcript {} has no user/assistant turns", transcript.display());
    }

    let conversations = group_dir.join("conversations");
    fs::create_dir_all(&conversations).context("Failed to create conversations directory")?;

    let date = Utc::now().format("%Y-%m-%d");
    let mut path = conversations.join(format!("{}-{}.md", date, slugify(title)));
    if path.exists() {
        let suffix = Uuid::new_v4().to_string();
        path = conversations.join(format!("{}-{}-{}.md", date, slugify(title), &suffix[..8]));
    }

    let mut body = format!("# {}\n\n", title);
    if let Some(name) = agent_name {
        body.push_str(&format!("Agent: {}\n", name));
    }
    body.push_str(&format!("Archived: {}\n\n", Utc::now().to_rfc3339()));
    for (role, text) in &turns {
        body.push_str(&format!("## {}\n\n{}\n\n", role, truncate(text, MAX_TURN_CHARS)));
    }

    fs::write(&path, body)
        .with_context(|| format!("Failed to write archive {}", path.display()))?;
    debug!("Archived {} turns to {}", turns.len(), path.display());
    Ok(path)
}

/// Extract (role, text) pairs from transcript JSONL. Lines that do not
/// parse or carry no text are skipped.
fn extract_turns(jsonl: &str) -> Vec<(String, String)> {
    let mut turns = Vec::new();
    for line in jsonl.lines() {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let role = match value.get("type").and_then(Value::as_str) {
            Some("user") => "User",
            Some("assistant") => "Assistant",
            _ => continue,
        };
        if let Some(text) = message_text(&value) {
            if !text.trim().is_empty() {
                turns.push((role.to_string(), text));
            }
        }
    }
    turns
}

/// Pull the text out of a transcript entry's `message.content`, which
/// is either a plain string or an array of content blocks.
fn message_text(entry: &Value) -> Option<String> {
    let content = entry.get("message")?.get("content")?;
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Look up a human-readable summary for the session in the backend's
/// per-project index file.
fn lookup_summary(project_dir: &Path, session_id: &str) -> Option<String> {
    let index = fs::read_to_string(project_dir.join("sessions.json")).ok()?;
    let index: Value = serde_json::from_str(&index).ok()?;
    index
        .get(session_id)?
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The backend's per-project transcript directory: the working
/// directory path with separators munged, under `~/.claude/projects/`.
fn project_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("No home directory")?;
    let cwd = std::env::current_dir().context("No working directory")?;
    let munged = cwd.to_string_lossy().replace(['/', '.'], "-");
    Ok(home.join(".claude").join("projects").join(munged))
}

fn slugify(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut out = String::new();
    for c in slug.chars() {
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-')
        .chars()
        .take(MAX_SLUG_CHARS)
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}...", kept)
}
