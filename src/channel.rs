//! Live-Message Channel
//!
//! Filesystem-backed mailbox between the host and the running
//! orchestrator: one file per pending message under the inbox
//! directory, consumed in lexicographic order and deleted on
//! consumption, plus a stop sentinel whose presence (not content)
//! signals that no further messages will arrive.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::BridgeError;

/// Poll period for `wait_for_next`. The writer side is a human or a
/// scheduler, not a high-frequency producer, so hundreds of
/// milliseconds of delivery latency is an acceptable trade for not
/// busy-spinning the process.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const INBOX_DIR: &str = "messages";
const SENTINEL_FILE: &str = "stop";

/// Result of a blocking wait on the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelSignal {
    Message(String),
    Terminate,
}

#[derive(Clone, Debug)]
pub struct MessageChannel {
    inbox: PathBuf,
    sentinel: PathBuf,
    poll_interval: Duration,
}

impl MessageChannel {
    pub fn new(ipc_dir: &Path) -> Self {
        Self {
            inbox: ipc_dir.join(INBOX_DIR),
            sentinel: ipc_dir.join(SENTINEL_FILE),
            poll_interval: POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create the inbox directory if it does not exist yet.
    pub fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.inbox)
    }

    /// Remove a sentinel left over from a previous container lifetime.
    /// Must run before the first wait so a stale marker cannot falsely
    /// terminate a fresh run.
    pub fn clear_stale_sentinel(&self) {
        if self.sentinel.exists() {
            warn!("Clearing stale stop sentinel from a previous run");
            if let Err(e) = fs::remove_file(&self.sentinel) {
                warn!("Failed to remove stale sentinel: {}", e);
            }
        }
    }

    /// Non-blocking sentinel probe, used by the streaming backend to
    /// interrupt an in-flight invocation.
    pub fn is_terminate_requested(&self) -> bool {
        self.sentinel.exists()
    }

    /// Read and delete all currently-pending message files in delivery
    /// order. Never blocks; a missing inbox directory is an empty
    /// inbox. An unreadable file is skipped with a warning -- one bad
    /// file must not stall the mailbox.
    pub fn drain_pending(&self) -> Vec<String> {
        let mut messages = Vec::new();
        for path in self.pending_files() {
            match fs::read_to_string(&path) {
                Ok(content) => messages.push(content),
                Err(e) => {
                    let err = BridgeError::ChannelRead(format!("{}: {}", path.display(), e));
                    warn!("Skipping message file: {}", err);
                }
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove consumed message {}: {}", path.display(), e);
            }
        }
        messages
    }

    /// Return consumed-but-undelivered messages to the front of the
    /// inbox, preserving their order. The `!` prefix sorts before any
    /// ordinary message file name, so a requeued message is delivered
    /// ahead of anything that arrived after it was first consumed.
    pub fn requeue(&self, messages: &[String]) {
        if messages.is_empty() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&self.inbox) {
            warn!("Cannot requeue messages, inbox unavailable: {}", e);
            return;
        }
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        for (i, message) in messages.iter().enumerate() {
            let path = self.inbox.join(format!("!requeue-{:020}-{:04}", stamp, i));
            if let Err(e) = fs::write(&path, message) {
                warn!("Failed to requeue message {}: {}", path.display(), e);
            }
        }
    }

    /// Block until a message or the terminate signal arrives, polling
    /// at a bounded interval. Pending messages are drained before the
    /// sentinel is checked, so a message racing the sentinel is never
    /// dropped. Returns the earliest message only, leaving the rest on
    /// disk for the next drain.
    pub async fn wait_for_next(&self) -> ChannelSignal {
        loop {
            if let Some(message) = self.take_earliest() {
                return ChannelSignal::Message(message);
            }
            if self.is_terminate_requested() {
                debug!("Stop sentinel observed while waiting");
                return ChannelSignal::Terminate;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Consume the earliest pending message, if any. Unreadable files
    /// are removed and skipped so they cannot wedge the inbox.
    fn take_earliest(&self) -> Option<String> {
        for path in self.pending_files() {
            let read = fs::read_to_string(&path);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove consumed message {}: {}", path.display(), e);
            }
            match read {
                Ok(content) => return Some(content),
                Err(e) => {
                    let err = BridgeError::ChannelRead(format!("{}: {}", path.display(), e));
                    warn!("Skipping message file: {}", err);
                }
            }
        }
        None
    }

    /// Message files currently on disk, in delivery (lexicographic)
    /// order.
    fn pending_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.inbox) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        paths
    }
}
