//! Agent Backend Drivers
//!
//! One capability contract ([`crate::types::AgentDriver`]), two
//! variants: an in-process streaming loop that accepts live message
//! injection, and a one-shot external subprocess. The variant is
//! selected once at startup from the container input's closed backend
//! enumeration.

pub mod streaming;
pub mod subprocess;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::channel::MessageChannel;
use crate::output::OutputWriter;
use crate::types::{AgentDriver, BackendKind, ContainerInput};

use streaming::StreamingDriver;
use subprocess::SubprocessDriver;

/// Everything a driver needs besides per-invocation arguments.
/// Drivers hold no session state of their own: session id and resume
/// marker are passed in on every call and returned, never cached.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// The parsed startup document.
    pub input: ContainerInput,
    /// Merged secret-augmented environment for spawned backends.
    pub env: HashMap<String, String>,
    /// Path to the tool-bridge entry point, handed to the backend so
    /// agent tool-use can call back into host capabilities.
    pub tool_bridge: PathBuf,
    /// Agent binary to launch.
    pub agent_bin: String,
    /// Group workspace directory; conversation archives land under it.
    pub group_dir: PathBuf,
}

/// Build the driver for the configured backend variant.
pub fn select_driver(
    config: DriverConfig,
    channel: MessageChannel,
    writer: Arc<OutputWriter>,
) -> Box<dyn AgentDriver> {
    match config.input.backend {
        BackendKind::Streaming => Box::new(StreamingDriver::new(config, channel, writer)),
        BackendKind::Subprocess => Box::new(SubprocessDriver::new(config, writer)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::Path;

    /// Minimal driver config over a fake agent binary, for driver
    /// tests.
    pub fn config_with(agent_bin: &str, dir: &Path) -> DriverConfig {
        let input: ContainerInput = serde_json::from_str(
            r#"{"prompt":"unused","groupId":"g1","channelId":"c1"}"#,
        )
        .unwrap();
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.insert("API_KEY".to_string(), "sekrit".to_string());
        DriverConfig {
            input,
            env,
            tool_bridge: dir.join("tool-bridge.js"),
            agent_bin: agent_bin.to_string(),
            group_dir: dir.join("group"),
        }
    }

    /// Write an executable shell script standing in for the agent
    /// binary.
    pub fn fake_agent(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }
}
