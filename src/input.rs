//! Initialization Boundary
//!
//! Loads the one-shot container input document and builds the merged
//! environment handed to agent backends. The input document carries
//! secret values, so it is deleted immediately after the single read.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::BridgeError;
use crate::types::ContainerInput;

/// Fixed identifying variables exposed to backends alongside the
/// injected secrets.
pub const ENV_GROUP_ID: &str = "EMISSARY_GROUP_ID";
pub const ENV_CHANNEL_ID: &str = "EMISSARY_CHANNEL_ID";
pub const ENV_MAIN_CHAT: &str = "EMISSARY_MAIN_CHAT";

/// Read, parse, and delete the startup document. The file is removed
/// even when parsing fails, so secrets never outlive this call on
/// disk. A parse failure is an `InitializationError`; the caller
/// reports it on the outbound side-channel and exits non-zero.
pub fn load_container_input(path: &Path) -> Result<ContainerInput, BridgeError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        BridgeError::Initialization(format!("cannot read {}: {}", path.display(), e))
    })?;

    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to delete input document {}: {}", path.display(), e);
    }

    let input: ContainerInput = serde_json::from_str(&contents).map_err(|e| {
        BridgeError::Initialization(format!("cannot parse {}: {}", path.display(), e))
    })?;

    info!(
        "Loaded container input (group: {}, channel: {}, backend: {:?})",
        input.group_id, input.channel_id, input.backend
    );
    Ok(input)
}

/// Environment handed to backends: the current process environment,
/// the injected secrets, and the fixed identifying variables. Secrets
/// exist only in memory and in spawned-process environments.
pub fn merged_env(input: &ContainerInput) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (name, value) in &input.secrets {
        env.insert(name.clone(), value.clone());
    }
    env.insert(ENV_GROUP_ID.to_string(), input.group_id.clone());
    env.insert(ENV_CHANNEL_ID.to_string(), input.channel_id.clone());
    env.insert(ENV_MAIN_CHAT.to_string(), input.is_main_chat.to_string());
    env
}
