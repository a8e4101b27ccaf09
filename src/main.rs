//! Emissary Runtime
//!
//! The entry point for the sandbox agent bridge. Handles CLI args,
//! loads the one-shot input document, wires up the live-message
//! channel and outbound side-channel, and runs the query loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use emissary::channel::MessageChannel;
use emissary::driver::{self, DriverConfig};
use emissary::error::BridgeError;
use emissary::input;
use emissary::orchestrator::{run_query_loop, QueryLoopOptions};
use emissary::output::OutputWriter;
use emissary::types::OutputRecord;

const VERSION: &str = "0.1.0";

/// Emissary -- Sandbox Agent Bridge
#[derive(Parser, Debug)]
#[command(
    name = "emissary",
    version = VERSION,
    about = "Bridges a sandboxed conversational agent to its host over a mounted filesystem"
)]
struct Cli {
    /// IPC directory shared with the host (inbox, sentinel, output)
    #[arg(long, default_value = "/ipc")]
    ipc_dir: PathBuf,

    /// Path to the one-shot input document (default: <ipc-dir>/input.json)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Agent binary to launch
    #[arg(long, default_value = "claude")]
    agent_bin: String,

    /// Tool-bridge entry point passed to the agent backend
    #[arg(long, default_value = "/opt/emissary/tool-bridge.js")]
    tool_bridge: PathBuf,

    /// Group workspace directory (conversation archives land here)
    #[arg(long, default_value = "/workspace")]
    group_dir: PathBuf,
}

async fn run(cli: Cli, writer: Arc<OutputWriter>) -> Result<()> {
    info!("Emissary v{} starting", VERSION);

    let channel = MessageChannel::new(&cli.ipc_dir);
    channel.init().context("Failed to create inbox directory")?;

    let input_path = cli.input.unwrap_or_else(|| cli.ipc_dir.join("input.json"));
    let container_input = input::load_container_input(&input_path)?;

    let env = input::merged_env(&container_input);
    let config = DriverConfig {
        input: container_input.clone(),
        env,
        tool_bridge: cli.tool_bridge,
        agent_bin: cli.agent_bin,
        group_dir: cli.group_dir,
    };
    let driver = driver::select_driver(config, channel.clone(), Arc::clone(&writer));

    run_query_loop(QueryLoopOptions {
        input: container_input,
        driver,
        channel,
        writer,
    })
    .await
}

/// The host never infers failure from silence: every fatal condition
/// ends with exactly one error record on the side-channel. Backend
/// drivers report their own failures before resolving, so those are
/// the only errors not reported here.
fn report_fatal(writer: &OutputWriter, err: &anyhow::Error) {
    let reported_by_driver = matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::BackendSpawn(_) | BridgeError::BackendRuntime(_))
    );
    if !reported_by_driver {
        let _ = writer.write(&OutputRecord::error(format!("{:#}", err)));
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let writer = Arc::new(OutputWriter::new(cli.ipc_dir.join("output.jsonl")));
    if let Err(e) = run(cli, Arc::clone(&writer)).await {
        report_fatal(&writer, &e);
        eprintln!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emissary::types::OutputStatus;
    use std::fs;
    use tempfile::tempdir;

    fn cli_for(dir: &std::path::Path) -> Cli {
        Cli {
            ipc_dir: dir.to_path_buf(),
            input: None,
            agent_bin: "claude".to_string(),
            tool_bridge: PathBuf::from("/opt/emissary/tool-bridge.js"),
            group_dir: dir.to_path_buf(),
        }
    }

    fn records(writer: &OutputWriter) -> Vec<OutputRecord> {
        fs::read_to_string(writer.path())
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_inbox_init_failure_emits_one_error_record() {
        let dir = tempdir().unwrap();
        // A plain file where the inbox directory must go makes
        // channel init fail while the side-channel stays writable.
        fs::write(dir.path().join("messages"), "not a directory").unwrap();
        let writer = Arc::new(OutputWriter::new(dir.path().join("output.jsonl")));

        let err = run(cli_for(dir.path()), Arc::clone(&writer))
            .await
            .unwrap_err();
        report_fatal(&writer, &err);

        let records = records(&writer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OutputStatus::Error);
        assert_eq!(records[0].result, None);
    }

    #[tokio::test]
    async fn test_unparsable_input_document_emits_one_error_record() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("input.json"), "{not json").unwrap();
        let writer = Arc::new(OutputWriter::new(dir.path().join("output.jsonl")));

        let err = run(cli_for(dir.path()), Arc::clone(&writer))
            .await
            .unwrap_err();
        report_fatal(&writer, &err);

        let records = records(&writer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OutputStatus::Error);
    }

    #[test]
    fn test_driver_reported_errors_get_no_second_record() {
        let dir = tempdir().unwrap();
        let writer = OutputWriter::new(dir.path().join("output.jsonl"));
        let err = anyhow::Error::new(BridgeError::BackendSpawn("agent: not found".to_string()));

        report_fatal(&writer, &err);

        assert!(!writer.path().exists());
    }
}
