//! Query-Loop Orchestrator
//!
//! The sequential state machine that ties driver invocations together
//! across a session: seed the first prompt, invoke the driver, persist
//! the continuity tokens it returns, block on the live-message
//! channel, repeat -- or terminate on the stop sentinel. At most one
//! invocation is ever in flight.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::channel::{ChannelSignal, MessageChannel};
use crate::output::OutputWriter;
use crate::types::{AgentDriver, ContainerInput, OutputRecord};

pub struct QueryLoopOptions {
    pub input: ContainerInput,
    pub driver: Box<dyn AgentDriver>,
    pub channel: MessageChannel,
    pub writer: Arc<OutputWriter>,
}

/// Run the query loop until the channel signals termination or a
/// driver invocation fails. Drivers report their own outcome on the
/// outbound side-channel before resolving, so a driver error
/// propagates from here without a second error record.
pub async fn run_query_loop(options: QueryLoopOptions) -> Result<()> {
    let QueryLoopOptions {
        input,
        driver,
        channel,
        writer,
    } = options;

    // A sentinel left over from a previous container lifetime must not
    // terminate this run.
    channel.clear_stale_sentinel();

    // Messages queued before the loop started join the initial prompt
    // in arrival order, each on its own line. None are dropped.
    let mut prompt = input.prompt.clone();
    for message in channel.drain_pending() {
        prompt.push('\n');
        prompt.push_str(&message);
    }

    if input.is_scheduled.unwrap_or(false) {
        debug!("Run was started by a scheduler, not a user");
    }

    // Continuity state lives here, not in the driver: each invocation
    // gets the current values and returns updates.
    let mut session_id = input.session_id.clone();
    let mut resume_at: Option<String> = None;

    loop {
        info!(
            "Invoking {:?} backend (session: {})",
            input.backend,
            session_id.as_deref().unwrap_or("new")
        );

        let result = driver
            .run(&prompt, session_id.as_deref(), resume_at.as_deref())
            .await?;

        if let Some(sid) = result.session_id {
            session_id = Some(sid);
        }
        if let Some(marker) = result.resume_at {
            resume_at = Some(marker);
        }

        if result.closed_during_query {
            info!("Input feed closed during query; terminating");
            return Ok(());
        }

        // Emitted on every normal completion so the host can persist
        // the session id even when no new text was produced.
        if let Some(ref sid) = session_id {
            writer.write(&OutputRecord::session_update(sid.clone()))?;
        }

        match channel.wait_for_next().await {
            ChannelSignal::Message(next) => prompt = next,
            ChannelSignal::Terminate => {
                info!("Stop sentinel observed; terminating");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutputStatus, QueryResult};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Records every invocation and replays scripted results. Writes
    /// the stop sentinel after a chosen call so loops end
    /// deterministically.
    struct MockDriver {
        calls: Arc<Mutex<Vec<(String, Option<String>, Option<String>)>>>,
        results: Mutex<VecDeque<Result<QueryResult>>>,
        sentinel_on_call: Option<(usize, PathBuf)>,
    }

    #[async_trait]
    impl AgentDriver for MockDriver {
        async fn run(
            &self,
            prompt: &str,
            session_id: Option<&str>,
            resume_at: Option<&str>,
        ) -> Result<QueryResult> {
            let call_number = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((
                    prompt.to_string(),
                    session_id.map(str::to_string),
                    resume_at.map(str::to_string),
                ));
                calls.len()
            };
            if let Some((on_call, ref path)) = self.sentinel_on_call {
                if call_number == on_call {
                    fs::write(path, "").unwrap();
                }
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(QueryResult::default()))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        calls: Arc<Mutex<Vec<(String, Option<String>, Option<String>)>>>,
        channel: MessageChannel,
        writer: Arc<OutputWriter>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let channel = MessageChannel::new(dir.path())
                .with_poll_interval(Duration::from_millis(20));
            channel.init().unwrap();
            let writer = Arc::new(OutputWriter::new(dir.path().join("output.jsonl")));
            Self {
                dir,
                calls: Arc::new(Mutex::new(Vec::new())),
                channel,
                writer,
            }
        }

        fn sentinel_path(&self) -> PathBuf {
            self.dir.path().join("stop")
        }

        fn inbox(&self) -> PathBuf {
            self.dir.path().join("messages")
        }

        fn input(&self, prompt: &str, session_id: Option<&str>) -> ContainerInput {
            serde_json::from_str(&format!(
                r#"{{"prompt":"{}","sessionId":{},"groupId":"g1","channelId":"c1"}}"#,
                prompt,
                session_id
                    .map(|s| format!("\"{}\"", s))
                    .unwrap_or_else(|| "null".to_string()),
            ))
            .unwrap()
        }

        fn driver(
            &self,
            results: Vec<Result<QueryResult>>,
            sentinel_on_call: Option<usize>,
        ) -> Box<dyn AgentDriver> {
            Box::new(MockDriver {
                calls: Arc::clone(&self.calls),
                results: Mutex::new(results.into_iter().collect()),
                sentinel_on_call: sentinel_on_call.map(|n| (n, self.sentinel_path())),
            })
        }

        fn records(&self) -> Vec<OutputRecord> {
            fs::read_to_string(self.writer.path())
                .unwrap_or_default()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }

        fn calls(&self) -> Vec<(String, Option<String>, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn closed() -> Result<QueryResult> {
        Ok(QueryResult {
            closed_during_query: true,
            ..QueryResult::default()
        })
    }

    #[tokio::test]
    async fn test_pending_messages_join_first_prompt_in_order() {
        let fixture = Fixture::new();
        fs::write(fixture.inbox().join("002.txt"), "second").unwrap();
        fs::write(fixture.inbox().join("001.txt"), "first").unwrap();

        run_query_loop(QueryLoopOptions {
            input: fixture.input("hello", None),
            driver: fixture.driver(vec![closed()], None),
            channel: fixture.channel.clone(),
            writer: Arc::clone(&fixture.writer),
        })
        .await
        .unwrap();

        assert_eq!(
            fixture.calls(),
            vec![("hello\nfirst\nsecond".to_string(), None, None)]
        );
    }

    #[tokio::test]
    async fn test_closed_during_query_skips_awaiting_next() {
        let fixture = Fixture::new();

        run_query_loop(QueryLoopOptions {
            input: fixture.input("hello", None),
            driver: fixture.driver(
                vec![Ok(QueryResult {
                    session_id: Some("s1".to_string()),
                    resume_at: None,
                    closed_during_query: true,
                })],
                None,
            ),
            channel: fixture.channel.clone(),
            writer: Arc::clone(&fixture.writer),
        })
        .await
        .unwrap();

        // Straight to Terminated: no session-update record, no wait.
        assert_eq!(fixture.calls().len(), 1);
        assert!(fixture.records().is_empty());
    }

    #[tokio::test]
    async fn test_session_round_trip_and_live_message_becomes_next_prompt() {
        let fixture = Fixture::new();
        let inbox = fixture.inbox();

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fs::write(inbox.join("001.txt"), "follow-up").unwrap();
        });

        run_query_loop(QueryLoopOptions {
            input: fixture.input("hello", None),
            driver: fixture.driver(
                vec![
                    Ok(QueryResult {
                        session_id: Some("s1".to_string()),
                        resume_at: Some("t1".to_string()),
                        closed_during_query: false,
                    }),
                    Ok(QueryResult::default()),
                ],
                Some(2),
            ),
            channel: fixture.channel.clone(),
            writer: Arc::clone(&fixture.writer),
        })
        .await
        .unwrap();
        feeder.await.unwrap();

        // The second invocation gets the message verbatim and the
        // continuity tokens from the first, unchanged.
        assert_eq!(
            fixture.calls(),
            vec![
                ("hello".to_string(), None, None),
                (
                    "follow-up".to_string(),
                    Some("s1".to_string()),
                    Some("t1".to_string())
                ),
            ]
        );

        let records = fixture.records();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.status, OutputStatus::Success);
            assert_eq!(record.result, None);
            assert_eq!(record.new_session_id.as_deref(), Some("s1"));
        }
    }

    #[tokio::test]
    async fn test_stale_sentinel_does_not_terminate_first_iteration() {
        let fixture = Fixture::new();
        fs::write(fixture.sentinel_path(), "").unwrap();
        let inbox = fixture.inbox();

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fs::write(inbox.join("001.txt"), "still alive").unwrap();
        });

        run_query_loop(QueryLoopOptions {
            input: fixture.input("hello", None),
            driver: fixture.driver(
                vec![Ok(QueryResult::default()), Ok(QueryResult::default())],
                Some(2),
            ),
            channel: fixture.channel.clone(),
            writer: Arc::clone(&fixture.writer),
        })
        .await
        .unwrap();
        feeder.await.unwrap();

        // Two invocations: the stale sentinel was cleared, so the loop
        // waited for (and received) the live message.
        assert_eq!(fixture.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_prior_session_id_from_input_is_passed_through() {
        let fixture = Fixture::new();

        run_query_loop(QueryLoopOptions {
            input: fixture.input("hello", Some("s0")),
            driver: fixture.driver(vec![closed()], None),
            channel: fixture.channel.clone(),
            writer: Arc::clone(&fixture.writer),
        })
        .await
        .unwrap();

        assert_eq!(
            fixture.calls(),
            vec![("hello".to_string(), Some("s0".to_string()), None)]
        );
    }

    #[tokio::test]
    async fn test_driver_error_is_fatal_without_extra_record() {
        let fixture = Fixture::new();

        let err = run_query_loop(QueryLoopOptions {
            input: fixture.input("hello", None),
            driver: fixture.driver(vec![Err(anyhow!("backend runtime error: boom"))], None),
            channel: fixture.channel.clone(),
            writer: Arc::clone(&fixture.writer),
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("boom"));
        // The driver already reported; the orchestrator adds nothing.
        assert!(fixture.records().is_empty());
    }
}
