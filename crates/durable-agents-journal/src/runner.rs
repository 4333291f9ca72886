//! Journaled agent runs.

use std::sync::Arc;

use durable_agents_core::{Agent, AgentError, Content, Event, InvocationContext, StreamId};
use durable_agents_transport::{Connection, Credential, Shadow, TransportError};
use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    config::RunnerConfig,
    event_log::{EventLog, JournalError, StartMode},
    recovery::{JournalDiagnostic, ResumeError, ResumeOptions, Resumed, resume},
};

const AGENT_START: &str = "agent_start";
const AGENT_TURN: &str = "agent_turn";

/// Runner error.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Resume(#[from] ResumeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RunnerError {
    /// Whether a run stops after yielding this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Agent(_) => false,
            Self::Journal(e) => !e.is_recoverable(),
            Self::Resume(_) | Self::Transport(_) => true,
        }
    }
}

/// Drives an [`Agent`] and journals everything it produces.
///
/// One run at a time; a second `run` waits until the first stream is
/// finished or dropped.
pub struct Runner {
    config: RunnerConfig,
    agent: Arc<dyn Agent>,
    connection: Connection,
    event_log: Arc<Mutex<EventLog>>,
    recovered: Vec<Event>,
    diagnostics: Vec<JournalDiagnostic>,
}

impl Runner {
    /// Connect and open the journal, resuming it when configured.
    ///
    /// # Errors
    /// Returns error if the connection, journal or replay fails.
    pub async fn start(config: RunnerConfig, agent: Arc<dyn Agent>) -> Result<Self, RunnerError> {
        let credential = config
            .api_key
            .as_deref()
            .map_or_else(Credential::none, Credential::new);
        let connection = Connection::connect(&config.endpoint, &credential).await?;

        let (event_log, recovered, diagnostics) = if config.resume {
            let options = ResumeOptions {
                read_timeout: config.read_timeout,
            };
            let Resumed {
                event_log,
                events,
                diagnostics,
            } = resume(&config.event_log, &connection, options).await?;
            (event_log, events, diagnostics)
        } else {
            let log = EventLog::open(&config.event_log, connection.new_session(), StartMode::Fresh)
                .await?;
            (log, Vec::new(), Vec::new())
        };

        tracing::info!(
            agent = agent.name(),
            session_id = %event_log.session().id(),
            recovered = recovered.len(),
            "Runner started"
        );
        Ok(Self {
            config,
            agent,
            connection,
            event_log: Arc::new(Mutex::new(event_log)),
            recovered,
            diagnostics,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Events replayed from the journal at start.
    #[must_use]
    pub fn recovered_events(&self) -> &[Event] {
        &self.recovered
    }

    /// Problems the replay skipped over.
    #[must_use]
    pub fn diagnostics(&self) -> &[JournalDiagnostic] {
        &self.diagnostics
    }

    /// Id of the session the journal is bound to.
    #[must_use]
    pub async fn session_id(&self) -> String {
        self.event_log.lock().await.session().id().to_owned()
    }

    /// Run the agent once.
    ///
    /// Each turn of the agent gets its own output stream and shadow. Events
    /// are journaled before they are yielded. Dropping the stream cancels
    /// the run.
    pub fn run(&self, user_content: Option<Content>) -> BoxStream<'static, Result<Event, RunnerError>> {
        let agent = Arc::clone(&self.agent);
        let event_log = Arc::clone(&self.event_log);
        let wait_for_durability = self.config.wait_for_durability;

        let stream = async_stream::stream! {
            let mut log = event_log.lock_owned().await;
            let ctx = InvocationContext::new(agent.name(), user_content);
            let run_input = StreamId::generate();
            tracing::debug!(invocation_id = %ctx.invocation_id, input = %run_input, "Run started");

            let mut events = agent.run(ctx);
            let mut previous_output: Option<StreamId> = None;
            let mut turn: Option<(StreamId, Shadow)> = None;
            let mut branch: Option<String> = None;

            while let Some(item) = events.next().await {
                let mut event = match item {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("Agent error: {e}");
                        yield Err(RunnerError::Agent(e));
                        continue;
                    }
                };

                if turn.is_none() {
                    let output = StreamId::generate();
                    let (kind, input) = match &previous_output {
                        None => (AGENT_START, run_input.clone()),
                        Some(previous) => (AGENT_TURN, previous.clone()),
                    };
                    match log.log_activity(kind, agent.name(), &input, &output).await {
                        Ok(shadow) => {
                            branch.get_or_insert_with(|| format!("{input}:{output}"));
                            turn = Some((output, shadow));
                        }
                        Err(e) => {
                            let err = RunnerError::from(e);
                            let fatal = err.is_fatal();
                            yield Err(err);
                            if fatal {
                                return;
                            }
                        }
                    }
                }

                if event.branch.is_none() {
                    event.branch.clone_from(&branch);
                }

                if let Some((output, shadow)) = turn.take() {
                    if let Err(e) = log.log_event(&output, &event).await {
                        let err = RunnerError::from(e);
                        let fatal = err.is_fatal();
                        yield Err(err);
                        if fatal {
                            return;
                        }
                    }
                    if event.is_final() {
                        if log.shadow(&output).is_some() {
                            // The terminal frame never went out.
                            if let Err(e) = log.finish_turn(&output).await {
                                yield Err(RunnerError::from(e));
                                return;
                            }
                        }
                        if wait_for_durability {
                            if let Err(e) = shadow.wait().await {
                                yield Err(RunnerError::from(e));
                                return;
                            }
                        }
                        previous_output = Some(output);
                    } else {
                        turn = Some((output, shadow));
                    }
                }

                yield Ok(event);
            }

            if let Some((output, _)) = turn.take() {
                match log.finish_turn(&output).await {
                    Ok(shadow) => {
                        if wait_for_durability {
                            if let Err(e) = shadow.wait().await {
                                yield Err(RunnerError::from(e));
                            }
                        }
                    }
                    Err(e) => yield Err(RunnerError::from(e)),
                }
            }
            tracing::debug!("Run finished");
        };
        Box::pin(stream)
    }

    /// Close the connection to the backend.
    pub async fn close(&self) {
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        path::{Path, PathBuf},
        sync::OnceLock,
        time::Duration,
    };

    use durable_agents_core::EventStream;
    use durable_agents_transport::backend::{BackendState, LocalBackend};

    use super::*;
    use crate::record::JournalRecord;

    #[derive(Clone)]
    enum Step {
        Partial(&'static str),
        Final(&'static str),
        Fail(&'static str),
        /// Swap the journal file for a read-only handle.
        BreakJournal(Arc<OnceLock<(Arc<std::sync::Mutex<File>>, PathBuf)>>),
        CloseConnection(Arc<OnceLock<Connection>>),
    }

    struct ScriptedAgent {
        steps: Vec<Step>,
    }

    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            "scripted"
        }

        fn run(&self, ctx: InvocationContext) -> EventStream {
            let steps = self.steps.clone();
            let stream = async_stream::stream! {
                for step in steps {
                    match step {
                        Step::Partial(text) => yield Ok(Event::new(&ctx.invocation_id, "scripted")
                            .with_content(Content::model_text(text))
                            .with_partial(true)),
                        Step::Final(text) => yield Ok(Event::new(&ctx.invocation_id, "scripted")
                            .with_content(Content::model_text(text))),
                        Step::Fail(reason) => yield Err(AgentError::Failed(reason.to_string())),
                        Step::BreakJournal(slot) => {
                            let (file, path) = slot.get().unwrap();
                            *file.lock().unwrap() = File::open(path).unwrap();
                        }
                        Step::CloseConnection(slot) => slot.get().unwrap().close().await,
                    }
                }
            };
            Box::pin(stream)
        }
    }

    fn agent(steps: Vec<Step>) -> Arc<dyn Agent> {
        Arc::new(ScriptedAgent { steps })
    }

    fn config(backend: &LocalBackend, path: &Path) -> RunnerConfig {
        RunnerConfig::new(backend.endpoint())
            .with_event_log(path)
            .with_wait_for_durability(true)
            .with_read_timeout(Duration::from_secs(5))
    }

    fn records(path: &Path) -> Vec<JournalRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| JournalRecord::parse(line).unwrap())
            .collect()
    }

    fn text(event: &Event) -> String {
        event.content.as_ref().map(Content::text).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_run_journals_turns_and_resumes() {
        let backend = LocalBackend::spawn(BackendState::new()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_runner.log");

        let runner = Runner::start(
            config(&backend, &path),
            agent(vec![Step::Partial("Hel"), Step::Final("Hello"), Step::Final("Bye")]),
        )
        .await
        .unwrap();
        assert!(runner.recovered_events().is_empty());

        let results: Vec<_> = runner.run(Some(Content::user_text("hi"))).collect().await;
        let events: Vec<Event> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(events.iter().map(text).collect::<Vec<_>>(), ["Hel", "Hello", "Bye"]);
        assert!(events.iter().all(|e| e.branch.is_some()));

        let journal = records(&path);
        assert_eq!(journal.len(), 5);
        let JournalRecord::ActivityStart { kind, input: first_input, output: first_output, .. } =
            &journal[0]
        else {
            panic!("expected activity_start, got {:?}", journal[0]);
        };
        assert_eq!(kind, "agent_start");
        let JournalRecord::ActivityStart { kind, input, .. } = &journal[3] else {
            panic!("expected activity_start, got {:?}", journal[3]);
        };
        assert_eq!(kind, "agent_turn");
        assert_eq!(input, first_output);
        assert_ne!(first_input, first_output);
        runner.close().await;

        let resumed = Runner::start(
            config(&backend, &path).with_resume(true),
            agent(vec![Step::Final("again")]),
        )
        .await
        .unwrap();
        assert_eq!(resumed.recovered_events(), events.as_slice());
        assert!(resumed.diagnostics().is_empty());
        resumed.close().await;
    }

    #[tokio::test]
    async fn test_agent_error_does_not_end_run() {
        let backend = LocalBackend::spawn(BackendState::new()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_runner.log");
        let runner = Runner::start(
            config(&backend, &path),
            agent(vec![Step::Fail("model unavailable"), Step::Final("recovered")]),
        )
        .await
        .unwrap();

        let results: Vec<_> = runner.run(None).collect().await;
        assert_eq!(results.len(), 2);
        let Err(err) = &results[0] else {
            panic!("expected agent error");
        };
        assert!(matches!(err, RunnerError::Agent(_)));
        assert!(!err.is_fatal());
        assert_eq!(text(results[1].as_ref().unwrap()), "recovered");
        runner.close().await;
    }

    #[tokio::test]
    async fn test_trailing_partial_turn_is_closed() {
        let backend = LocalBackend::spawn(BackendState::new()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_runner.log");
        let runner = Runner::start(config(&backend, &path), agent(vec![Step::Partial("Hel")]))
            .await
            .unwrap();

        let results: Vec<_> = runner.run(None).collect().await;
        assert_eq!(results.len(), 1);

        let journal = records(&path);
        assert_eq!(journal.len(), 2);
        let JournalRecord::ActivityStart { output, .. } = &journal[0] else {
            panic!("expected activity_start");
        };
        let session_id = runner.session_id().await;
        assert!(backend.state().is_complete(&session_id, output).await);
        runner.close().await;
    }

    #[tokio::test]
    async fn test_dropped_run_releases_journal() {
        let backend = LocalBackend::spawn(BackendState::new()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_runner.log");
        let runner = Runner::start(
            config(&backend, &path),
            agent(vec![Step::Final("one"), Step::Final("two")]),
        )
        .await
        .unwrap();

        let first: Vec<_> = runner.run(None).take(1).collect().await;
        assert_eq!(first.len(), 1);

        let second = tokio::time::timeout(Duration::from_secs(5), runner.run(None).collect::<Vec<_>>())
            .await
            .expect("second run should not block");
        assert_eq!(second.len(), 2);
        runner.close().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::new("ws://127.0.0.1:1/ws").with_event_log(dir.path().join("j.log"));
        let err = Runner::start(config, agent(vec![])).await.err().unwrap();
        assert!(matches!(err, RunnerError::Transport(TransportError::Connect(_))));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_journal_io_error_does_not_end_run() {
        let backend = LocalBackend::spawn(BackendState::new()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_runner.log");
        let journal = Arc::new(OnceLock::new());
        let runner = Runner::start(
            config(&backend, &path),
            agent(vec![
                Step::Partial("Hel"),
                Step::BreakJournal(Arc::clone(&journal)),
                Step::Final("Hello"),
                Step::Final("Bye"),
            ]),
        )
        .await
        .unwrap();
        let handle = runner.event_log.lock().await.file_handle();
        journal.set((handle, path.clone())).unwrap();

        let results: Vec<_> = runner.run(None).collect().await;
        assert_eq!(results.len(), 5, "{results:?}");
        assert_eq!(text(results[0].as_ref().unwrap()), "Hel");
        assert_eq!(text(results[2].as_ref().unwrap()), "Hello");
        assert_eq!(text(results[4].as_ref().unwrap()), "Bye");
        for idx in [1, 3] {
            let Err(err) = &results[idx] else {
                panic!("expected journal error at {idx}");
            };
            assert!(
                matches!(err, RunnerError::Journal(JournalError::Io { .. })),
                "unexpected error: {err:?}"
            );
            assert!(!err.is_fatal());
        }

        // The final event's record failed, yet its turn still got a terminal frame.
        let journal = records(&path);
        assert_eq!(journal.len(), 2);
        let JournalRecord::ActivityStart { output, .. } = &journal[0] else {
            panic!("expected activity_start");
        };
        let session_id = runner.session_id().await;
        assert!(backend.state().is_complete(&session_id, output).await);
        assert_eq!(
            backend.state().stored_chunks(&session_id, output).await.unwrap().len(),
            1
        );
        assert_eq!(runner.event_log.lock().await.open_activities(), 0);
        runner.close().await;
    }

    #[tokio::test]
    async fn test_transport_error_ends_run() {
        let backend = LocalBackend::spawn(BackendState::new()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_runner.log");
        let connection = Arc::new(OnceLock::new());
        let runner = Runner::start(
            config(&backend, &path),
            agent(vec![
                Step::Final("one"),
                Step::CloseConnection(Arc::clone(&connection)),
                Step::Final("two"),
                Step::Final("three"),
            ]),
        )
        .await
        .unwrap();
        connection.set(runner.connection().clone()).unwrap();

        let results: Vec<_> = runner.run(None).collect().await;
        assert_eq!(results.len(), 2, "{results:?}");
        assert_eq!(text(results[0].as_ref().unwrap()), "one");
        let Err(err) = &results[1] else {
            panic!("expected transport error");
        };
        assert!(
            matches!(
                err,
                RunnerError::Journal(JournalError::Transport(TransportError::Closed(_)))
            ),
            "unexpected error: {err:?}"
        );
        assert!(err.is_fatal());
        assert_eq!(records(&path).len(), 2);
    }
}
