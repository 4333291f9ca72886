//! Journaled run followed by a resume.
//!
//! Run with: cargo run -p resume-demo -- "your prompt"
//!
//! Without `DURABLE_AGENTS_ENDPOINT` an in-process reference backend is
//! started. With `DURABLE_AGENTS_RESUME=1` the run is skipped and only the
//! existing journal is replayed; that mode needs `DURABLE_AGENTS_ENDPOINT`,
//! since a fresh in-process backend holds none of the journaled streams.

use std::sync::Arc;

use durable_agents_core::{Agent, Content, Event, EventStream, InvocationContext};
use durable_agents_journal::{Runner, RunnerConfig};
use durable_agents_transport::backend::{BackendState, LocalBackend};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Echoes the prompt word by word, then closes with a second turn.
struct EchoAgent;

impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    fn run(&self, ctx: InvocationContext) -> EventStream {
        let prompt = ctx
            .user_content
            .as_ref()
            .map(Content::text)
            .unwrap_or_default();
        let author = self.name().to_owned();
        let stream = async_stream::stream! {
            let mut so_far = String::new();
            for word in prompt.split_whitespace() {
                if !so_far.is_empty() {
                    so_far.push(' ');
                }
                so_far.push_str(word);
                yield Ok(Event::new(&ctx.invocation_id, &author)
                    .with_content(Content::model_text(so_far.clone()))
                    .with_partial(true));
            }
            yield Ok(Event::new(&ctx.invocation_id, &author)
                .with_content(Content::model_text(format!("You said: {so_far}"))));
            yield Ok(Event::new(&ctx.invocation_id, &author)
                .with_content(Content::model_text("Done.")));
        };
        Box::pin(stream)
    }
}

/// Whether to start the in-process backend for `config`.
fn needs_local_backend(config: &RunnerConfig) -> anyhow::Result<bool> {
    match (config.endpoint.is_empty(), config.resume) {
        (true, true) => anyhow::bail!(
            "DURABLE_AGENTS_RESUME requires DURABLE_AGENTS_ENDPOINT; \
             an in-process backend starts without the journaled streams"
        ),
        (local, _) => Ok(local),
    }
}

fn describe(event: &Event) -> String {
    let text = event.content.as_ref().map(Content::text).unwrap_or_default();
    let marker = if event.partial { " (partial)" } else { "" };
    format!("[{}] {text}{marker}", event.author)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = RunnerConfig::from_env().with_wait_for_durability(true);
    let _backend = if needs_local_backend(&config)? {
        let backend = LocalBackend::spawn(BackendState::new()).await?;
        config.endpoint = backend.endpoint();
        Some(backend)
    } else {
        None
    };

    let agent: Arc<dyn Agent> = Arc::new(EchoAgent);

    if !config.resume {
        let prompt = std::env::args()
            .nth(1)
            .unwrap_or_else(|| "durable streams survive restarts".to_owned());
        let runner = Runner::start(config.clone(), Arc::clone(&agent)).await?;
        let mut events = runner.run(Some(Content::user_text(prompt)));
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => println!("live      {}", describe(&event)),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => tracing::warn!("Run error: {e}"),
            }
        }
        drop(events);
        runner.close().await;
    }

    let resumed = Runner::start(config.with_resume(true), agent).await?;
    for diagnostic in resumed.diagnostics() {
        tracing::warn!("Journal diagnostic: {diagnostic}");
    }
    println!(
        "Recovered {} events for session {} from {}",
        resumed.recovered_events().len(),
        resumed.session_id().await,
        resumed.config().event_log.display()
    );
    for event in resumed.recovered_events() {
        println!("recovered {}", describe(event));
    }
    resumed.close().await;
    Ok(())
}
