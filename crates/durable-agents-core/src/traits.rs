//! Collaborator traits.

use futures::stream::BoxStream;
use thiserror::Error;

use crate::{Event, InvocationContext};

/// Agent error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent failed: {0}")]
    Failed(String),
    #[error("Model error: {0}")]
    Model(String),
    #[error("Tool error: {0}")]
    Tool(String),
}

/// Lazily produced sequence of agent events.
pub type EventStream = BoxStream<'static, Result<Event, AgentError>>;

/// Trait for agent run loops.
///
/// The agent decides what to do; the runner journals what it produced.
/// Dropping the returned stream must stop the agent promptly.
pub trait Agent: Send + Sync {
    /// Name recorded in the journal for this agent's activities.
    fn name(&self) -> &str;

    /// Run one invocation.
    fn run(&self, ctx: InvocationContext) -> EventStream;
}
