//! Action graphs submitted to the execution backend.

use serde::{Deserialize, Serialize};

use crate::StreamId;

/// Action that persists every frame written to its input stream.
pub const SAVE_STREAM: &str = "save_stream";

/// Action that replays every persisted frame of a stream.
pub const RESTORE_STREAM: &str = "restore_stream";

/// A named port bound to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub name: String,
    pub stream_id: StreamId,
}

impl Port {
    #[must_use]
    pub fn new(name: impl Into<String>, stream_id: StreamId) -> Self {
        Self {
            name: name.into(),
            stream_id,
        }
    }
}

/// A named operation wired through input and output ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Port>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Port>,
}

impl Action {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn input(mut self, name: impl Into<String>, stream_id: StreamId) -> Self {
        self.inputs.push(Port::new(name, stream_id));
        self
    }

    #[must_use]
    pub fn output(mut self, name: impl Into<String>, stream_id: StreamId) -> Self {
        self.outputs.push(Port::new(name, stream_id));
        self
    }

    /// First port with the given name on either side.
    #[must_use]
    pub fn port(&self, name: &str) -> Option<&Port> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .find(|p| p.name == name)
    }
}

/// Ordered actions plus the output ports the backend must resolve with frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGraph {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Port>,
}

impl ActionGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    #[must_use]
    pub fn observe(mut self, name: impl Into<String>, stream_id: StreamId) -> Self {
        self.outputs.push(Port::new(name, stream_id));
        self
    }

    /// Persist frames later written to `source`; `wait` resolves once they are durable.
    #[must_use]
    pub fn save_stream(source: &StreamId, wait: &StreamId) -> Self {
        Self::new()
            .action(
                Action::new(SAVE_STREAM)
                    .input("input", source.clone())
                    .output("output", wait.clone()),
            )
            .observe("output", wait.clone())
    }

    /// Replay every persisted frame of `stream` on the same stream id.
    #[must_use]
    pub fn restore_stream(stream: &StreamId) -> Self {
        Self::new()
            .action(Action::new(RESTORE_STREAM).output("output", stream.clone()))
            .observe("output", stream.clone())
    }
}
