//! Invocation context handed to an agent run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Content;

/// Data of a single invocation of an agent.
///
/// An invocation starts with optional user content and ends when the
/// agent's event stream ends. Apps may attach arbitrary metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    /// Id stamped on every event of this invocation.
    pub invocation_id: String,

    /// Name of the agent being run.
    pub agent_name: String,

    /// User content that started this invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_content: Option<Content>,

    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InvocationContext {
    /// Create a context with a fresh invocation id.
    #[must_use]
    pub fn new(agent_name: impl Into<String>, user_content: Option<Content>) -> Self {
        Self {
            invocation_id: format!("e-{}", Uuid::new_v4()),
            agent_name: agent_name.into(),
            user_content,
            metadata: HashMap::new(),
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}
