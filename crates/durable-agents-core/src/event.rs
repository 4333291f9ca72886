//! Application events produced by an agent run.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// Inline binary data.
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

impl Part {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::InlineData { .. } => None,
        }
    }
}

/// Inline binary payload (base64 encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Message content: a role and its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    #[must_use]
    pub fn new(role: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            role: role.into(),
            parts,
        }
    }

    /// Single text part from the user.
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new("user", vec![Part::text(text)])
    }

    /// Single text part from the model.
    #[must_use]
    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new("model", vec![Part::text(text)])
    }

    /// Concatenated text of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

/// Application unit carried as JSON inside a stream chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub invocation_id: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// Streaming fragment of a not yet complete response.
    #[serde(default)]
    pub partial: bool,
    /// Creation time (Unix epoch seconds).
    #[serde(default)]
    pub timestamp: i64,
}

impl Event {
    /// Create an event with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            branch: None,
            content: None,
            partial: false,
            timestamp: now(),
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    #[must_use]
    pub const fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Whether this event closes its turn.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        !self.partial
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
