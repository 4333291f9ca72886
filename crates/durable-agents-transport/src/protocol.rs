//! Wire protocol between the runtime and the execution backend.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use durable_agents_core::{ActionGraph, Chunk, Frame, StreamId};
use serde::{Deserialize, Serialize};

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base64 payload on stream {stream_id}: {source}")]
    Base64 {
        stream_id: StreamId,
        source: base64::DecodeError,
    },
    #[error("Unexpected action graph in inbound message")]
    UnexpectedActionGraph,
}

/// Chunk as carried on the wire (payload base64 encoded).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChunk {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

impl From<&Chunk> for WireChunk {
    fn from(chunk: &Chunk) -> Self {
        Self {
            mime_type: chunk.mime_type.clone(),
            data: BASE64.encode(&chunk.data),
        }
    }
}

/// Frame as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFrame {
    pub stream_id: StreamId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WireChunk>,
    #[serde(default)]
    pub continued: bool,
}

impl From<&Frame> for WireFrame {
    fn from(frame: &Frame) -> Self {
        Self {
            stream_id: frame.stream_id.clone(),
            data: frame.chunk.as_ref().map(WireChunk::from),
            continued: frame.continued,
        }
    }
}

impl TryFrom<WireFrame> for Frame {
    type Error = ProtocolError;

    fn try_from(wire: WireFrame) -> Result<Self, Self::Error> {
        let chunk = match wire.data {
            Some(data) => {
                let bytes = BASE64.decode(&data.data).map_err(|source| ProtocolError::Base64 {
                    stream_id: wire.stream_id.clone(),
                    source,
                })?;
                Some(Chunk::new(data.mime_type, Bytes::from(bytes)))
            }
            None => None,
        };
        Ok(Self::new(wire.stream_id, chunk, wire.continued))
    }
}

/// One JSON message in either direction.
///
/// Outbound messages carry either an action graph (with a session id) or
/// stream frames. Inbound messages always carry frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_graph: Option<ActionGraph>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_frames: Vec<WireFrame>,
}

impl WireMessage {
    /// Submit an action graph for a session.
    #[must_use]
    pub fn submit(session_id: impl Into<String>, graph: ActionGraph) -> Self {
        Self {
            session_id: Some(session_id.into()),
            action_graph: Some(graph),
            stream_frames: Vec::new(),
        }
    }

    /// Frame-only message.
    #[must_use]
    pub fn frames<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> Self {
        Self {
            session_id: None,
            action_graph: None,
            stream_frames: frames.into_iter().map(WireFrame::from).collect(),
        }
    }

    /// Parse an inbound message into its frames.
    ///
    /// # Errors
    /// Returns error if the message is malformed or carries an action graph.
    pub fn decode_inbound(text: &str) -> Result<Vec<Frame>, ProtocolError> {
        let msg: Self = serde_json::from_str(text)?;
        if msg.action_graph.is_some() {
            return Err(ProtocolError::UnexpectedActionGraph);
        }
        msg.stream_frames.into_iter().map(Frame::try_from).collect()
    }
}
