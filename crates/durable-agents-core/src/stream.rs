//! Stream identifiers, chunks and frames.

use std::{borrow::Borrow, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Mime type of chunks carrying serialized events.
pub const JSON_MIME_TYPE: &str = "application/json";

/// Mime type of plain text chunks.
pub const TEXT_MIME_TYPE: &str = "text/plain";

/// Opaque name of a unidirectional, ordered byte stream known to both sides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One unit of stream data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Mime type of the payload.
    pub mime_type: String,
    /// Raw payload bytes.
    pub data: Bytes,
}

impl Chunk {
    /// Create a chunk from a mime type and payload.
    #[must_use]
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Serialize a value into an `application/json` chunk.
    ///
    /// # Errors
    /// Returns error if the value cannot be serialized.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(JSON_MIME_TYPE, serde_json::to_vec(value)?))
    }

    /// Create a `text/plain` chunk.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(TEXT_MIME_TYPE, text.into())
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        self.mime_type == JSON_MIME_TYPE
    }

    /// Decode the payload as JSON, regardless of mime type.
    ///
    /// # Errors
    /// Returns error if the payload is not valid JSON for `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Approximate in-memory size, used for buffer accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.mime_type.len() + self.data.len()
    }
}

/// One ordered unit of a stream, tagged with a continuation flag.
///
/// `continued == false` marks the terminal frame of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub chunk: Option<Chunk>,
    pub continued: bool,
}

impl Frame {
    #[must_use]
    pub const fn new(stream_id: StreamId, chunk: Option<Chunk>, continued: bool) -> Self {
        Self {
            stream_id,
            chunk,
            continued,
        }
    }

    /// A chunkless terminal frame.
    #[must_use]
    pub const fn end(stream_id: StreamId) -> Self {
        Self::new(stream_id, None, false)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.continued
    }

    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        self.stream_id.as_str().len() + self.chunk.as_ref().map_or(0, Chunk::approx_bytes) + OVERHEAD
    }
}
