//! Logical execution context on a shared connection.

use std::fmt;

use durable_agents_core::{ActionGraph, Chunk, Frame, FrameSubscription, StreamId};
use futures::Stream;

use crate::{
    connection::{Connection, TransportError},
    protocol::WireMessage,
    shadow::Shadow,
};

/// Address for action graphs submitted over a connection.
#[derive(Clone)]
pub struct Session {
    id: String,
    connection: Connection,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) const fn new(id: String, connection: Connection) -> Self {
        Self { id, connection }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Submit an action graph. Resolution arrives later as frames.
    ///
    /// # Errors
    /// Returns error if the connection is closed or the write fails.
    pub async fn submit(&self, graph: ActionGraph) -> Result<(), TransportError> {
        tracing::debug!(
            session_id = %self.id,
            actions = ?graph.actions.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            "Submitting action graph"
        );
        self.connection.send(&WireMessage::submit(&self.id, graph)).await
    }

    /// Send one frame on an already established stream.
    ///
    /// # Errors
    /// Returns error if the connection is closed or the write fails.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        self.connection.send(&WireMessage::frames([frame])).await
    }

    /// Ask the backend to persist frames later written to `output`.
    ///
    /// Returns before persistence completes; use [`Shadow::wait`] to confirm it.
    ///
    /// # Errors
    /// Returns error if the `save_stream` graph cannot be submitted.
    pub async fn new_shadow(
        &self,
        name: &str,
        input: &StreamId,
        output: &StreamId,
    ) -> Result<Shadow, TransportError> {
        let wait_stream_id = StreamId::generate();
        let subscription = self.connection.subscribe(&wait_stream_id)?;
        self.submit(ActionGraph::save_stream(output, &wait_stream_id))
            .await?;
        tracing::debug!(
            session_id = %self.id,
            name,
            %output,
            wait = %wait_stream_id,
            "Shadow created"
        );
        Ok(Shadow::new(
            self.clone(),
            name,
            input.clone(),
            output.clone(),
            wait_stream_id,
            subscription,
        ))
    }

    /// Replay every persisted frame of `stream_id`.
    ///
    /// Dropping the returned reader releases the subscription.
    ///
    /// # Errors
    /// Returns error if the `restore_stream` graph cannot be submitted.
    pub async fn restore_stream(&self, stream_id: &StreamId) -> Result<RestoreStream, TransportError> {
        let subscription = self.connection.subscribe(stream_id)?;
        self.submit(ActionGraph::restore_stream(stream_id)).await?;
        Ok(RestoreStream {
            connection: self.connection.clone(),
            subscription,
            finished: false,
        })
    }

    /// Read every persisted chunk of `stream_id`, skipping chunkless frames.
    ///
    /// # Errors
    /// Returns error if the connection closes before the terminal frame.
    pub async fn read_all(&self, stream_id: &StreamId) -> Result<Vec<Chunk>, TransportError> {
        let mut reader = self.restore_stream(stream_id).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Chunks of one stream being replayed by the backend.
#[derive(Debug)]
pub struct RestoreStream {
    connection: Connection,
    subscription: FrameSubscription,
    finished: bool,
}

impl RestoreStream {
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        self.subscription.stream_id()
    }

    /// Next chunk, or `None` after the terminal frame.
    ///
    /// # Errors
    /// Returns error if the connection closes before the terminal frame.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransportError> {
        while !self.finished {
            let Some(frame) = self.subscription.next_frame().await else {
                self.finished = true;
                return Err(self.connection.ended_error(self.subscription.stream_id()));
            };
            self.finished = frame.is_terminal();
            if let Some(chunk) = frame.chunk {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }

    /// Convert into a `Stream` of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Chunk, TransportError>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }
}
