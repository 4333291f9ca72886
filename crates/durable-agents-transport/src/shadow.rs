//! Remotely persisted mirror of one locally produced stream.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use durable_agents_core::{Chunk, Frame, FrameSubscription, StreamId};
use tokio::sync::Mutex;

use crate::{connection::TransportError, session::Session};

enum WaitState {
    Waiting(FrameSubscription),
    Resolved,
}

struct Inner {
    session: Session,
    display_name: String,
    input: StreamId,
    output: StreamId,
    wait_stream_id: StreamId,
    finished: AtomicBool,
    waiter: Mutex<WaitState>,
}

/// Handle for a remotely persisted mirror of an output stream.
///
/// Cheap to clone; clones share the terminal-frame and wait state.
#[derive(Clone)]
pub struct Shadow {
    inner: Arc<Inner>,
}

impl fmt::Debug for Shadow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shadow")
            .field("session", &self.inner.session.id())
            .field("name", &self.inner.display_name)
            .field("input", &self.inner.input)
            .field("output", &self.inner.output)
            .field("wait_stream_id", &self.inner.wait_stream_id)
            .finish_non_exhaustive()
    }
}

impl Shadow {
    pub(crate) fn new(
        session: Session,
        display_name: &str,
        input: StreamId,
        output: StreamId,
        wait_stream_id: StreamId,
        subscription: FrameSubscription,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                display_name: display_name.to_owned(),
                input,
                output,
                wait_stream_id,
                finished: AtomicBool::new(false),
                waiter: Mutex::new(WaitState::Waiting(subscription)),
            }),
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    #[must_use]
    pub fn input(&self) -> &StreamId {
        &self.inner.input
    }

    #[must_use]
    pub fn output(&self) -> &StreamId {
        &self.inner.output
    }

    #[must_use]
    pub fn wait_stream_id(&self) -> &StreamId {
        &self.inner.wait_stream_id
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Whether the terminal frame was written.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Write one frame to the tracked output stream.
    ///
    /// `continued = false` marks the terminal frame and may be written once.
    ///
    /// # Errors
    /// Returns error if `stream_id` is not the tracked output, the terminal
    /// frame was already written, or the send fails.
    pub async fn write_frame(
        &self,
        stream_id: &StreamId,
        chunk: Chunk,
        continued: bool,
    ) -> Result<(), TransportError> {
        if *stream_id != self.inner.output {
            return Err(TransportError::UnexpectedStream {
                expected: self.inner.output.clone(),
                actual: stream_id.clone(),
            });
        }
        self.send(Some(chunk), continued).await
    }

    /// Write a chunkless terminal frame unless one was already written.
    ///
    /// # Errors
    /// Returns error if the send fails.
    pub async fn finish(&self) -> Result<(), TransportError> {
        if self.is_finished() {
            return Ok(());
        }
        self.send(None, false).await
    }

    async fn send(&self, chunk: Option<Chunk>, continued: bool) -> Result<(), TransportError> {
        let already_finished = if continued {
            self.is_finished()
        } else {
            self.inner.finished.swap(true, Ordering::SeqCst)
        };
        if already_finished {
            return Err(TransportError::StreamFinished(self.inner.output.clone()));
        }
        self.inner
            .session
            .write_frame(&Frame::new(self.inner.output.clone(), chunk, continued))
            .await
    }

    /// Block until the backend confirms the mirrored stream is durable.
    ///
    /// Only the calling task suspends. Resolves once per shadow; later calls
    /// return immediately. Cancelling a wait keeps its progress.
    ///
    /// # Errors
    /// Returns error if the connection closes before confirmation.
    pub async fn wait(&self) -> Result<(), TransportError> {
        let mut state = self.inner.waiter.lock().await;
        let WaitState::Waiting(subscription) = &mut *state else {
            return Ok(());
        };
        self.inner
            .session
            .connection()
            .next_matching(subscription, Frame::is_terminal)
            .await?;
        *state = WaitState::Resolved;
        tracing::debug!(
            output = %self.inner.output,
            wait = %self.inner.wait_stream_id,
            "Shadow durable"
        );
        Ok(())
    }
}
