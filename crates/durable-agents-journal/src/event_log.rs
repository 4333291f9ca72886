//! Append-only journal of activity starts and stream writes.

use std::{
    collections::{HashMap, HashSet},
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use durable_agents_core::{Chunk, Event, StreamId};
use durable_agents_transport::{Session, Shadow, TransportError};
use thiserror::Error;

use crate::record::JournalRecord;

/// Journal error.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No open activity for stream {0}")]
    UnknownStream(StreamId),
    #[error("Stream {0} is already an activity output")]
    DuplicateStream(StreamId),
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl JournalError {
    /// Whether the journal can keep accepting events after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Serialize(_))
    }
}

/// How [`EventLog::open`] treats an existing journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    /// Truncate to an empty journal.
    Fresh,
    /// Keep existing records and append after them.
    #[default]
    Append,
}

/// Append-only journal bound to one session.
///
/// Single writer. Every activity gets a [`Shadow`] for its output stream;
/// the shadow table is keyed by output stream id and a shadow leaves it
/// when its turn ends.
pub struct EventLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    session: Session,
    shadows: HashMap<StreamId, Shadow>,
    outputs: HashSet<StreamId>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.path)
            .field("session", &self.session.id())
            .field("open_streams", &self.shadows.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Open the journal at `path`, creating it if absent.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or truncated.
    pub async fn open(
        path: impl AsRef<Path>,
        session: Session,
        mode: StartMode,
    ) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let file = blocking(&path, move || {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&open_path)?;
            if mode == StartMode::Fresh {
                file.set_len(0)?;
            }
            Ok(file)
        })
        .await?;

        tracing::info!(
            path = %path.display(),
            session_id = %session.id(),
            ?mode,
            "Event log opened"
        );
        Ok(Self::from_parts(path, file, session, HashSet::new()))
    }

    /// Bind an already opened journal file.
    ///
    /// `outputs` are stream ids earlier activities used as outputs.
    pub(crate) fn from_parts(
        path: PathBuf,
        file: File,
        session: Session,
        outputs: HashSet<StreamId>,
    ) -> Self {
        Self {
            path,
            file: Arc::new(Mutex::new(file)),
            session,
            shadows: HashMap::new(),
            outputs,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Shadow of a still open activity.
    #[must_use]
    pub fn shadow(&self, output: &StreamId) -> Option<&Shadow> {
        self.shadows.get(output)
    }

    /// Number of activities whose turn has not ended.
    #[must_use]
    pub fn open_activities(&self) -> usize {
        self.shadows.len()
    }

    /// Start an activity writing to `output`.
    ///
    /// Creates the shadow first; if that fails nothing is journaled.
    ///
    /// # Errors
    /// Returns `DuplicateStream` if `output` was already used, a transport
    /// error if the shadow cannot be created, or an I/O error if the
    /// journal write fails.
    pub async fn log_activity(
        &mut self,
        kind: &str,
        name: &str,
        input: &StreamId,
        output: &StreamId,
    ) -> Result<Shadow, JournalError> {
        if self.outputs.contains(output) {
            return Err(JournalError::DuplicateStream(output.clone()));
        }

        let shadow = self.session.new_shadow(name, input, output).await?;
        self.append(JournalRecord::ActivityStart {
            session_id: self.session.id().to_owned(),
            kind: kind.to_owned(),
            name: name.to_owned(),
            input: input.clone(),
            output: output.clone(),
        })
        .await?;

        tracing::debug!(kind, name, %input, %output, "Activity started");
        self.outputs.insert(output.clone());
        self.shadows.insert(output.clone(), shadow.clone());
        Ok(shadow)
    }

    /// Journal `event` and forward it to the shadow of `output`.
    ///
    /// A non-partial event is the terminal frame of the turn and closes
    /// the activity.
    ///
    /// # Errors
    /// Returns `UnknownStream` without writing anything if `output` has no
    /// open activity.
    pub async fn log_event(&mut self, output: &StreamId, event: &Event) -> Result<(), JournalError> {
        let shadow = self
            .shadows
            .get(output)
            .cloned()
            .ok_or_else(|| JournalError::UnknownStream(output.clone()))?;
        let chunk = Chunk::json(event)?;

        self.append(JournalRecord::Stream {
            session_id: self.session.id().to_owned(),
            stream_id: output.clone(),
        })
        .await?;
        shadow.write_frame(output, chunk, event.partial).await?;

        if event.is_final() {
            self.shadows.remove(output);
            tracing::debug!(%output, "Activity finished");
        }
        Ok(())
    }

    /// Close a turn that ended on a partial event.
    ///
    /// # Errors
    /// Returns `UnknownStream` if `output` has no open activity.
    pub async fn finish_turn(&mut self, output: &StreamId) -> Result<Shadow, JournalError> {
        let shadow = self
            .shadows
            .remove(output)
            .ok_or_else(|| JournalError::UnknownStream(output.clone()))?;
        shadow.finish().await?;
        tracing::debug!(%output, "Activity finished without final event");
        Ok(shadow)
    }

    #[cfg(test)]
    pub(crate) fn file_handle(&self) -> Arc<Mutex<File>> {
        Arc::clone(&self.file)
    }

    async fn append(&self, record: JournalRecord) -> Result<(), JournalError> {
        let line = record.encode();
        let file = Arc::clone(&self.file);
        let sync_path = self.path.clone();
        blocking(&self.path, move || {
            let mut file = file
                .lock()
                .map_err(|_| io::Error::other("journal file lock poisoned"))?;
            file.write_all(line.as_bytes())?;
            if let Err(e) = file.sync_data() {
                tracing::warn!(path = %sync_path.display(), "Journal sync failed: {e}");
            }
            Ok(())
        })
        .await
    }
}

/// Run file I/O on the blocking pool.
///
/// The task runs to completion even if the caller is dropped.
async fn blocking<T, F>(path: &Path, f: F) -> Result<T, JournalError>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)
        .and_then(|r| r)
        .map_err(|source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        })
}
