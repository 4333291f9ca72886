//! Journal replay at startup.
//!
//! The journal says what was attempted; the backend holds what was written.
//! Replay walks the journal, re-reads every referenced stream once and
//! hands each `stream` record the next event of its stream.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use durable_agents_core::{Event, StreamId};
use durable_agents_transport::{Connection, Session, TransportError};
use thiserror::Error;

use crate::{
    event_log::EventLog,
    record::{JournalRecord, RecordError},
};

/// Resume error.
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("Failed to read journal {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to restore stream {stream_id} from journal {}: {source}", path.display())]
    Restore {
        path: PathBuf,
        stream_id: StreamId,
        #[source]
        source: TransportError,
    },
    #[error("Restoring stream {stream_id} from journal {} timed out after {timeout:?}", path.display())]
    Timeout {
        path: PathBuf,
        stream_id: StreamId,
        timeout: Duration,
    },
    #[error("Stream {stream_id} from journal {} holds unsupported mime type {mime_type:?}", path.display())]
    UnsupportedMimeType {
        path: PathBuf,
        stream_id: StreamId,
        mime_type: String,
    },
    #[error("Failed to decode event on stream {stream_id} from journal {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        stream_id: StreamId,
        #[source]
        source: serde_json::Error,
    },
}

/// Resume settings.
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Upper bound for restoring one stream.
    pub read_timeout: Option<Duration>,
}

impl ResumeOptions {
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// Problem found while replaying that did not stop the replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalDiagnostic {
    /// 1-based journal line, if the problem belongs to one.
    pub line: Option<usize>,
    pub message: String,
}

impl JournalDiagnostic {
    fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    fn general(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for JournalDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Result of a successful resume.
#[derive(Debug)]
pub struct Resumed {
    /// Journal bound to the reopened session, with no open activities.
    pub event_log: EventLog,
    /// Recovered events in journal order.
    pub events: Vec<Event>,
    pub diagnostics: Vec<JournalDiagnostic>,
}

/// Journal contents after the torn tail was cut off.
struct Loaded {
    file: File,
    contents: Vec<u8>,
    torn_bytes: usize,
}

/// Replay the journal at `path` and reopen its session on `connection`.
///
/// # Errors
/// Returns error if the journal cannot be read, a stream cannot be
/// restored, or a restored chunk is not a JSON event.
pub async fn resume(
    path: impl AsRef<Path>,
    connection: &Connection,
    options: ResumeOptions,
) -> Result<Resumed, ResumeError> {
    let path = path.as_ref().to_path_buf();
    let Loaded {
        file,
        contents,
        torn_bytes,
    } = load(&path).await?;

    let mut diagnostics = Vec::new();
    let mut records = Vec::new();
    let mut line_count = 0;
    for (idx, raw) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
        let line_no = idx + 1;
        line_count = line_no;
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let parsed = std::str::from_utf8(raw)
            .map_err(|e| e.to_string())
            .and_then(|line| JournalRecord::parse(line).map_err(|e: RecordError| e.to_string()));
        match parsed {
            Ok(record) => records.push((line_no, record)),
            Err(reason) => diagnostics.push(JournalDiagnostic::at(line_no, reason)),
        }
    }
    if torn_bytes > 0 {
        diagnostics.push(JournalDiagnostic::at(
            line_count + 1,
            format!("dropped torn trailing fragment of {torn_bytes} bytes"),
        ));
    }

    // The last stream write names the session; activity starts only count
    // when nothing was ever written.
    let last_session = records
        .iter()
        .rev()
        .find(|(_, record)| matches!(record, JournalRecord::Stream { .. }))
        .or_else(|| records.last())
        .map(|(_, record)| record.session_id().to_owned());
    let session: Session = match last_session {
        Some(id) => connection.open_session(id),
        None => connection.new_session(),
    };

    let mut outputs = HashSet::new();
    let mut stream_records: Vec<(usize, StreamId)> = Vec::new();
    for (line_no, record) in records {
        if record.session_id() != session.id() {
            diagnostics.push(JournalDiagnostic::at(
                line_no,
                format!(
                    "record belongs to session {}, not {}",
                    record.session_id(),
                    session.id()
                ),
            ));
            continue;
        }
        match record {
            JournalRecord::ActivityStart { output, .. } => {
                outputs.insert(output);
            }
            JournalRecord::Stream { stream_id, .. } => stream_records.push((line_no, stream_id)),
        }
    }

    let mut read_order: Vec<StreamId> = Vec::new();
    for (_, stream_id) in &stream_records {
        if !read_order.contains(stream_id) {
            read_order.push(stream_id.clone());
        }
    }

    let mut remote: HashMap<StreamId, VecDeque<Event>> = HashMap::new();
    for stream_id in &read_order {
        let events = restore_events(&path, &session, stream_id, options.read_timeout).await?;
        remote.insert(stream_id.clone(), events);
    }

    let mut events = Vec::with_capacity(stream_records.len());
    for (line_no, stream_id) in &stream_records {
        match remote.get_mut(stream_id).and_then(VecDeque::pop_front) {
            Some(event) => events.push(event),
            None => diagnostics.push(JournalDiagnostic::at(
                *line_no,
                format!("no remote payload for stream {stream_id}"),
            )),
        }
    }
    for stream_id in &read_order {
        let extra = remote.get(stream_id).map_or(0, VecDeque::len);
        if extra > 0 {
            diagnostics.push(JournalDiagnostic::general(format!(
                "stream {stream_id} holds {extra} events without a journal record"
            )));
        }
    }

    for diagnostic in &diagnostics {
        tracing::warn!(path = %path.display(), "Journal diagnostic: {diagnostic}");
    }
    tracing::info!(
        path = %path.display(),
        session_id = %session.id(),
        streams = read_order.len(),
        events = events.len(),
        diagnostics = diagnostics.len(),
        "Journal resumed"
    );

    Ok(Resumed {
        event_log: EventLog::from_parts(path, file, session, outputs),
        events,
        diagnostics,
    })
}

/// Open for read and append, cutting off a trailing fragment with no newline.
async fn load(path: &Path) -> Result<Loaded, ResumeError> {
    let open_path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&open_path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let complete = contents
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        let torn_bytes = contents.len() - complete;
        if torn_bytes > 0 {
            file.set_len(complete as u64)?;
            file.sync_data()?;
            contents.truncate(complete);
        }
        Ok(Loaded {
            file,
            contents,
            torn_bytes,
        })
    })
    .await
    .map_err(io::Error::other)
    .and_then(|r| r)
    .map_err(|source| ResumeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn restore_events(
    path: &Path,
    session: &Session,
    stream_id: &StreamId,
    timeout: Option<Duration>,
) -> Result<VecDeque<Event>, ResumeError> {
    let read = session.read_all(stream_id);
    let chunks = match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| ResumeError::Timeout {
                path: path.to_path_buf(),
                stream_id: stream_id.clone(),
                timeout: limit,
            })?,
        None => read.await,
    }
    .map_err(|source| ResumeError::Restore {
        path: path.to_path_buf(),
        stream_id: stream_id.clone(),
        source,
    })?;

    tracing::debug!(%stream_id, chunks = chunks.len(), "Stream restored");
    chunks
        .into_iter()
        .map(|chunk| {
            if !chunk.is_json() {
                return Err(ResumeError::UnsupportedMimeType {
                    path: path.to_path_buf(),
                    stream_id: stream_id.clone(),
                    mime_type: chunk.mime_type,
                });
            }
            chunk.decode_json().map_err(|source| ResumeError::Decode {
                path: path.to_path_buf(),
                stream_id: stream_id.clone(),
                source,
            })
        })
        .collect()
}
