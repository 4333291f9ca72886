//! Journal line format.
//!
//! One record per line, fields separated by `|`:
//!
//! ```text
//! <session>|activity_start|<kind>|<name>|<input>|<output>
//! <session>|stream|<stream>
//! ```
//!
//! `%`, `|`, `\n` and `\r` inside a field are written as `%25`, `%7C`,
//! `%0A` and `%0D`.

use std::fmt::Write as _;

use durable_agents_core::StreamId;
use thiserror::Error;

const DELIMITER: char = '|';
const ACTIVITY_START: &str = "activity_start";
const STREAM: &str = "stream";

/// Record parse error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("empty record")]
    Empty,
    #[error("unknown record kind {0:?}")]
    UnknownKind(String),
    #[error("{kind} record has {found} fields, expected {expected}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid escape sequence in {0:?}")]
    BadEscape(String),
    #[error("empty session id")]
    MissingSession,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// An activity opened a shadow for its output stream.
    ActivityStart {
        session_id: String,
        kind: String,
        name: String,
        input: StreamId,
        output: StreamId,
    },
    /// An event was handed to the shadow of `stream_id`.
    Stream {
        session_id: String,
        stream_id: StreamId,
    },
}

impl JournalRecord {
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::ActivityStart { session_id, .. } | Self::Stream { session_id, .. } => session_id,
        }
    }

    /// Encode as one line, including the trailing newline.
    #[must_use]
    pub fn encode(&self) -> String {
        let fields: Vec<&str> = match self {
            Self::ActivityStart {
                session_id,
                kind,
                name,
                input,
                output,
            } => vec![
                session_id,
                ACTIVITY_START,
                kind,
                name,
                input.as_str(),
                output.as_str(),
            ],
            Self::Stream {
                session_id,
                stream_id,
            } => vec![session_id, STREAM, stream_id.as_str()],
        };
        let mut line = String::new();
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                line.push(DELIMITER);
            }
            escape_into(&mut line, field);
        }
        line.push('\n');
        line
    }

    /// Parse one line, without its trailing newline.
    ///
    /// # Errors
    /// Returns error if the line is not a well-formed record.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return Err(RecordError::Empty);
        }
        let fields = line
            .split(DELIMITER)
            .map(unescape)
            .collect::<Result<Vec<_>, _>>()?;
        if fields.len() < 2 {
            return Err(RecordError::UnknownKind(line.to_owned()));
        }
        if fields[0].is_empty() {
            return Err(RecordError::MissingSession);
        }

        let mut fields = fields.into_iter();
        let session_id = fields.next().unwrap_or_default();
        let kind = fields.next().unwrap_or_default();
        let rest: Vec<String> = fields.collect();

        match kind.as_str() {
            ACTIVITY_START => {
                let [kind, name, input, output]: [String; 4] =
                    rest.try_into().map_err(|rest: Vec<String>| RecordError::FieldCount {
                        kind: ACTIVITY_START,
                        expected: 6,
                        found: rest.len() + 2,
                    })?;
                Ok(Self::ActivityStart {
                    session_id,
                    kind,
                    name,
                    input: StreamId::new(input),
                    output: StreamId::new(output),
                })
            }
            STREAM => {
                let [stream_id]: [String; 1] =
                    rest.try_into().map_err(|rest: Vec<String>| RecordError::FieldCount {
                        kind: STREAM,
                        expected: 3,
                        found: rest.len() + 2,
                    })?;
                Ok(Self::Stream {
                    session_id,
                    stream_id: StreamId::new(stream_id),
                })
            }
            _ => Err(RecordError::UnknownKind(kind)),
        }
    }
}

fn escape_into(out: &mut String, field: &str) {
    for c in field.chars() {
        match c {
            '%' | '|' | '\n' | '\r' => {
                let _ = write!(out, "%{:02X}", c as u32);
            }
            _ => out.push(c),
        }
    }
}

fn unescape(field: &str) -> Result<String, RecordError> {
    if !field.contains('%') {
        return Ok(field.to_owned());
    }
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 1..pos + 3)
            .ok_or_else(|| RecordError::BadEscape(field.to_owned()))?;
        let decoded = match code {
            "25" => '%',
            "7C" | "7c" => '|',
            "0A" | "0a" => '\n',
            "0D" | "0d" => '\r',
            _ => return Err(RecordError::BadEscape(field.to_owned())),
        };
        out.push(decoded);
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}
