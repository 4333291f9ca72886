//! Local journal and crash recovery for agent runs.
//!
//! Provides:
//! - `EventLog` - append-only record of activity starts and stream writes
//! - `resume` - replay of the journal against the backend after a restart
//! - `Runner` - drives an `Agent` and journals its events
//! - `RunnerConfig` - environment-driven configuration

pub mod config;
pub mod event_log;
pub mod record;
pub mod recovery;
pub mod runner;

pub use config::{DEFAULT_EVENT_LOG, RunnerConfig};
pub use event_log::{EventLog, JournalError, StartMode};
pub use record::{JournalRecord, RecordError};
pub use recovery::{JournalDiagnostic, ResumeError, ResumeOptions, Resumed, resume};
pub use runner::{Runner, RunnerError};
