//! Session-multiplexing transport to the execution backend.
//!
//! Provides:
//! - Wire protocol (JSON + base64 payloads)
//! - `Connection` - one websocket, one receive loop, frames demultiplexed by stream id
//! - `Session` - action graph submission and stream restore
//! - `Shadow` - remotely persisted mirror of an output stream
//! - Reference backend (feature: backend)

pub mod connection;
pub mod protocol;
pub mod session;
pub mod shadow;

#[cfg(feature = "backend")]
pub mod backend;

pub use connection::{Connection, Credential, TransportError};
pub use protocol::{ProtocolError, WireMessage};
pub use session::{RestoreStream, Session};
pub use shadow::Shadow;
