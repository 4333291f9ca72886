//! Core types for journaled, resumable agent streams.
//!
//! This crate provides the fundamental building blocks:
//! - `StreamId`, `Chunk`, `Frame` - ordered stream data
//! - `ActionGraph` - requests submitted to the execution backend
//! - `Event` - application unit carried inside JSON chunks
//! - `FrameStore` - per-stream buffering for one shared receive loop
//! - `Agent` - the run loop collaborator

pub mod context;
pub mod event;
pub mod frame_store;
pub mod graph;
pub mod stream;
pub mod traits;

pub use context::InvocationContext;
pub use event::{Blob, Content, Event, Part};
pub use frame_store::{FrameStore, FrameStoreError, FrameSubscription};
pub use graph::{Action, ActionGraph, Port, RESTORE_STREAM, SAVE_STREAM};
pub use stream::{Chunk, Frame, JSON_MIME_TYPE, StreamId, TEXT_MIME_TYPE};
pub use traits::{Agent, AgentError, EventStream};
