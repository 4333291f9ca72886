//! Per-stream frame buffering and subscription.
//!
//! The connection's receive loop pushes every inbound frame here. Frames for a
//! stream nobody subscribed to yet are buffered, so a subscriber that shows up
//! late still sees the whole stream in order.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{Frame, StreamId};

/// Default budget for frames nobody is subscribed to (16 MiB).
const BUFFER_BYTES: usize = 16 * 1024 * 1024;

/// Frame store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameStoreError {
    #[error("Frame store closed: {0}")]
    Closed(String),
}

struct Pending {
    frames: VecDeque<Frame>,
    bytes: usize,
    seq: u64,
}

enum Slot {
    /// Frames waiting for a subscriber.
    Pending(Pending),
    /// Frames go straight to this subscriber.
    Live(mpsc::UnboundedSender<Frame>),
    /// Subscriber went away mid-stream; discard until the terminal frame,
    /// then hand the stream to the queued subscriber, if any.
    Draining(Option<mpsc::UnboundedSender<Frame>>),
}

struct Inner {
    slots: HashMap<StreamId, Slot>,
    buffered_bytes: usize,
    next_seq: u64,
    closed: Option<String>,
}

/// Demultiplexing table of inbound frames keyed by stream id.
///
/// Unclaimed frames are bounded by a byte budget. Once it is exceeded the
/// oldest unclaimed stream is dropped whole, with a warning, so a slow or
/// absent subscriber cannot grow memory without limit. Subscribe before
/// asking the backend for a stream: a subscriber that arrives after its
/// stream was evicted never sees a terminal frame, and `next_frame` then
/// waits until the store closes. Callers that cannot subscribe first must
/// bound the wait themselves, for example with `tokio::time::timeout`.
pub struct FrameStore {
    inner: Mutex<Inner>,
    budget: usize,
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStore {
    /// Create a store with the default buffer budget.
    #[must_use]
    pub fn new() -> Self {
        Self::with_budget(BUFFER_BYTES)
    }

    /// Create a store that buffers at most `budget` bytes of unclaimed frames.
    #[must_use]
    pub fn with_budget(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                buffered_bytes: 0,
                next_seq: 0,
                closed: None,
            }),
            budget,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one inbound frame to its subscriber or buffer it.
    pub fn dispatch(&self, frame: Frame) {
        let mut inner = self.lock();
        if inner.closed.is_some() {
            return;
        }
        let id = frame.stream_id.clone();
        let terminal = frame.is_terminal();

        match inner.slots.remove(&id) {
            Some(Slot::Live(tx)) => match tx.send(frame) {
                Ok(()) if !terminal => {
                    inner.slots.insert(id, Slot::Live(tx));
                }
                Ok(()) => {}
                Err(_) if !terminal => {
                    tracing::debug!(stream_id = %id, "Subscriber released, draining stream");
                    inner.slots.insert(id, Slot::Draining(None));
                }
                Err(_) => {}
            },
            Some(Slot::Draining(next)) => {
                if !terminal {
                    inner.slots.insert(id, Slot::Draining(next));
                } else if let Some(tx) = next {
                    inner.slots.insert(id, Slot::Live(tx));
                }
            }
            Some(Slot::Pending(pending)) => {
                inner.slots.insert(id, Slot::Pending(pending));
                self.buffer(&mut inner, frame);
            }
            None => self.buffer(&mut inner, frame),
        }
    }

    fn buffer(&self, inner: &mut Inner, frame: Frame) {
        let bytes = frame.approx_bytes();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let slot = inner
            .slots
            .entry(frame.stream_id.clone())
            .or_insert_with(|| {
                Slot::Pending(Pending {
                    frames: VecDeque::new(),
                    bytes: 0,
                    seq,
                })
            });
        if let Slot::Pending(pending) = slot {
            pending.frames.push_back(frame);
            pending.bytes = pending.bytes.saturating_add(bytes);
        }
        inner.buffered_bytes = inner.buffered_bytes.saturating_add(bytes);

        while inner.buffered_bytes > self.budget {
            let oldest = inner
                .slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Pending(p) => Some((p.seq, id.clone())),
                    _ => None,
                })
                .min();
            let Some((_, id)) = oldest else { break };
            if let Some(Slot::Pending(evicted)) = inner.slots.remove(&id) {
                inner.buffered_bytes = inner.buffered_bytes.saturating_sub(evicted.bytes);
                tracing::warn!(
                    stream_id = %id,
                    frames = evicted.frames.len(),
                    "Evicting unclaimed frames over buffer budget"
                );
            }
        }
    }

    /// Subscribe to one stream. Buffered frames are delivered first.
    ///
    /// A second subscription to the same stream replaces the first.
    ///
    /// # Errors
    /// Returns error if the store was closed.
    pub fn subscribe(&self, stream_id: &StreamId) -> Result<FrameSubscription, FrameStoreError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(FrameStoreError::Closed(reason.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();

        match inner.slots.remove(stream_id) {
            Some(Slot::Pending(mut pending)) => {
                let mut done = false;
                while let Some(frame) = pending.frames.pop_front() {
                    let bytes = frame.approx_bytes();
                    pending.bytes = pending.bytes.saturating_sub(bytes);
                    inner.buffered_bytes = inner.buffered_bytes.saturating_sub(bytes);
                    done = frame.is_terminal();
                    let _ = tx.send(frame);
                    if done {
                        break;
                    }
                }
                if !done {
                    inner.slots.insert(stream_id.clone(), Slot::Live(tx));
                } else if !pending.frames.is_empty() {
                    // Frames of a later read of the same stream.
                    inner.slots.insert(stream_id.clone(), Slot::Pending(pending));
                }
            }
            Some(Slot::Draining(_)) => {
                inner
                    .slots
                    .insert(stream_id.clone(), Slot::Draining(Some(tx)));
            }
            Some(Slot::Live(_)) => {
                tracing::debug!(stream_id = %stream_id, "Replacing existing subscription");
                inner.slots.insert(stream_id.clone(), Slot::Live(tx));
            }
            None => {
                inner.slots.insert(stream_id.clone(), Slot::Live(tx));
            }
        }

        Ok(FrameSubscription {
            stream_id: stream_id.clone(),
            rx,
        })
    }

    /// Close the store, releasing every subscriber.
    pub fn close(&self, reason: impl Into<String>) {
        let mut inner = self.lock();
        if inner.closed.is_none() {
            inner.closed = Some(reason.into());
        }
        inner.slots.clear();
        inner.buffered_bytes = 0;
    }

    /// Why the store was closed, if it was.
    #[must_use]
    pub fn closed_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }

    /// Bytes currently buffered for streams without a subscriber.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.lock().buffered_bytes
    }
}

/// Live view of one stream's frames.
///
/// Yields frames in arrival order up to and including the terminal frame.
/// Yields `None` once the stream ended or the store was closed.
#[derive(Debug)]
pub struct FrameSubscription {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl FrameSubscription {
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Receive the next frame.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Convert into a `Stream` of frames.
    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<Frame> {
        UnboundedReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Chunk;

    fn frame(id: &str, text: &str, continued: bool) -> Frame {
        Frame::new(StreamId::new(id), Some(Chunk::text(text)), continued)
    }

    fn text(frame: &Frame) -> String {
        String::from_utf8(frame.chunk.as_ref().unwrap().data.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_frames_before_subscribe_are_buffered() {
        let store = FrameStore::new();
        store.dispatch(frame("s1", "a", true));
        store.dispatch(frame("s1", "b", false));
        assert!(store.buffered_bytes() > 0);

        let mut sub = store.subscribe(&StreamId::new("s1")).unwrap();
        assert_eq!(text(&sub.next_frame().await.unwrap()), "a");
        assert_eq!(text(&sub.next_frame().await.unwrap()), "b");
        assert!(sub.next_frame().await.is_none());
        assert_eq!(store.buffered_bytes(), 0);
    }

    #[test]
    fn test_next_frame_pending_until_dispatch() {
        let store = FrameStore::new();
        let mut sub = store.subscribe(&StreamId::new("s1")).unwrap();
        let mut next = tokio_test::task::spawn(sub.next_frame());
        tokio_test::assert_pending!(next.poll());

        store.dispatch(frame("s1", "a", false));
        assert!(next.is_woken());
        let received = tokio_test::assert_ready!(next.poll());
        assert_eq!(text(&received.unwrap()), "a");
    }

    #[tokio::test]
    async fn test_other_streams_are_not_delivered() {
        let store = FrameStore::new();
        let mut sub = store.subscribe(&StreamId::new("wait")).unwrap();
        store.dispatch(frame("decoy", "x", false));
        store.dispatch(frame("wait", "y", true));
        store.dispatch(frame("wait", "z", false));

        let frames: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.stream_id.as_str() == "wait"));

        let mut decoy = store.subscribe(&StreamId::new("decoy")).unwrap();
        assert_eq!(text(&decoy.next_frame().await.unwrap()), "x");
        sub = store.subscribe(&StreamId::new("wait")).unwrap();
        drop(store);
        assert!(sub.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_close_releases_subscribers() {
        let store = FrameStore::new();
        let mut sub = store.subscribe(&StreamId::new("s1")).unwrap();
        store.close("connection lost");
        assert!(sub.next_frame().await.is_none());
        assert_eq!(store.closed_reason().as_deref(), Some("connection lost"));
        assert_eq!(
            store.subscribe(&StreamId::new("s2")).unwrap_err(),
            FrameStoreError::Closed("connection lost".to_string())
        );
    }

    #[tokio::test]
    async fn test_budget_evicts_oldest_unclaimed_stream() {
        let store = FrameStore::with_budget(200);
        store.dispatch(frame("old", &"x".repeat(120), true));
        store.dispatch(frame("new", &"y".repeat(60), true));
        store.dispatch(frame("new", &"y".repeat(60), true));
        assert!(store.buffered_bytes() <= 200);

        let mut new = store.subscribe(&StreamId::new("new")).unwrap();
        assert!(new.next_frame().await.is_some());
        assert!(new.next_frame().await.is_some());

        store.dispatch(frame("old", "tail", false));
        let mut old = store.subscribe(&StreamId::new("old")).unwrap();
        assert_eq!(text(&old.next_frame().await.unwrap()), "tail");
    }

    #[test]
    fn test_late_subscriber_after_eviction_waits_until_close() {
        let store = FrameStore::with_budget(100);
        store.dispatch(frame("s1", &"x".repeat(120), false));
        assert_eq!(store.buffered_bytes(), 0);

        let mut sub = store.subscribe(&StreamId::new("s1")).unwrap();
        let mut next = tokio_test::task::spawn(sub.next_frame());
        tokio_test::assert_pending!(next.poll());

        store.close("connection lost");
        assert!(next.is_woken());
        assert!(tokio_test::assert_ready!(next.poll()).is_none());
    }

    #[tokio::test]
    async fn test_released_subscription_drains_until_terminal() {
        let store = FrameStore::new();
        let sub = store.subscribe(&StreamId::new("s1")).unwrap();
        store.dispatch(frame("s1", "first-a", true));
        drop(sub);
        store.dispatch(frame("s1", "first-b", true));

        let mut again = store.subscribe(&StreamId::new("s1")).unwrap();
        store.dispatch(frame("s1", "first-c", false));
        store.dispatch(frame("s1", "second-a", false));
        assert_eq!(text(&again.next_frame().await.unwrap()), "second-a");
    }

    #[tokio::test]
    async fn test_second_read_stays_buffered_after_terminal() {
        let store = FrameStore::new();
        store.dispatch(frame("s1", "one", false));
        store.dispatch(frame("s1", "two", false));

        let mut first = store.subscribe(&StreamId::new("s1")).unwrap();
        assert_eq!(text(&first.next_frame().await.unwrap()), "one");
        assert!(first.next_frame().await.is_none());

        let mut second = store.subscribe(&StreamId::new("s1")).unwrap();
        assert_eq!(text(&second.next_frame().await.unwrap()), "two");
    }
}
