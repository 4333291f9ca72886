//! In-memory reference backend.
//!
//! Implements the `save_stream` and `restore_stream` actions over the same
//! wire protocol the runtime speaks. Storage outlives individual connections,
//! so a resumed client can read back what an earlier connection persisted.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use durable_agents_core::{Action, Chunk, Frame, RESTORE_STREAM, SAVE_STREAM, StreamId};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;

use crate::protocol::WireMessage;

#[derive(Debug, Clone, Default)]
struct StoredStream {
    chunks: Vec<Chunk>,
    complete: bool,
}

/// Shared backend storage.
#[derive(Clone, Default)]
pub struct BackendState {
    streams: Arc<RwLock<HashMap<(String, StreamId), StoredStream>>>,
    api_key: Option<Arc<str>>,
}

impl BackendState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require clients to present this key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(Arc::from(key.into()));
        self
    }

    /// Persisted chunks of one stream.
    pub async fn stored_chunks(&self, session_id: &str, stream_id: &StreamId) -> Option<Vec<Chunk>> {
        self.streams
            .read()
            .await
            .get(&(session_id.to_owned(), stream_id.clone()))
            .map(|s| s.chunks.clone())
    }

    /// Whether the terminal frame of a stream was persisted.
    pub async fn is_complete(&self, session_id: &str, stream_id: &StreamId) -> bool {
        self.streams
            .read()
            .await
            .get(&(session_id.to_owned(), stream_id.clone()))
            .is_some_and(|s| s.complete)
    }

    /// Overwrite a stream's persisted chunks.
    pub async fn insert_stream(&self, session_id: &str, stream_id: &StreamId, chunks: Vec<Chunk>) {
        self.streams.write().await.insert(
            (session_id.to_owned(), stream_id.clone()),
            StoredStream {
                chunks,
                complete: true,
            },
        );
    }
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    key: Option<String>,
}

/// Registered `save_stream` action awaiting frames on its source stream.
struct PendingSave {
    session_id: String,
    wait: StreamId,
}

/// Create the backend router serving `/ws`.
#[must_use]
pub fn router(state: BackendState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<BackendState>,
) -> Response {
    if let Some(expected) = &state.api_key {
        if query.key.as_deref() != Some(&**expected) {
            tracing::warn!("Rejecting connection with invalid key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BackendState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut saves: HashMap<StreamId, PendingSave> = HashMap::new();

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let msg: WireMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                continue;
            }
        };

        if let Some(graph) = msg.action_graph {
            let session_id = msg.session_id.unwrap_or_default();
            for action in &graph.actions {
                handle_action(&state, &mut saves, &session_id, action, &tx).await;
            }
        }

        for wire in msg.stream_frames {
            match Frame::try_from(wire) {
                Ok(frame) => handle_frame(&state, &mut saves, frame, &tx).await,
                Err(e) => tracing::warn!("Invalid frame: {e}"),
            }
        }
    }

    send_task.abort();
}

async fn handle_action(
    state: &BackendState,
    saves: &mut HashMap<StreamId, PendingSave>,
    session_id: &str,
    action: &Action,
    tx: &mpsc::UnboundedSender<WireMessage>,
) {
    match action.name.as_str() {
        SAVE_STREAM => {
            let (Some(source), Some(wait)) = (action.port("input"), action.port("output")) else {
                tracing::warn!("save_stream without input and output ports");
                return;
            };
            state
                .streams
                .write()
                .await
                .entry((session_id.to_owned(), source.stream_id.clone()))
                .or_default();
            saves.insert(
                source.stream_id.clone(),
                PendingSave {
                    session_id: session_id.to_owned(),
                    wait: wait.stream_id.clone(),
                },
            );
        }
        RESTORE_STREAM => {
            let Some(port) = action.port("output") else {
                tracing::warn!("restore_stream without output port");
                return;
            };
            let id = port.stream_id.clone();
            let chunks = state.stored_chunks(session_id, &id).await.unwrap_or_default();
            let frames: Vec<Frame> = if chunks.is_empty() {
                vec![Frame::end(id)]
            } else {
                let last = chunks.len() - 1;
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| Frame::new(id.clone(), Some(chunk), i < last))
                    .collect()
            };
            let _ = tx.send(WireMessage::frames(&frames));
        }
        other => tracing::warn!(action = other, "Unsupported action"),
    }
}

async fn handle_frame(
    state: &BackendState,
    saves: &mut HashMap<StreamId, PendingSave>,
    frame: Frame,
    tx: &mpsc::UnboundedSender<WireMessage>,
) {
    let Some(save) = saves.get(&frame.stream_id) else {
        tracing::debug!(stream_id = %frame.stream_id, "Frame for unsaved stream");
        return;
    };
    let key = (save.session_id.clone(), frame.stream_id.clone());
    {
        let mut streams = state.streams.write().await;
        let stored = streams.entry(key).or_default();
        if let Some(chunk) = frame.chunk {
            stored.chunks.push(chunk);
        }
        stored.complete = !frame.continued;
    }
    if !frame.continued {
        if let Some(save) = saves.remove(&frame.stream_id) {
            let _ = tx.send(WireMessage::frames([&Frame::end(save.wait)]));
        }
    }
}

/// Reference backend listening on a local port.
pub struct LocalBackend {
    addr: SocketAddr,
    state: BackendState,
    task: JoinHandle<()>,
}

impl LocalBackend {
    /// Serve `state` on an ephemeral localhost port.
    ///
    /// # Errors
    /// Returns error if the listener cannot bind.
    pub async fn spawn(state: BackendState) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = router(state.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Backend server error: {e}");
            }
        });
        tracing::info!("Reference backend listening on ws://{addr}/ws");
        Ok(Self { addr, state, task })
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    #[must_use]
    pub const fn state(&self) -> &BackendState {
        &self.state
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}
