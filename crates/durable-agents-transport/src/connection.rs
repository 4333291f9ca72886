//! Single duplex websocket connection shared by every session.

use std::{fmt, sync::Arc};

use durable_agents_core::{Frame, FrameStore, FrameStoreError, FrameSubscription, StreamId};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, client::IntoClientRequest},
};
use uuid::Uuid;

use crate::{
    protocol::{ProtocolError, WireMessage},
    session::Session,
};

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BackendSink = SplitSink<BackendSocket, Message>;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Stream {0} ended without a matching frame")]
    StreamEnded(StreamId),
    #[error("Stream {0} already received its terminal frame")]
    StreamFinished(StreamId),
    #[error("Shadow tracks stream {expected}, not {actual}")]
    UnexpectedStream { expected: StreamId, actual: StreamId },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<FrameStoreError> for TransportError {
    fn from(err: FrameStoreError) -> Self {
        match err {
            FrameStoreError::Closed(reason) => Self::Closed(reason),
        }
    }
}

/// Opaque token passed to the backend at connect time.
#[derive(Clone, Default)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// No credential.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

struct Inner {
    endpoint: String,
    sink: Arc<Mutex<BackendSink>>,
    frames: Arc<FrameStore>,
    shutdown_tx: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.reader.abort();
    }
}

/// Connection to the execution backend.
///
/// Cheap to clone; every clone shares the socket, the receive loop and the
/// frame table. Any transport error invalidates the connection for all
/// sessions using it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial the backend.
    ///
    /// The credential is appended to the endpoint as the `key` query parameter.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid, the handshake fails or the
    /// backend rejects the credential.
    pub async fn connect(endpoint: &str, credential: &Credential) -> Result<Self, TransportError> {
        let url = build_connect_url(endpoint, credential)?;
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("Invalid endpoint {endpoint}: {e}")))?;
        let (socket, _) = connect_async(request).await.map_err(map_connect_error)?;
        tracing::info!(endpoint, "Connected to execution backend");
        Ok(Self::from_socket(endpoint, socket))
    }

    fn from_socket(endpoint: &str, socket: BackendSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = Arc::new(Mutex::new(sink));
        let frames = Arc::new(FrameStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&sink),
            Arc::clone(&frames),
            shutdown_rx,
        ));

        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.to_owned(),
                sink,
                frames,
                shutdown_tx,
                reader,
            }),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Whether the receive loop has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.frames.closed_reason().is_some()
    }

    /// Open a session with a known id. No network round trip.
    #[must_use]
    pub fn open_session(&self, session_id: impl Into<String>) -> Session {
        Session::new(session_id.into(), self.clone())
    }

    /// Open a session with a fresh id.
    #[must_use]
    pub fn new_session(&self) -> Session {
        self.open_session(Uuid::new_v4().to_string())
    }

    /// Send one message. Returns once it was handed to the socket.
    ///
    /// # Errors
    /// Returns error if the connection is closed or the write fails. A failed
    /// write closes the connection.
    pub async fn send(&self, msg: &WireMessage) -> Result<(), TransportError> {
        if let Some(reason) = self.inner.frames.closed_reason() {
            return Err(TransportError::Closed(reason));
        }
        let json = serde_json::to_string(msg).map_err(ProtocolError::from)?;
        tracing::debug!(
            session_id = msg.session_id.as_deref().unwrap_or_default(),
            frames = msg.stream_frames.len(),
            bytes = json.len(),
            "Sending message"
        );

        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            tracing::error!("WebSocket send failed: {e}");
            self.inner.frames.close(format!("send failed: {e}"));
            let _ = self.inner.shutdown_tx.send(true);
            return Err(TransportError::Send(e.to_string()));
        }
        Ok(())
    }

    /// Subscribe to one inbound stream. Frames that already arrived come first.
    ///
    /// # Errors
    /// Returns error if the connection is closed.
    pub fn subscribe(&self, stream_id: &StreamId) -> Result<FrameSubscription, TransportError> {
        Ok(self.inner.frames.subscribe(stream_id)?)
    }

    /// Wait for the first frame on `stream_id` matching `predicate`.
    ///
    /// # Errors
    /// Returns error if the connection closes or the stream ends first.
    pub async fn receive_until<P>(&self, stream_id: &StreamId, predicate: P) -> Result<Frame, TransportError>
    where
        P: FnMut(&Frame) -> bool,
    {
        let mut subscription = self.subscribe(stream_id)?;
        self.next_matching(&mut subscription, predicate).await
    }

    pub(crate) async fn next_matching<P>(
        &self,
        subscription: &mut FrameSubscription,
        mut predicate: P,
    ) -> Result<Frame, TransportError>
    where
        P: FnMut(&Frame) -> bool,
    {
        while let Some(frame) = subscription.next_frame().await {
            if predicate(&frame) {
                return Ok(frame);
            }
        }
        Err(self.ended_error(subscription.stream_id()))
    }

    /// Error for a subscription that yielded nothing more.
    pub(crate) fn ended_error(&self, stream_id: &StreamId) -> TransportError {
        self.inner.frames.closed_reason().map_or_else(
            || TransportError::StreamEnded(stream_id.clone()),
            TransportError::Closed,
        )
    }

    /// Close the connection for every session.
    pub async fn close(&self) {
        {
            let mut sink = self.inner.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.frames.close("closed by client");
    }
}

async fn read_loop(
    mut stream: SplitStream<BackendSocket>,
    sink: Arc<Mutex<BackendSink>>,
    frames: Arc<FrameStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break "closed by client".to_string(),
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = dispatch(&frames, &text) {
                        tracing::error!("Dropping connection on protocol error: {e}");
                        break format!("protocol error: {e}");
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let result = std::str::from_utf8(&data)
                        .map_err(|e| e.to_string())
                        .and_then(|text| dispatch(&frames, text).map_err(|e| e.to_string()));
                    if let Err(e) = result {
                        tracing::error!("Dropping connection on protocol error: {e}");
                        break format!("protocol error: {e}");
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.lock().await.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break "closed by backend".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WebSocket receive failed: {e}");
                    break format!("receive failed: {e}");
                }
            }
        }
    };
    tracing::debug!(%reason, "Receive loop stopped");
    frames.close(reason);
}

fn dispatch(frames: &FrameStore, text: &str) -> Result<(), ProtocolError> {
    for frame in WireMessage::decode_inbound(text)? {
        tracing::trace!(stream_id = %frame.stream_id, continued = frame.continued, "Frame received");
        frames.dispatch(frame);
    }
    Ok(())
}

fn build_connect_url(endpoint: &str, credential: &Credential) -> Result<String, TransportError> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(TransportError::Connect("Endpoint cannot be empty".into()));
    }
    if credential.is_empty() {
        return Ok(trimmed.to_owned());
    }
    let separator = if trimmed.contains('?') { "&" } else { "?" };
    Ok(format!("{trimmed}{separator}key={}", credential.0))
}

fn map_connect_error(error: WsError) -> TransportError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if matches!(status, 401 | 403) {
                TransportError::Authentication(format!("Backend rejected credential with status {status}"))
            } else {
                TransportError::Connect(format!("Handshake failed with status {status}"))
            }
        }
        WsError::Url(e) => TransportError::Connect(format!("Invalid endpoint: {e}")),
        other => TransportError::Connect(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::{
        accept_async, accept_hdr_async,
        tungstenite::{
            handshake::server::{ErrorResponse, Request, Response},
            http::StatusCode,
        },
    };

    use super::*;

    #[test]
    fn test_connect_url_appends_key() {
        let url = build_connect_url("wss://host/ws", &Credential::new("k1")).unwrap();
        assert_eq!(url, "wss://host/ws?key=k1");
        let url = build_connect_url("wss://host/ws?x=1", &Credential::new("k1")).unwrap();
        assert_eq!(url, "wss://host/ws?x=1&key=k1");
        let url = build_connect_url("wss://host/ws", &Credential::none()).unwrap();
        assert_eq!(url, "wss://host/ws");
        assert!(build_connect_url("  ", &Credential::none()).is_err());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        assert_eq!(format!("{:?}", Credential::new("secret")), "Credential(***)");
    }

    #[tokio::test]
    async fn test_rejected_credential_maps_to_authentication() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accept_hdr_async(stream, |_req: &Request, _resp: Response| {
                let mut rejection = ErrorResponse::new(None);
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            })
            .await;
        });

        let err = Connection::connect(&format!("ws://{addr}"), &Credential::new("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Authentication(_)), "{err:?}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_close_releases_waiters_and_fails_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let connection = Connection::connect(&format!("ws://{addr}"), &Credential::none())
            .await
            .unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            connection.receive_until(&StreamId::new("s1"), Frame::is_terminal),
        )
        .await
        .expect("waiter should be released");
        assert!(
            matches!(err, Err(TransportError::Closed(_))),
            "unexpected result: {err:?}"
        );
        assert!(connection.is_closed());

        let send = connection.send(&WireMessage::default()).await;
        assert!(matches!(send, Err(TransportError::Closed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_until_skips_non_matching_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let frames = [
                Frame::new(StreamId::new("s1"), None, true),
                Frame::end(StreamId::new("other")),
                Frame::end(StreamId::new("s1")),
            ];
            let json = serde_json::to_string(&WireMessage::frames(&frames)).unwrap();
            ws.send(Message::Text(json.into())).await.unwrap();
            let _ = ws.next().await;
        });

        let connection = Connection::connect(&format!("ws://{addr}"), &Credential::none())
            .await
            .unwrap();
        let frame = connection
            .receive_until(&StreamId::new("s1"), Frame::is_terminal)
            .await
            .unwrap();
        assert_eq!(frame.stream_id.as_str(), "s1");
        assert!(frame.is_terminal());

        connection.close().await;
        server.await.unwrap();
    }

    async fn serve_once(payload: &'static str) -> (Connection, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(payload.into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        let connection = Connection::connect(&format!("ws://{addr}"), &Credential::none())
            .await
            .unwrap();
        (connection, server)
    }

    #[tokio::test]
    async fn test_bad_inbound_message_stops_receive_loop() {
        let payloads = [
            r#"{"actionGraph":{"actions":[{"name":"save_stream","inputs":[],"outputs":[]}],"outputs":[]}}"#,
            r#"{"streamFrames":[{"streamId":"s1""#,
        ];
        for payload in payloads {
            let (connection, server) = serve_once(payload).await;
            let result = tokio::time::timeout(
                Duration::from_secs(5),
                connection.receive_until(&StreamId::new("s1"), Frame::is_terminal),
            )
            .await
            .expect("waiter should be released");
            match result {
                Err(TransportError::Closed(reason)) => {
                    assert!(reason.contains("protocol error"), "{payload}: {reason}");
                }
                other => panic!("{payload}: unexpected result {other:?}"),
            }
            assert!(connection.is_closed());

            let send = connection.send(&WireMessage::default()).await;
            assert!(matches!(send, Err(TransportError::Closed(_))), "{payload}");

            drop(connection);
            server.await.unwrap();
        }
    }
}
