//! Byte transports under a sync session.
//!
//! A [`Transport`] moves opaque chunks; frame boundaries are recovered by
//! the session's decoder, so chunks may split or join frames freely.
//! A [`Connector`] produces a fresh transport for every (re)connect.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Read buffer size for stream transports.
const READ_CHUNK: usize = 16 * 1024;

/// Transport failures. All of them lead to a reconnect, never to a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish the connection
    Connect(String),
    /// The connection is already closed
    Closed,
    /// I/O error on the underlying stream
    Io(String),
    /// WebSocket protocol violation
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Connect failed: {e}"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(e) => write!(f, "WebSocket error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
            Error::Io(io) => TransportError::Io(io.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// A connected, bidirectional byte channel.
pub trait Transport: Send {
    /// Write one chunk.
    fn send(&mut self, data: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next chunk, `Ok(None)` once the peer closed the connection.
    /// Must be cancel-safe.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Best-effort orderly shutdown.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports to one endpoint.
pub trait Connector: Send + 'static {
    type Transport: Transport + 'static;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Binary WebSocket messages as chunks.
pub struct WsTransport<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        self.ws.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("WebSocket close: {e}");
        }
    }
}

/// Connects to a relay over WebSocket. The room is the URL path, e.g.
/// `ws://127.0.0.1:9090/notes`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// `base` like `ws://host:port`, joined with the room name.
    pub fn for_room(base: &str, room: &str) -> Self {
        Self::new(format!("{}/{}", base.trim_end_matches('/'), room))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport<MaybeTlsStream<TcpStream>>;

    async fn connect(&mut self) -> Result<Self::Transport, TransportError> {
        match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws, _)) => {
                log::debug!("Connected to {}", self.url);
                Ok(WsTransport::new(ws))
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Raw frames over any byte stream (TCP, pipes, in-memory duplex).
pub struct StreamTransport<S> {
    stream: S,
    buf: Box<[u8]>,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, buf: vec![0; READ_CHUNK].into_boxed_slice() }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let n = self.stream.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            log::debug!("Stream shutdown: {e}");
        }
    }
}

/// Plain TCP connector for [`StreamTransport`].
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Transport = StreamTransport<TcpStream>;

    async fn connect(&mut self) -> Result<Self::Transport, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        stream.set_nodelay(true)?;
        Ok(StreamTransport::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_transport_roundtrip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamTransport::new(a);
        let mut right = StreamTransport::new(b);

        left.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Some(vec![1, 2, 3]));

        left.close().await;
        drop(left);
        assert_eq!(right.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connector = TcpConnector::new(addr.to_string());
        assert!(matches!(connector.connect().await, Err(TransportError::Connect(_))));

        let mut ws = WsConnector::for_room(&format!("ws://{addr}/"), "notes");
        assert_eq!(ws.url(), format!("ws://{addr}/notes"));
        assert!(matches!(ws.connect().await, Err(TransportError::Connect(_))));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "Connection closed");
        let io: TransportError = std::io::Error::other("boom").into();
        assert_eq!(io, TransportError::Io("boom".into()));
    }
}
