//! WebSocket client abstraction
//!
//! The consumer talks to the network through [`WebSocketClient`], so tests can
//! replay scripted connections and callers can swap transports.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Sink;
use n0_future::Stream;
use n0_future::stream::Boxed;
use smol_str::SmolStr;
use url::Url;

use crate::error::StreamError;

/// WebSocket close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code
    pub code: u16,
    /// Close reason text
    pub reason: SmolStr,
}

impl CloseFrame {
    /// Normal closure
    pub const NORMAL: u16 = 1000;

    /// Create a new close frame
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// Text message (UTF-8)
    Text(String),
    /// Binary message
    Binary(Bytes),
    /// Close frame
    Close(Option<CloseFrame>),
}

impl WsMessage {
    /// Check if this is a close message
    pub fn is_close(&self) -> bool {
        matches!(self, WsMessage::Close(_))
    }

    /// Get as text, if this is a text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WsMessage::Text(t) => Some(t.as_bytes()),
            WsMessage::Binary(b) => Some(b),
            WsMessage::Close(_) => None,
        }
    }
}

impl From<String> for WsMessage {
    fn from(s: String) -> Self {
        WsMessage::Text(s)
    }
}

impl From<&str> for WsMessage {
    fn from(s: &str) -> Self {
        WsMessage::Text(s.to_string())
    }
}

impl From<Bytes> for WsMessage {
    fn from(bytes: Bytes) -> Self {
        WsMessage::Binary(bytes)
    }
}

impl From<Vec<u8>> for WsMessage {
    fn from(vec: Vec<u8>) -> Self {
        WsMessage::Binary(Bytes::from(vec))
    }
}

/// WebSocket message stream
pub struct WsStream(Boxed<Result<WsMessage, StreamError>>);

impl WsStream {
    /// Create a new message stream
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<WsMessage, StreamError>> + Send + 'static,
    {
        Self(Box::pin(stream))
    }

    /// Convert into the inner pinned boxed stream
    pub fn into_inner(self) -> Boxed<Result<WsMessage, StreamError>> {
        self.0
    }
}

impl fmt::Debug for WsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsStream").finish_non_exhaustive()
    }
}

/// WebSocket message sink
pub struct WsSink(Pin<Box<dyn Sink<WsMessage, Error = StreamError> + Send>>);

impl WsSink {
    /// Create a new message sink
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<WsMessage, Error = StreamError> + Send + 'static,
    {
        Self(Box::pin(sink))
    }

    /// Convert into the inner pinned boxed sink
    pub fn into_inner(self) -> Pin<Box<dyn Sink<WsMessage, Error = StreamError> + Send>> {
        self.0
    }
}

impl fmt::Debug for WsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsSink").finish_non_exhaustive()
    }
}

/// WebSocket client trait
#[trait_variant::make(Send)]
pub trait WebSocketClient {
    /// Error type for WebSocket operations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to a WebSocket endpoint
    fn connect(&self, url: Url) -> impl Future<Output = Result<WebSocketConnection, Self::Error>>;
}

/// WebSocket connection with bidirectional streams
pub struct WebSocketConnection {
    tx: WsSink,
    rx: WsStream,
}

impl WebSocketConnection {
    /// Create a new WebSocket connection
    pub fn new(tx: WsSink, rx: WsStream) -> Self {
        Self { tx, rx }
    }

    /// Split into sender and receiver
    pub fn split(self) -> (WsSink, WsStream) {
        (self.tx, self.rx)
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection").finish_non_exhaustive()
    }
}

/// Concrete WebSocket client implementation using tokio-tungstenite-wasm
pub mod tungstenite_client {
    use super::*;
    use futures::{SinkExt, StreamExt};

    /// WebSocket client backed by tokio-tungstenite-wasm
    #[derive(Debug, Clone, Default)]
    pub struct TungsteniteClient;

    impl TungsteniteClient {
        /// Create a new tungstenite WebSocket client
        pub fn new() -> Self {
            Self
        }
    }

    impl WebSocketClient for TungsteniteClient {
        type Error = tokio_tungstenite_wasm::Error;

        async fn connect(&self, url: Url) -> Result<WebSocketConnection, Self::Error> {
            let ws_stream = tokio_tungstenite_wasm::connect(url.as_str()).await?;

            let (sink, stream) = ws_stream.split();

            let rx_stream = stream.map(|result| match result {
                Ok(msg) => Ok(convert_message(msg)),
                Err(e) => Err(StreamError::transport(e)),
            });
            let rx = WsStream::new(rx_stream);

            let tx_sink = sink
                .with(|msg: WsMessage| async move {
                    Ok::<_, tokio_tungstenite_wasm::Error>(msg.into())
                })
                .sink_map_err(|e| StreamError::transport(e));
            let tx = WsSink::new(tx_sink);

            Ok(WebSocketConnection::new(tx, rx))
        }
    }

    fn convert_message(msg: tokio_tungstenite_wasm::Message) -> WsMessage {
        use tokio_tungstenite_wasm::Message;

        match msg {
            Message::Text(text) => WsMessage::Text(text.to_string()),
            Message::Binary(vec) => WsMessage::Binary(Bytes::from(vec)),
            Message::Close(frame) => WsMessage::Close(frame.map(|f| {
                let code: u16 = f.code.into();
                CloseFrame::new(code, f.reason.as_ref())
            })),
        }
    }

    impl From<WsMessage> for tokio_tungstenite_wasm::Message {
        fn from(msg: WsMessage) -> Self {
            use tokio_tungstenite_wasm::Message;

            match msg {
                WsMessage::Text(text) => Message::Text(text),
                WsMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
                WsMessage::Close(frame) => {
                    Message::Close(frame.map(|f| tokio_tungstenite_wasm::CloseFrame {
                        code: f.code.into(),
                        reason: f.reason.to_string().into(),
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn message_accessors() {
        let msg = WsMessage::from("hello");
        assert_eq!(msg.as_text(), Some("hello"));
        assert_eq!(msg.as_bytes(), Some(&b"hello"[..]));

        let msg = WsMessage::from(vec![1, 2, 3]);
        assert_eq!(msg.as_text(), None);
        assert_eq!(msg.as_bytes(), Some(&[1u8, 2, 3][..]));

        let msg = WsMessage::Close(Some(CloseFrame::new(CloseFrame::NORMAL, "bye")));
        assert!(msg.is_close());
        assert_eq!(msg.as_bytes(), None);
    }

    #[tokio::test]
    async fn connection_splits_into_halves() {
        use futures::sink::SinkExt;

        let rx = WsStream::new(futures::stream::iter(vec![Ok(WsMessage::from("test"))]));
        let drain = futures::sink::drain()
            .sink_map_err(|_: std::convert::Infallible| StreamError::closed());
        let conn = WebSocketConnection::new(WsSink::new(drain), rx);

        let (tx, rx) = conn.split();
        let mut rx = rx.into_inner();
        assert_eq!(rx.next().await.unwrap().unwrap(), WsMessage::from("test"));
        assert!(rx.next().await.is_none());

        let mut sink = tx.into_inner();
        sink.send(WsMessage::Close(None)).await.unwrap();
    }
}
