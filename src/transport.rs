//! WebSocket Transport Layer
//!
//! Single responsibility: open a socket, send/receive text frames, close.
//! No knowledge of the message protocol, handshakes, or reconnection.
//!
//! The connection state machine only talks to the [`Connector`] trait, so a
//! different socket implementation (or a scripted peer in tests) can be
//! plugged in through `ClientOptions::connector`. [`WsConnector`] is the
//! default binding over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{
    future,
    stream::{BoxStream, SplitSink},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode as WsCloseCode, CloseFrame, Message},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::ClientError;
use crate::protocol::{CloseCode, CloseEvent};

/// Something that happened on the receive side of a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A text frame
    Text(String),
    /// A binary frame, decoded like text
    Binary(Vec<u8>),
    /// The socket closed; no further events follow
    Closed(CloseEvent),
}

impl SocketEvent {
    /// Raw bytes of a data frame.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            SocketEvent::Text(text) => Some(text.as_bytes()),
            SocketEvent::Binary(data) => Some(data.as_slice()),
            SocketEvent::Closed(_) => None,
        }
    }
}

/// The send half of an open socket.
#[async_trait]
pub trait SocketSink: Send {
    /// Send a text frame.
    async fn send(&mut self, text: String) -> Result<(), ClientError>;

    /// Start the closing handshake.
    async fn close(&mut self, code: u16, reason: String) -> Result<(), ClientError>;
}

/// An open socket, split for concurrent send/receive.
pub struct Socket {
    pub sink: Box<dyn SocketSink>,
    pub events: BoxStream<'static, SocketEvent>,
}

/// Opens sockets.
///
/// Failures to reach the peer should be reported as
/// [`ClientError::Closed`] (typically 1006) so that they are retried like any
/// other abnormal closure; anything else is treated as a defect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str, protocol: &str) -> Result<Socket, ClientError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// `tokio-tungstenite` connector.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, protocol: &str) -> Result<Socket, ClientError> {
        let parsed =
            Url::parse(url).map_err(|e| ClientError::Config(format!("Invalid URL {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(format!(
                "Unsupported URL scheme '{}', expected ws or wss",
                parsed.scheme()
            )));
        }

        debug!(url = %url, protocol = %protocol, "Connecting to WebSocket");

        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Config(format!("Failed to build request: {}", e)))?;
        let header = HeaderValue::from_str(protocol)
            .map_err(|e| ClientError::Config(format!("Invalid sub-protocol: {}", e)))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", header);

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| {
                ClientError::Closed(CloseEvent::with_code(
                    CloseCode::AbnormalClosure,
                    format!("WebSocket connect failed: {}", e),
                ))
            })?;

        let (sink, stream) = ws.split();

        let events = stream
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(SocketEvent::Text(text)),
                    Ok(Message::Binary(data)) => Some(SocketEvent::Binary(data)),
                    Ok(Message::Close(frame)) => Some(SocketEvent::Closed(match frame {
                        Some(frame) => CloseEvent::new(u16::from(frame.code), frame.reason.into_owned()),
                        None => CloseEvent::with_code(CloseCode::NoStatusReceived, ""),
                    })),
                    // Ping/pong frames are answered by tungstenite
                    Ok(_) => None,
                    Err(e) => Some(SocketEvent::Closed(CloseEvent::with_code(
                        CloseCode::AbnormalClosure,
                        format!("WebSocket error: {}", e),
                    ))),
                })
            })
            .boxed();

        debug!(url = %url, "WebSocket connected");
        Ok(Socket {
            sink: Box::new(WsSink(sink)),
            events,
        })
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.0.send(Message::Text(text)).await.map_err(|e| {
            ClientError::Closed(CloseEvent::with_code(
                CloseCode::AbnormalClosure,
                format!("Failed to send: {}", e),
            ))
        })
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), ClientError> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.into(),
        };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| ClientError::Internal(format!("Failed to close: {}", e)))
    }
}
