//! Scripted in-memory peer for client tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use elohim_graphql_ws::{
    ClientError, ClientOptions, CloseCode, CloseEvent, Connector, Message, Socket, SocketEvent, SocketSink,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the client put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    Close(u16, String),
}

/// Server side of one accepted socket.
pub struct PeerSocket {
    pub url: String,
    pub protocol: String,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl PeerSocket {
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        tokio::time::timeout(STEP_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    pub async fn recv_message(&mut self) -> Message {
        match self.recv().await {
            Some(ClientFrame::Text(text)) => serde_json::from_str(&text).expect("client sent invalid JSON"),
            other => panic!("expected a message, got {:?}", other),
        }
    }

    pub async fn expect_close(&mut self) -> (u16, String) {
        match self.recv().await {
            Some(ClientFrame::Close(code, reason)) => (code, reason),
            other => panic!("expected a close, got {:?}", other),
        }
    }

    /// Expect `connection_init` and acknowledge it.
    pub async fn accept_init(&mut self) {
        match self.recv_message().await {
            Message::ConnectionInit { .. } => {}
            other => panic!("expected connection_init, got {:?}", other),
        }
        self.send(serde_json::json!({ "type": "connection_ack" }));
    }

    /// Expect `subscribe`, returning the operation id.
    pub async fn expect_subscribe(&mut self) -> String {
        match self.recv_message().await {
            Message::Subscribe { id, .. } => id,
            other => panic!("expected subscribe, got {:?}", other),
        }
    }

    pub fn send(&self, message: Value) {
        let _ = self.events.send(SocketEvent::Text(message.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.events.send(SocketEvent::Text(text.to_string()));
    }

    pub fn send_binary(&self, data: &[u8]) {
        let _ = self.events.send(SocketEvent::Binary(data.to_vec()));
    }

    pub fn next(&self, id: &str, data: Value) {
        self.send(serde_json::json!({ "type": "next", "id": id, "payload": { "data": data } }));
    }

    pub fn complete(&self, id: &str) {
        self.send(serde_json::json!({ "type": "complete", "id": id }));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(SocketEvent::Closed(CloseEvent::new(code, reason)));
    }

    /// Whether the client has sent nothing more so far.
    pub fn is_quiet(&mut self) -> bool {
        self.frames.try_recv().is_err()
    }
}

/// Accepts the sockets a [`MockConnector`] opens.
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<PeerSocket>,
    attempts: Arc<AtomicUsize>,
    refusing: Arc<AtomicBool>,
}

impl MockServer {
    pub async fn accept(&mut self) -> PeerSocket {
        tokio::time::timeout(STEP_TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Fail every connection attempt with 1006 while set.
    pub fn refuse(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<PeerSocket>,
    attempts: Arc<AtomicUsize>,
    refusing: Arc<AtomicBool>,
}

pub fn mock() -> (MockConnector, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let refusing = Arc::new(AtomicBool::new(false));
    (
        MockConnector {
            accepted: tx,
            attempts: Arc::clone(&attempts),
            refusing: Arc::clone(&refusing),
        },
        MockServer {
            accepted: rx,
            attempts,
            refusing,
        },
    )
}

/// Options wired to `connector`, reconnecting without delay.
pub fn options(connector: MockConnector) -> ClientOptions {
    ClientOptions::new("ws://mock/graphql")
        .connector(connector)
        .retry_wait(|_| async {})
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str, protocol: &str) -> Result<Socket, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(ClientError::Closed(CloseEvent::with_code(
                CloseCode::AbnormalClosure,
                "Connection refused",
            )));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = PeerSocket {
            url: url.to_string(),
            protocol: protocol.to_string(),
            frames: frames_rx,
            events: events_tx,
        };
        self.accepted
            .send(peer)
            .map_err(|_| ClientError::Closed(CloseEvent::with_code(CloseCode::AbnormalClosure, "Server gone")))?;

        let events = futures_util::stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        Ok(Socket {
            sink: Box::new(MockSink(frames_tx)),
            events,
        })
    }
}

struct MockSink(mpsc::UnboundedSender<ClientFrame>);

fn peer_gone() -> ClientError {
    ClientError::Closed(CloseEvent::with_code(CloseCode::AbnormalClosure, "Peer gone"))
}

#[async_trait]
impl SocketSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.0.send(ClientFrame::Text(text)).map_err(|_| peer_gone())
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), ClientError> {
        self.0.send(ClientFrame::Close(code, reason)).map_err(|_| peer_gone())
    }
}

/// Collects events seen by a listener.
#[derive(Clone)]
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, item: T) {
        self.seen.lock().unwrap().push(item);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Next thing a channel sink received.
pub async fn recv_sink(rx: &mut mpsc::UnboundedReceiver<elohim_graphql_ws::SinkEvent>) -> Option<elohim_graphql_ws::SinkEvent> {
    tokio::time::timeout(STEP_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for the sink")
}

/// A `next` payload carrying `data`.
pub fn data(value: Value) -> elohim_graphql_ws::Payload {
    serde_json::json!({ "data": value })
        .as_object()
        .cloned()
        .expect("object literal")
}
