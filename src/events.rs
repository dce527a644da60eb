//! Status Broadcaster - lifecycle events for observers
//!
//! Fans out connection lifecycle events to:
//! - listeners registered on `ClientOptions::on_event` (called inline, so
//!   they also see the events of an eager connection started by `Client::new`)
//! - `tokio::sync::broadcast` receivers handed out by `Client::events()`
//!
//! Emitting never blocks and never fails; a slow receiver lags instead.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ClientError;
use crate::protocol::{CloseEvent, Message, Payload};

/// Capacity of the broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Listener called for every event
pub type EventListener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Connection lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A new socket is being opened
    Connecting { is_retry: bool },
    /// The socket is open; `connection_init` goes out next
    Opened,
    /// The peer acknowledged the connection
    Connected {
        payload: Option<Payload>,
        was_retry: bool,
    },
    /// A ping was received from the peer, or sent by the client
    Ping {
        received: bool,
        payload: Option<Payload>,
    },
    /// A pong was received from the peer, or sent by the client
    Pong {
        received: bool,
        payload: Option<Payload>,
    },
    /// Every valid inbound message
    Message(Message),
    /// The socket closed
    Closed(CloseEvent),
    /// A failure that is not a socket closure
    Error(ClientError),
}

/// Lifecycle event broadcaster
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ClientEvent>,
    listeners: Arc<Vec<EventListener>>,
}

impl EventBroadcaster {
    pub fn new(listeners: Vec<EventListener>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            listeners: Arc::new(listeners),
        }
    }

    /// Emit an event
    pub fn emit(&self, event: ClientEvent) {
        for listener in self.listeners.iter() {
            listener(&event);
        }
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    // Convenience methods

    pub fn connecting(&self, is_retry: bool) {
        self.emit(ClientEvent::Connecting { is_retry });
    }

    pub fn opened(&self) {
        self.emit(ClientEvent::Opened);
    }

    pub fn connected(&self, payload: Option<Payload>, was_retry: bool) {
        self.emit(ClientEvent::Connected { payload, was_retry });
    }

    pub fn closed(&self, event: CloseEvent) {
        self.emit(ClientEvent::Closed(event));
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
