//! GraphQL over WebSocket Client
//!
//! Single responsibility: the public face. Starts operations, exposes events
//! and status, and ends the connection when asked (or when dropped).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Client                           │
//! │  - subscribe() / iterate() start operations             │
//! │  - dispose() / terminate() end the connection           │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                     Multiplexer                         │
//! │  - one task per operation, routed by id                 │
//! │  - resubscribes with the same id after a reconnect      │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!               ┌────────────┼────────────┐
//!               ▼            ▼            ▼
//!          Connection    Lifecycle      Retry
//!               │
//!               ▼
//!           Transport
//! ```
//!
//! # Lazy vs. Eager
//!
//! A lazy client (the default) connects when the first operation starts and
//! closes the socket once the last one is done (after `keep_alive`).
//!
//! An eager client holds a lock of its own from [`Client::new`] on, so it
//! connects right away and keeps reconnecting until a failure is fatal.
//! Fatal failures go to `on_non_lazy_error`.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::ClientOptions;
use crate::connection::{Connection, ConnectionStatus};
use crate::events::ClientEvent;
use crate::multiplexer::{self, OperationSink, Subscription, SubscriptionHandle};
use crate::protocol::SubscribePayload;
use crate::retry::RetryDecision;

/// A graphql-transport-ws client.
///
/// All operations share one connection. Must be created and used inside a
/// tokio runtime.
pub struct Client {
    connection: Arc<Connection>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let lazy = options.lazy;
        debug!(options = ?options, "Creating client");
        let connection = Connection::new(options);

        if !lazy {
            keep_connected(&connection);
        }

        Self { connection }
    }

    /// Start an operation. Results go to `sink` until it gets `error` or
    /// `complete`.
    pub fn subscribe<S: OperationSink>(&self, payload: SubscribePayload, sink: S) -> SubscriptionHandle {
        multiplexer::start(&self.connection, payload, Box::new(sink))
    }

    /// Start an operation and consume its results as a stream.
    pub fn iterate(&self, payload: SubscribePayload) -> Subscription {
        Subscription::start(&self.connection, payload)
    }

    /// Lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.connection.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Close the connection with 1000 and stop reconnecting. Running
    /// operations complete.
    pub fn dispose(&self) {
        self.connection.dispose();
    }

    /// Drop the socket at once with 4499, without waiting for the peer.
    ///
    /// Operations complete unless a lock remains that reconnects later.
    pub fn terminate(&self) {
        self.connection.terminate();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Holds a lock for the lifetime of an eager client and keeps reconnecting.
fn keep_connected(connection: &Arc<Connection>) {
    let lease = connection.acquire();
    let connection = Arc::clone(connection);

    tokio::spawn(async move {
        let _lease = lease;
        let mut last_seen: Option<u64> = None;

        loop {
            let interrupted = match connection.connect(last_seen).await {
                Ok(link) => link.closed().await,
                Err(interrupted) => interrupted,
            };
            last_seen = Some(interrupted.generation);

            match connection.retry_decision(&interrupted) {
                RetryDecision::Retry => continue,
                RetryDecision::Stop => {
                    info!("Eager connection stopped");
                    return;
                }
                RetryDecision::Fail(e) => {
                    error!(error = %e, "Eager connection failed");
                    if let Some(hook) = &connection.options.on_non_lazy_error {
                        hook(e);
                    }
                    return;
                }
            }
        }
    });
}
