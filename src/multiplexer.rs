//! Operation Multiplexer
//!
//! Many operations share one socket. Each operation is a spawned task with:
//! - a route in the [`Router`], so the connection driver can hand it the
//!   `next`/`error`/`complete` messages carrying its id
//! - a [`Lease`] keeping the connection open while it runs
//! - an [`OperationControl`] through which it can be cancelled
//!
//! ```text
//!   subscribe() ──► acquire lease ──► connect() ──► register route
//!                                                      │
//!                           ┌──── send `subscribe` ◄───┘
//!                           ▼
//!        next ──► sink.next()           error/complete ──► one terminal
//!        link closed ──► retry decision ──► resubscribe (same id) | terminal
//!        cancel ──► send `complete` ──► sink.complete()
//! ```
//!
//! A sink receives any number of `next` calls followed by at most one of
//! `error` or `complete`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::connection::{Connection, Interrupted, Link};
use crate::error::ClientError;
use crate::lifecycle::Lease;
use crate::protocol::{Message, Payload, SubscribePayload};
use crate::retry::RetryDecision;

/// Receives the results of one operation.
pub trait OperationSink: Send + 'static {
    fn next(&mut self, value: Payload);
    fn error(&mut self, error: ClientError);
    fn complete(&mut self);
}

/// What a channel-backed sink receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Next(Payload),
    Error(ClientError),
    Complete,
}

impl OperationSink for mpsc::UnboundedSender<SinkEvent> {
    fn next(&mut self, value: Payload) {
        let _ = self.send(SinkEvent::Next(value));
    }

    fn error(&mut self, error: ClientError) {
        let _ = self.send(SinkEvent::Error(error));
    }

    fn complete(&mut self) {
        let _ = self.send(SinkEvent::Complete);
    }
}

/// Routes operation results to the operation that owns the id.
#[derive(Default)]
pub(crate) struct Router {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl Router {
    pub fn register(&self, id: &str) -> Result<mpsc::UnboundedReceiver<Message>, ClientError> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if routes.contains_key(id) {
            return Err(ClientError::Internal(format!("Operation id {} is already in use", id)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(id.to_string(), tx);
        Ok(rx)
    }

    pub fn unregister(&self, id: &str) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Deliver to the owner of the message id. Unknown ids are ignored.
    pub fn dispatch(&self, message: Message) -> bool {
        let Some(id) = message.id().map(str::to_owned) else {
            return false;
        };
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        match routes.get(&id) {
            Some(route) => route.send(message).is_ok(),
            None => {
                debug!(id = %id, kind = %message.message_type(), "Dropping message for unknown operation");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.routes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Unregisters a route when the operation leaves the link.
struct Route<'a> {
    router: &'a Router,
    id: &'a str,
}

impl Drop for Route<'_> {
    fn drop(&mut self) {
        self.router.unregister(self.id);
    }
}

/// Cancellation flag of one operation. The first trip wins.
pub(crate) struct OperationControl {
    tripped: watch::Sender<bool>,
}

impl OperationControl {
    fn new() -> Self {
        let (tripped, _) = watch::channel(false);
        Self { tripped }
    }

    /// Returns false if already cancelled or finished.
    fn trip(&self) -> bool {
        self.tripped.send_if_modified(|tripped| {
            if *tripped {
                false
            } else {
                *tripped = true;
                true
            }
        })
    }

    fn is_tripped(&self) -> bool {
        *self.tripped.borrow()
    }

    async fn tripped(&self) {
        let mut rx = self.tripped.subscribe();
        let _ = rx.wait_for(|tripped| *tripped).await;
    }
}

/// Handle to a running operation.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: String,
    control: Arc<OperationControl>,
    done: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop the operation. The sink gets `complete` unless a terminal was
    /// already delivered; repeated calls do nothing.
    pub fn cancel(&self) {
        if self.control.trip() {
            debug!(id = %self.id, "Operation cancelled");
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the sink got its terminal call.
    pub async fn finished(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}

/// Start an operation on `connection`.
pub(crate) fn start(
    connection: &Arc<Connection>,
    payload: SubscribePayload,
    mut sink: Box<dyn OperationSink>,
) -> SubscriptionHandle {
    let id = (connection.options.generate_id)();
    let control = Arc::new(OperationControl::new());
    let (done_tx, done_rx) = watch::channel(false);
    let lease = connection.acquire();

    let operation = Operation {
        id: id.clone(),
        payload,
        connection: Arc::clone(connection),
        control: Arc::clone(&control),
    };

    tokio::spawn(async move {
        let result = operation.run(&lease, sink.as_mut()).await;
        operation.control.trip();
        lease.release();
        match result {
            Ok(()) => sink.complete(),
            Err(error) => {
                debug!(id = %operation.id, error = %error, "Operation failed");
                sink.error(error);
            }
        }
        let _ = done_tx.send(true);
    });

    SubscriptionHandle {
        id,
        control,
        done: done_rx,
    }
}

/// How the operation left a link.
enum Outcome {
    Finished(Result<(), ClientError>),
    Interrupted(Interrupted),
}

struct Operation {
    id: String,
    payload: SubscribePayload,
    connection: Arc<Connection>,
    control: Arc<OperationControl>,
}

impl Operation {
    /// Runs until the operation is over; the result decides the terminal.
    async fn run(&self, lease: &Lease, sink: &mut dyn OperationSink) -> Result<(), ClientError> {
        let mut last_seen: Option<u64> = None;

        loop {
            if self.control.is_tripped() {
                return Ok(());
            }

            let connected = tokio::select! {
                biased;
                _ = self.control.tripped() => return Ok(()),
                connected = self.connection.connect(last_seen) => connected,
            };

            let interrupted = match connected {
                Ok(link) => {
                    match self.run_on(&link, lease, sink).await {
                        Outcome::Finished(result) => return result,
                        Outcome::Interrupted(interrupted) => interrupted,
                    }
                }
                Err(interrupted) => interrupted,
            };
            last_seen = Some(interrupted.generation);

            match self.connection.retry_decision(&interrupted) {
                RetryDecision::Retry => {
                    debug!(id = %self.id, generation = interrupted.generation, "Resubscribing after reconnect");
                }
                RetryDecision::Stop => return Ok(()),
                RetryDecision::Fail(error) => return Err(error),
            }
        }
    }

    async fn run_on(&self, link: &Link, lease: &Lease, sink: &mut dyn OperationSink) -> Outcome {
        let router = &self.connection.router;
        let mut inbox = match router.register(&self.id) {
            Ok(inbox) => inbox,
            Err(e) => return Outcome::Finished(Err(e)),
        };
        let _route = Route { router, id: &self.id };

        let subscribe = Message::Subscribe {
            id: self.id.clone(),
            payload: self.payload.clone(),
        };
        match link.send(&subscribe) {
            Ok(()) => {}
            Err(ClientError::Protocol(e)) => return Outcome::Finished(Err(ClientError::Protocol(e))),
            // The socket is going away; its closure arrives below
            Err(e) => warn!(id = %self.id, error = %e, "Subscribe not sent"),
        }

        loop {
            tokio::select! {
                biased;
                _ = self.control.tripped() => {
                    lease.release_with(|| {
                        if link.is_open() {
                            if let Err(e) = link.send(&Message::Complete { id: self.id.clone() }) {
                                debug!(id = %self.id, error = %e, "Complete not sent");
                            }
                        }
                    });
                    return Outcome::Finished(Ok(()));
                }
                message = inbox.recv() => match message {
                    Some(Message::Next { payload, .. }) => sink.next(payload),
                    Some(Message::Error { payload, .. }) => {
                        return Outcome::Finished(Err(ClientError::Operation(payload)));
                    }
                    Some(Message::Complete { .. }) => return Outcome::Finished(Ok(())),
                    Some(_) => {}
                    None => {
                        return Outcome::Finished(Err(ClientError::Internal("Operation route dropped".into())));
                    }
                },
                interrupted = link.closed() => return Outcome::Interrupted(interrupted),
            }
        }
    }
}

/// Stream of results for one operation.
///
/// Yields `Ok` for every `next`, then ends on `complete` or after one `Err`.
/// Dropping it cancels the operation.
pub struct Subscription {
    handle: SubscriptionHandle,
    items: mpsc::UnboundedReceiver<Result<Payload, ClientError>>,
}

impl Subscription {
    pub(crate) fn start(connection: &Arc<Connection>, payload: SubscribePayload) -> Self {
        let (tx, items) = mpsc::unbounded_channel();
        let handle = start(connection, payload, Box::new(StreamSink(tx)));
        Self { handle, items }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Stream for Subscription {
    type Item = Result<Payload, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Feeds a [`Subscription`]; dropping it ends the stream.
struct StreamSink(mpsc::UnboundedSender<Result<Payload, ClientError>>);

impl OperationSink for StreamSink {
    fn next(&mut self, value: Payload) {
        let _ = self.0.send(Ok(value));
    }

    fn error(&mut self, error: ClientError) {
        let _ = self.0.send(Err(error));
    }

    fn complete(&mut self) {}
}
