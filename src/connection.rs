//! Connection State Machine
//!
//! Single responsibility: own the one socket a client may have, drive its
//! handshake, and hand out ready links.
//!
//! # Phases
//!
//! ```text
//!   Idle ──► Connecting ──► AwaitingAck ──► Ready
//!              │                 │            │
//!              └─────────────────┴────────────┴──► Closed ──► Connecting ...
//! ```
//!
//! - `Connecting`: URL resolved, socket opening, `connection_init` payload
//!   evaluated and sent
//! - `AwaitingAck`: the first message must be `connection_ack`, optionally
//!   within `connection_ack_wait_timeout`
//! - `Ready`: operations may use the [`Link`]
//! - `Closed`: the socket is gone; the next `connect()` starts over
//!
//! # Ownership
//!
//! Each attempt is one spawned driver task that exclusively owns the socket.
//! Everyone else talks to it through a command channel (the transport handle
//! kept in [`ConnectionState`]). All state lives behind one mutex, and every
//! transition bumps a `watch` epoch so waiters sleep until the state
//! actually changes. There is never more than one socket per client.

use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ClientOptions;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventBroadcaster};
use crate::multiplexer::Router;
use crate::protocol::{
    decode, encode, limit_close_reason, CloseCode, CloseEvent, Message, ValueTransform,
    GRAPHQL_TRANSPORT_WS_PROTOCOL,
};
use crate::retry::{classify, BackoffGate, RetryContext, RetryDecision};
use crate::transport::{Socket, SocketEvent, SocketSink};

/// Instructions for the driver task that owns the socket.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    Send(String),
    Close { code: u16, reason: String },
}

/// Public view of the connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    AwaitingAck,
    Ready,
    Closed,
}

/// Snapshot of the connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    /// Active locks (operations, plus one for a non-lazy client)
    pub locks: usize,
    /// Reconnect attempts since the last acknowledged connection
    pub retries: u32,
    pub retrying: bool,
}

#[derive(Clone)]
enum Phase {
    Idle,
    Connecting { generation: u64 },
    AwaitingAck { generation: u64 },
    Ready(Link),
    Closed { generation: u64, error: ClientError },
}

impl Phase {
    fn kind(&self) -> ConnectionPhase {
        match self {
            Phase::Idle => ConnectionPhase::Idle,
            Phase::Connecting { .. } => ConnectionPhase::Connecting,
            Phase::AwaitingAck { .. } => ConnectionPhase::AwaitingAck,
            Phase::Ready(_) => ConnectionPhase::Ready,
            Phase::Closed { .. } => ConnectionPhase::Closed,
        }
    }
}

/// The single per-client connection state.
pub(crate) struct ConnectionState {
    phase: Phase,
    /// Command sender of the live socket, `None` when there is none
    socket: Option<mpsc::UnboundedSender<SocketCommand>>,
    pub(crate) locks: usize,
    retrying: bool,
    retries: u32,
    /// Generation of the most recent attempt (0 = none yet)
    pub(crate) generation: u64,
    /// Generation the lifecycle manager closed for being idle
    pub(crate) idle_closed: Option<u64>,
    disposed: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            socket: None,
            locks: 0,
            retrying: false,
            retries: 0,
            generation: 0,
            idle_closed: None,
            disposed: false,
        }
    }
}

impl ConnectionState {
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready(_))
    }

    /// Ask the driver to close the live socket, if any.
    pub(crate) fn close_socket(&self, code: u16, reason: &str) -> bool {
        match &self.socket {
            Some(socket) => socket
                .send(SocketCommand::Close {
                    code,
                    reason: reason.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }
}

/// Why an attempt or a link ended.
#[derive(Debug, Clone)]
pub(crate) struct Interrupted {
    pub generation: u64,
    pub error: ClientError,
}

/// An acknowledged connection, as seen by operations.
#[derive(Clone)]
pub(crate) struct Link {
    generation: u64,
    commands: mpsc::UnboundedSender<SocketCommand>,
    closed: watch::Receiver<Option<ClientError>>,
    replacer: Option<ValueTransform>,
}

impl Link {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Encode and queue a message on this socket.
    pub fn send(&self, message: &Message) -> Result<(), ClientError> {
        let text = encode(message, self.replacer.as_ref())?;
        self.commands
            .send(SocketCommand::Send(text))
            .map_err(|_| ClientError::Internal("Socket is gone".into()))
    }

    pub fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }

    /// Resolves once the socket behind this link has closed.
    pub async fn closed(&self) -> Interrupted {
        let mut closed = self.closed.clone();
        let error = match closed.wait_for(Option::is_some).await {
            Ok(error) => error.as_ref().cloned(),
            Err(_) => None,
        };
        Interrupted {
            generation: self.generation,
            error: error.unwrap_or_else(|| ClientError::Internal("Connection driver stopped".into())),
        }
    }
}

/// What a caller of [`Connection::connect`] does next.
enum Step {
    Return(Result<Link, Interrupted>),
    Wait(u64),
    Backoff(u32),
}

/// The connection shared by every operation of one client.
pub(crate) struct Connection {
    pub(crate) options: ClientOptions,
    state: Mutex<ConnectionState>,
    /// Bumped on every phase transition
    changed: watch::Sender<u64>,
    pub(crate) router: Router,
    pub(crate) events: EventBroadcaster,
    backoff: BackoffGate,
}

impl Connection {
    pub fn new(options: ClientOptions) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            events: EventBroadcaster::new(options.listeners.clone()),
            options,
            state: Mutex::new(ConnectionState::default()),
            changed,
            router: Router::default(),
            backoff: BackoffGate::new(),
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.lock_state();
        ConnectionStatus {
            phase: state.phase.kind(),
            locks: state.locks,
            retries: state.retries,
            retrying: state.retrying,
        }
    }

    /// Wait for a ready, acknowledged link.
    ///
    /// Starts an attempt if there is no socket, joins the one in flight
    /// otherwise. While reconnecting, the caller first waits out the shared
    /// backoff. `last_seen` is the newest generation the caller already knows
    /// about; a newer failure it has not seen yet is reported to it.
    pub async fn connect(self: &Arc<Self>, last_seen: Option<u64>) -> Result<Link, Interrupted> {
        let mut awaiting: Option<u64> = None;
        let mut waited = false;

        loop {
            let mut changed = self.changed.subscribe();

            let step = {
                let mut state = self.lock_state();
                let step = match &state.phase {
                    Phase::Ready(link) => Some(Step::Return(Ok(link.clone()))),
                    Phase::Connecting { generation } | Phase::AwaitingAck { generation } => {
                        Some(Step::Wait(*generation))
                    }
                    Phase::Closed { generation, error }
                        if awaiting == Some(*generation)
                            || last_seen.is_some_and(|seen| *generation > seen) =>
                    {
                        Some(Step::Return(Err(Interrupted {
                            generation: *generation,
                            error: error.clone(),
                        })))
                    }
                    Phase::Idle | Phase::Closed { .. } if state.disposed => {
                        Some(Step::Return(Err(Interrupted {
                            generation: state.generation,
                            error: ClientError::Closed(CloseEvent::with_code(
                                CloseCode::NormalClosure,
                                "Client disposed",
                            )),
                        })))
                    }
                    Phase::Idle | Phase::Closed { .. } if state.retrying && !waited => {
                        Some(Step::Backoff(state.retries))
                    }
                    // No socket: open one
                    Phase::Idle | Phase::Closed { .. } => None,
                };
                match step {
                    Some(step) => step,
                    None => Step::Wait(self.start_attempt(&mut state)),
                }
            };

            match step {
                Step::Return(result) => return result,
                Step::Backoff(retries) => {
                    self.backoff.wait(retries, &self.options.retry_wait).await;
                    waited = true;
                    continue;
                }
                Step::Wait(generation) => awaiting = Some(generation),
            }

            if changed.changed().await.is_err() {
                return Err(Interrupted {
                    generation: awaiting.unwrap_or_default(),
                    error: ClientError::Internal("Connection state dropped".into()),
                });
            }
        }
    }

    /// Classify a failure and record that a reconnect is under way.
    pub fn retry_decision(&self, interrupted: &Interrupted) -> RetryDecision {
        let mut state = self.lock_state();

        // Closed for idleness while a new operation was already arriving:
        // reconnect straight away, this was not a failure.
        if state.idle_closed == Some(interrupted.generation)
            && interrupted.error.close_code().map(CloseCode::from) == Some(CloseCode::NormalClosure)
            && state.locks > 0
            && !state.disposed
        {
            debug!(generation = interrupted.generation, "Reopening idle-closed connection");
            return RetryDecision::Retry;
        }

        let decision = classify(
            &interrupted.error,
            &RetryContext {
                retries: state.retries,
                retry_attempts: self.options.retry_attempts,
                disposed: state.disposed,
                is_fatal_connection_problem: self.options.is_fatal_connection_problem.as_ref(),
            },
        );

        match &decision {
            RetryDecision::Retry if interrupted.generation == state.generation => {
                if !state.retrying {
                    warn!(
                        generation = interrupted.generation,
                        retries = state.retries,
                        error = %interrupted.error,
                        "Connection lost, reconnecting"
                    );
                }
                state.retrying = true;
            }
            RetryDecision::Fail(error) => {
                debug!(generation = interrupted.generation, error = %error, "Connection failure is fatal");
            }
            _ => {}
        }

        decision
    }

    /// Mark the client disposed and close the socket.
    pub fn dispose(&self) {
        let mut state = self.lock_state();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.close_socket(CloseCode::NormalClosure.into(), "Normal Closure");
        self.notify();
        info!("Client disposed");
    }

    /// Close the socket at once with 4499.
    pub fn terminate(&self) {
        let state = self.lock_state();
        if state.close_socket(CloseCode::Terminated.into(), "Terminated") {
            info!(generation = state.generation, "Connection terminated");
        }
    }

    fn start_attempt(self: &Arc<Self>, state: &mut ConnectionState) -> u64 {
        let is_retry = state.retrying;
        if is_retry {
            state.retries = state.retries.saturating_add(1);
        }
        state.generation += 1;
        let generation = state.generation;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        state.socket = Some(commands_tx.clone());
        state.phase = Phase::Connecting { generation };
        self.notify();

        debug!(generation = generation, retries = state.retries, is_retry = is_retry, "Starting connection attempt");

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            connection.drive(generation, is_retry, commands_tx, commands_rx).await;
        });

        generation
    }

    fn transition(&self, generation: u64, phase: Phase) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.phase = phase;
            self.notify();
        }
    }

    fn acknowledge(self: &Arc<Self>, link: Link) {
        let idle = {
            let mut state = self.lock_state();
            if state.generation != link.generation {
                return;
            }
            state.phase = Phase::Ready(link);
            state.retries = 0;
            state.retrying = false;
            self.notify();
            state.locks == 0
        };
        // Everyone left during the handshake
        if idle {
            debug!("Acknowledged with no locks held");
            self.schedule_idle_close();
        }
    }

    /// Driver task: one socket, from open to close.
    async fn drive(
        self: Arc<Self>,
        generation: u64,
        is_retry: bool,
        commands_tx: mpsc::UnboundedSender<SocketCommand>,
        mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    ) {
        self.events.connecting(is_retry);

        let (closed_tx, closed_rx) = watch::channel(None);
        let link = Link {
            generation,
            commands: commands_tx,
            closed: closed_rx,
            replacer: self.options.json_replacer.clone(),
        };

        let error = self.run_socket(link, is_retry, &mut commands).await;

        {
            let mut state = self.lock_state();
            if state.generation == generation {
                state.phase = Phase::Closed {
                    generation,
                    error: error.clone(),
                };
                state.socket = None;
                self.notify();
            }
        }
        closed_tx.send_replace(Some(error.clone()));

        match &error {
            ClientError::Closed(event) => {
                info!(generation = generation, code = event.code, reason = %event.reason, "Connection closed");
                self.events.closed(event.clone());
            }
            other => {
                error!(generation = generation, error = %other, "Connection failed");
                self.events.emit(ClientEvent::Error(other.clone()));
            }
        }
    }

    /// Runs the socket until it closes; returns why.
    async fn run_socket(
        self: &Arc<Self>,
        link: Link,
        is_retry: bool,
        commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    ) -> ClientError {
        let generation = link.generation;

        let url = match self.options.url.resolve().await {
            Ok(url) => url,
            Err(e) => return e,
        };

        let mut opening = self.options.connector.connect(&url, GRAPHQL_TRANSPORT_WS_PROTOCOL);
        let opened = loop {
            tokio::select! {
                socket = &mut opening => break socket,
                command = commands.recv() => {
                    if let Some(SocketCommand::Close { code, reason }) = command {
                        debug!(generation = generation, code = code, "Closed before the socket opened");
                        return ClientError::Closed(CloseEvent::new(code, reason));
                    }
                }
            }
        };
        drop(opening);

        let Socket { mut sink, mut events } = match opened {
            Ok(socket) => socket,
            Err(e) => return e,
        };
        debug!(generation = generation, url = %url, "Socket opened");
        self.events.opened();

        let params = match self.options.connection_params.resolve().await {
            Ok(params) => params,
            Err(message) => {
                warn!(generation = generation, error = %message, "Connection params failed");
                let reason = limit_close_reason(&message, "Bad Request");
                return close_with(sink.as_mut(), CloseCode::BadRequest.into(), reason).await;
            }
        };

        let init = match encode(
            &Message::ConnectionInit { payload: params },
            self.options.json_replacer.as_ref(),
        ) {
            Ok(init) => init,
            Err(e) => {
                let reason = limit_close_reason(&e.to_string(), "Bad Request");
                close_with(sink.as_mut(), CloseCode::BadRequest.into(), reason).await;
                return ClientError::Protocol(e);
            }
        };
        if let Err(e) = sink.send(init).await {
            return e;
        }
        self.transition(generation, Phase::AwaitingAck { generation });

        let ack_deadline = self
            .options
            .connection_ack_wait_timeout
            .map(|timeout| Instant::now() + timeout);
        let mut ping: Option<Interval> = None;
        let mut acked = false;

        loop {
            tokio::select! {
                _ = sleep_until(ack_deadline), if !acked => {
                    warn!(generation = generation, "Connection acknowledgement timed out");
                    return close_with(
                        sink.as_mut(),
                        CloseCode::ConnectionAcknowledgementTimeout.into(),
                        "Connection acknowledgement timeout".into(),
                    )
                    .await;
                }
                _ = tick(&mut ping) => {
                    if let Err(e) = self.send_control(sink.as_mut(), Message::Ping { payload: None }).await {
                        return e;
                    }
                    self.events.emit(ClientEvent::Ping { received: false, payload: None });
                }
                command = commands.recv() => match command {
                    Some(SocketCommand::Send(text)) => {
                        if let Err(e) = sink.send(text).await {
                            return e;
                        }
                    }
                    Some(SocketCommand::Close { code, reason }) => {
                        debug!(generation = generation, code = code, reason = %reason, "Closing socket");
                        return close_with(sink.as_mut(), code, reason).await;
                    }
                    None => {}
                },
                event = events.next() => match event {
                    Some(SocketEvent::Closed(event)) => return ClientError::Closed(event),
                    Some(frame) => {
                        let Some(data) = frame.data() else { continue };
                        let handled = self
                            .handle_frame(data, &link, is_retry, &mut acked, sink.as_mut())
                            .await;
                        if let Err(e) = handled {
                            return e;
                        }
                        if acked && ping.is_none() {
                            ping = self.options.ping_interval.map(|period| {
                                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                interval
                            });
                        }
                    }
                    None => {
                        return ClientError::Closed(CloseEvent::with_code(
                            CloseCode::AbnormalClosure,
                            "Socket stream ended",
                        ))
                    }
                },
            }
        }
    }

    /// Decode one inbound frame and act on it. `Err` ends the socket.
    async fn handle_frame(
        self: &Arc<Self>,
        data: &[u8],
        link: &Link,
        is_retry: bool,
        acked: &mut bool,
        sink: &mut dyn SocketSink,
    ) -> Result<(), ClientError> {
        let message = match decode(data, self.options.json_reviver.as_ref()) {
            Ok(message) => message,
            Err(e) => {
                warn!(generation = link.generation, error = %e, "Invalid message from peer");
                self.events.emit(ClientEvent::Error(ClientError::Protocol(e.clone())));
                let reason = limit_close_reason(&e.to_string(), "Bad Response");
                return Err(close_with(sink, CloseCode::BadRequest.into(), reason).await);
            }
        };

        self.events.emit(ClientEvent::Message(message.clone()));

        match message {
            Message::Ping { payload } => {
                self.events.emit(ClientEvent::Ping {
                    received: true,
                    payload: payload.clone(),
                });
                if !self.options.disable_pong {
                    self.send_control(sink, Message::Pong { payload: payload.clone() })
                        .await?;
                    self.events.emit(ClientEvent::Pong {
                        received: false,
                        payload,
                    });
                }
                return Ok(());
            }
            Message::Pong { payload } => {
                self.events.emit(ClientEvent::Pong {
                    received: true,
                    payload,
                });
                return Ok(());
            }
            _ => {}
        }

        if !*acked {
            return match message {
                Message::ConnectionAck { payload } => {
                    *acked = true;
                    self.acknowledge(link.clone());
                    info!(generation = link.generation, is_retry = is_retry, "Connection acknowledged");
                    self.events.connected(payload, is_retry);
                    Ok(())
                }
                other => {
                    let reason = format!("First message cannot be of type {}", other.message_type());
                    warn!(generation = link.generation, reason = %reason, "Unexpected handshake message");
                    Err(close_with(sink, CloseCode::BadRequest.into(), reason).await)
                }
            };
        }

        if message.is_operation_result() {
            self.router.dispatch(message);
        }
        Ok(())
    }

    async fn send_control(&self, sink: &mut dyn SocketSink, message: Message) -> Result<(), ClientError> {
        let text = encode(&message, self.options.json_replacer.as_ref())?;
        sink.send(text).await
    }
}

/// Start the closing handshake and report the closure.
async fn close_with(sink: &mut dyn SocketSink, code: u16, reason: String) -> ClientError {
    if let Err(e) = sink.close(code, reason.clone()).await {
        debug!(error = %e, "Close frame not delivered");
    }
    ClientError::Closed(CloseEvent::new(code, reason))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;

    #[test]
    fn test_new_connection_is_idle() {
        let connection = Connection::new(ClientOptions::new("ws://localhost:4000/graphql"));
        assert_eq!(
            connection.status(),
            ConnectionStatus {
                phase: ConnectionPhase::Idle,
                locks: 0,
                retries: 0,
                retrying: false,
            }
        );
    }

    #[test]
    fn test_stale_failure_does_not_mark_retrying() {
        let connection = Connection::new(ClientOptions::new("ws://localhost:4000/graphql"));
        connection.lock_state().generation = 3;

        let stale = Interrupted {
            generation: 2,
            error: ClientError::Closed(CloseEvent::new(1006, "")),
        };
        assert_eq!(connection.retry_decision(&stale), RetryDecision::Retry);
        assert!(!connection.status().retrying);

        let current = Interrupted {
            generation: 3,
            error: ClientError::Closed(CloseEvent::new(1006, "")),
        };
        assert_eq!(connection.retry_decision(&current), RetryDecision::Retry);
        assert!(connection.status().retrying);
    }

    #[test]
    fn test_dispose_stops_retries() {
        let connection = Connection::new(ClientOptions::new("ws://localhost:4000/graphql"));
        connection.dispose();
        let interrupted = Interrupted {
            generation: 0,
            error: ClientError::Closed(CloseEvent::new(1006, "")),
        };
        assert_eq!(connection.retry_decision(&interrupted), RetryDecision::Stop);
    }
}
