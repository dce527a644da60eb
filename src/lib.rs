//! Elohim GraphQL WS - multiplexed graphql-transport-ws client
//!
//! Runs any number of GraphQL operations over one lazily opened WebSocket,
//! reconnecting and resubscribing when the socket drops.
//!
//! ## Architecture
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `protocol`    | Message shapes, validation, JSON encode/decode          |
//! | `transport`   | WebSocket connect/send/receive (`tokio-tungstenite`)    |
//! | `connection`  | The single socket: handshake, ack, ping/pong, routing   |
//! | `lifecycle`   | Lock counting and idle close                            |
//! | `retry`       | Failure classification and shared backoff               |
//! | `multiplexer` | One task per operation, resubscribe after reconnect     |
//! | `events`      | Lifecycle event broadcast                               |
//! | `client`      | Public entry point                                      |
//! | `config`      | Runtime options and TOML settings                       |
//!
//! ## Usage
//!
//! ```ignore
//! use elohim_graphql_ws::{Client, ClientOptions, SubscribePayload};
//! use futures_util::StreamExt;
//!
//! let client = Client::new(ClientOptions::new("ws://localhost:4000/graphql"));
//!
//! let mut greetings = client.iterate(SubscribePayload::new("subscription { greetings }"));
//! while let Some(result) = greetings.next().await {
//!     println!("{:?}", result?);
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod multiplexer;
pub mod protocol;
pub mod retry;
pub mod transport;

mod connection;
mod lifecycle;

// Re-exports
pub use client::Client;
pub use config::{ClientConfig, ClientOptions, ConnectionParams, UrlSource, RETRY_FOREVER};
pub use connection::{ConnectionPhase, ConnectionStatus};
pub use error::{ClientError, Result};
pub use events::{ClientEvent, EventBroadcaster};
pub use multiplexer::{OperationSink, SinkEvent, Subscription, SubscriptionHandle};
pub use protocol::{
    CloseCode, CloseEvent, GraphQLError, Message, MessageType, Payload, ProtocolError, SubscribePayload,
    GRAPHQL_TRANSPORT_WS_PROTOCOL,
};
pub use transport::{Connector, Socket, SocketEvent, SocketSink, WsConnector};
