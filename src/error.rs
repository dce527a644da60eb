//! Error types for elohim-graphql-ws

use thiserror::Error;

use crate::protocol::{CloseEvent, GraphQLError, ProtocolError};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client error types.
///
/// Cloneable because one connection failure fans out to every operation
/// that shared the connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// A message failed validation (locally or from the peer)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport closed with a code and reason
    #[error("Connection closed: {0}")]
    Closed(CloseEvent),

    /// The peer reported errors for a single operation
    #[error("Operation failed: {}", join_messages(.0))]
    Operation(Vec<GraphQLError>),

    /// A defect in the client or one of its collaborators
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// The close information, if this error is a transport closure.
    pub fn close_event(&self) -> Option<&CloseEvent> {
        match self {
            ClientError::Closed(event) => Some(event),
            _ => None,
        }
    }

    pub fn close_code(&self) -> Option<u16> {
        self.close_event().map(|event| event.code)
    }
}

impl From<CloseEvent> for ClientError {
    fn from(event: CloseEvent) -> Self {
        ClientError::Closed(event)
    }
}

fn join_messages(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
