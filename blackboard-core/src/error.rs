use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors raised by the relay core.
///
/// None of these are fatal to the dispatcher; they are scoped to a single
/// message or a single connection.
#[derive(Error, Debug)]
pub enum CoreError {
    /// An inbound frame was not a structurally valid message.
    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    /// A message could not be serialized for delivery.
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The connection is closed and can no longer accept frames.
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// A transport-specific write failure.
    #[error("Write to {id} failed: {reason}")]
    Write { id: ConnectionId, reason: String },
}
