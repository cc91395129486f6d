//! WebSocket transport for the blackboard relay.
//!
//! [`RelayServer`] accepts TCP connections, upgrades the ones addressed to the
//! configured path, registers each as a [`WebSocketConnection`] and feeds their
//! messages to the core dispatcher.

mod handshake;
mod server;
mod websocket;

use std::io;
use std::net::SocketAddr;

use blackboard_core::CoreError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::StatusCode;

pub use self::server::RelayServer;
pub use self::websocket::WebSocketConnection;

/// Error types that can occur while serving connections.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The listening socket could not be bound. Fatal at startup.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    /// Any other socket-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A request was answered with an HTTP error instead of an upgrade.
    #[error("Rejected upgrade from {peer} ({status}): {reason}")]
    Rejected {
        peer: SocketAddr,
        status: StatusCode,
        reason: String,
    },
    /// A WebSocket protocol or read error on an open connection.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// A frame could not be decoded, or a message could not be delivered.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// The dispatcher is gone and no longer accepts messages.
    #[error("Inbound queue closed")]
    QueueClosed,
}
