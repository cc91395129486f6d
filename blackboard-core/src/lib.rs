//! Core of the blackboard relay: the wire message, the connection registry
//! and the broadcast dispatcher.
//!
//! Transports plug in by implementing [`Connection`] for their socket handle,
//! registering it in a shared [`ConnectionRegistry`] and pushing decoded
//! [`Envelope`]s onto the queue returned by [`inbound_queue`]. A single
//! [`Dispatcher`] drains that queue and fans every message out to all
//! registered connections.

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;

// Re-export commonly used items
pub use connection::{Connection, ConnectionId};
pub use dispatcher::{
    inbound_queue, BroadcastReport, DeliveryPolicy, Dispatcher, InboundReceiver, InboundSender,
};
pub use error::CoreError;
pub use message::{Envelope, Frame, Message};
pub use registry::ConnectionRegistry;
