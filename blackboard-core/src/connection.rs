use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CoreError;
use crate::message::Frame;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next unused id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A handle to one client's duplex channel, as seen by the dispatcher.
///
/// Implementations must be cheap to call from the dispatcher loop: `send`
/// hands the frame to the connection's own writer and returns without
/// waiting on the network.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queues a frame for delivery to this client.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or its writer has failed.
    /// The caller is expected to drop the connection on any error.
    fn send(&self, frame: &Frame) -> Result<(), CoreError>;

    /// Closes the underlying channel. Calling it more than once is a no-op.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
