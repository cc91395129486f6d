//! The broadcast loop.
//!
//! Connection readers push [`Envelope`]s onto one unbounded queue. A single
//! [`Dispatcher`] pops them in order and writes each to every connection in
//! the registry. A connection whose write fails is closed and unregistered;
//! delivery to the remaining connections carries on.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionId;
use crate::message::Envelope;
use crate::registry::ConnectionRegistry;

/// Producer half of the inbound queue, one clone per connection reader.
pub type InboundSender = mpsc::UnboundedSender<Envelope>;
/// Consumer half of the inbound queue, owned by the dispatcher.
pub type InboundReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Creates the multi-producer, single-consumer inbound queue.
pub fn inbound_queue() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

/// Who receives a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Every registered connection, the sender included.
    #[default]
    EchoToSender,
    /// Every registered connection except the one the message came from.
    ExcludeSender,
}

impl DeliveryPolicy {
    fn includes(&self, origin: ConnectionId, target: ConnectionId) -> bool {
        match self {
            DeliveryPolicy::EchoToSender => true,
            DeliveryPolicy::ExcludeSender => origin != target,
        }
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was handed to.
    pub delivered: usize,
    /// Connections removed because the write failed.
    pub dropped: usize,
}

pub struct Dispatcher {
    registry: ConnectionRegistry,
    inbound: InboundReceiver,
    policy: DeliveryPolicy,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry, inbound: InboundReceiver) -> Self {
        Self {
            registry,
            inbound,
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Drains the inbound queue until every sender has been dropped.
    pub async fn run(mut self) {
        info!("Dispatcher started ({:?}).", self.policy);
        while let Some(envelope) = self.inbound.recv().await {
            self.broadcast(&envelope);
        }
        info!("Inbound queue closed, dispatcher exiting.");
    }

    /// Writes one message to every registered connection allowed by the
    /// delivery policy.
    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let frame = match envelope.message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Dropping message from {}: {}", envelope.origin, e);
                return report;
            }
        };

        for connection in self.registry.snapshot() {
            let id = connection.id();
            if !self.policy.includes(envelope.origin, id) {
                continue;
            }
            match connection.send(&frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Write to {} failed, removing it: {}", id, e);
                    connection.close();
                    if self.registry.unregister(id).is_some() {
                        info!("Client {} dropped. Total clients: {}", id, self.registry.len());
                    }
                    report.dropped += 1;
                }
            }
        }

        debug!(
            "Broadcast '{}' from {}: {} delivered, {} dropped",
            envelope.message.kind, envelope.origin, report.delivered, report.dropped
        );
        report
    }
}
