//! Accept loop and process-level wiring.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blackboard_config::Config;
use blackboard_core::{inbound_queue, ConnectionRegistry, DeliveryPolicy, Dispatcher, InboundSender};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{error, info, warn};

use super::websocket::{handle_connection, is_disconnect_error, ConnectionContext};
use super::TransportError;

/// How long `run_until` waits for connections to finish their close
/// handshake after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A bound relay: one listener, one registry, one dispatcher.
pub struct RelayServer {
    listener: TcpListener,
    registry: ConnectionRegistry,
    inbound: InboundSender,
    dispatcher: Dispatcher,
    context: Arc<ConnectionContext>,
}

impl RelayServer {
    /// Binds the listening socket and prepares the registry and queue.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Bind` if the address cannot be bound. Callers
    /// treat this as fatal.
    pub async fn bind(config: &Config) -> Result<Self, TransportError> {
        let address = config.server.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| TransportError::Bind { address: address.clone(), source })?;

        let registry = ConnectionRegistry::new();
        let (inbound, inbound_rx) = inbound_queue();
        let policy = if config.relay.echo_to_sender {
            DeliveryPolicy::EchoToSender
        } else {
            DeliveryPolicy::ExcludeSender
        };
        let dispatcher = Dispatcher::new(registry.clone(), inbound_rx).with_policy(policy);

        let context = Arc::new(ConnectionContext {
            registry: registry.clone(),
            inbound: inbound.clone(),
            path: config.server.path.clone(),
            ws_config: websocket_config(config),
        });

        Ok(Self {
            listener,
            registry,
            inbound,
            dispatcher,
            context,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle to the live connection set.
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// Serves until the process exits.
    pub async fn run(self) -> Result<(), TransportError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then closes every open connection.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            registry,
            inbound,
            dispatcher,
            context,
        } = self;

        let local_addr = listener.local_addr()?;
        info!("WebSocket relay listening on ws://{}{}", local_addr, context.path);

        let dispatcher_task = tokio::spawn(dispatcher.run());
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections.");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&context);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, context).await {
                                log_connection_error(peer, &e);
                            }
                        });
                    }
                    Err(e) => {
                        // Per-connection accept errors (e.g. EMFILE) must not stop the server.
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        for connection in registry.close_all() {
            connection.close();
        }
        info!("Closed all connections, waiting for them to finish.");
        let finish_all = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, finish_all).await.is_err() {
            warn!("{} connections did not close in time, aborting them.", connections.len());
            connections.shutdown().await;
        }

        // Every reader is gone, so the dispatcher drains what is left and exits.
        drop(inbound);
        drop(context);
        if let Err(e) = dispatcher_task.await {
            error!("Dispatcher task failed: {}", e);
        }
        info!("Relay stopped.");
        Ok(())
    }
}

fn websocket_config(config: &Config) -> Option<WebSocketConfig> {
    if config.relay.max_message_size.is_none() && config.relay.max_frame_size.is_none() {
        return None;
    }
    let mut ws_config = WebSocketConfig::default();
    if let Some(size) = config.relay.max_message_size {
        ws_config.max_message_size = Some(size);
    }
    if let Some(size) = config.relay.max_frame_size {
        ws_config.max_frame_size = Some(size);
    }
    Some(ws_config)
}

fn log_connection_error(peer: SocketAddr, e: &TransportError) {
    match e {
        TransportError::Rejected { .. } => warn!("{}", e),
        TransportError::WebSocket(ws) if is_disconnect_error(ws) => {
            info!("Connection from {} dropped: {}", peer, e)
        }
        _ => warn!("Connection from {} closed with error: {}", peer, e),
    }
}
