//! Lifecycle of a single WebSocket client.
//!
//! After a successful upgrade the socket is split in two. The writer drains
//! the connection's outbound channel into the sink; the reader decodes
//! every inbound frame and pushes it onto the dispatcher's queue. Whichever
//! side stops first ends the connection: it is unregistered and closed, and
//! the writer closes the sink on its way out.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use blackboard_core::{
    Connection, ConnectionId, ConnectionRegistry, CoreError, Envelope, Frame, InboundSender,
    Message,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::handshake;
use super::TransportError;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Per-server settings shared by every connection task.
pub(crate) struct ConnectionContext {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) inbound: InboundSender,
    pub(crate) path: String,
    pub(crate) ws_config: Option<WebSocketConfig>,
}

/// A registered WebSocket client.
///
/// `send` never touches the socket; it hands the frame to this client's
/// writer over an unbounded channel. Closing drops that channel, which
/// lets the writer flush, send a close frame and exit.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl WebSocketConnection {
    fn new(peer: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            outbound: Mutex::new(Some(tx)),
        });
        (connection, rx)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Frame>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, frame: &Frame) -> Result<(), CoreError> {
        match self.outbound().as_ref() {
            // Fails once the writer has exited and dropped its receiver.
            Some(tx) => tx.send(frame.clone()).map_err(|_| CoreError::ConnectionClosed(self.id)),
            None => Err(CoreError::ConnectionClosed(self.id)),
        }
    }

    fn close(&self) {
        self.outbound().take();
    }

    fn is_closed(&self) -> bool {
        self.outbound().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Why the reader stopped without an error.
#[derive(Debug)]
enum ReadEnd {
    /// The peer sent a close frame.
    CloseFrame,
    /// The stream ended without a close frame.
    StreamEnded,
}

/// Upgrades one accepted TCP stream and serves it until it closes.
///
/// Rejected handshakes (wrong path, not an upgrade request) are answered
/// with an HTTP error and never touch the registry.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
) -> Result<(), TransportError> {
    let ws_stream = handshake::accept(stream, peer, &ctx.path, ctx.ws_config.clone()).await?;

    let (connection, outbound_rx) = WebSocketConnection::new(peer);
    let id = connection.id();
    let (ws_sink, ws_source) = ws_stream.split();
    let writer = write_loop(ws_sink, outbound_rx, id);
    tokio::pin!(writer);

    if !ctx.registry.register(connection.clone()) {
        info!("Turning away {} from {}: relay is shutting down", id, peer);
        connection.close();
        writer.await;
        return Ok(());
    }
    info!("Client {} connected from {}. Total clients: {}", id, peer, ctx.registry.len());

    let outcome = tokio::select! {
        outcome = read_loop(ws_source, id, &ctx.inbound) => Some(outcome),
        () = &mut writer => None,
    };

    // Either side may get here first; the dispatcher may already have removed
    // this connection after a failed write.
    if ctx.registry.unregister(id).is_some() {
        info!("Client {} disconnected. Total clients: {}", id, ctx.registry.len());
    }
    connection.close();

    match outcome {
        Some(outcome) => {
            // Let the writer send its close frame before the socket is dropped.
            writer.await;
            match outcome? {
                ReadEnd::CloseFrame => debug!("Client {} sent a close frame", id),
                ReadEnd::StreamEnded => debug!("Client {} stream ended", id),
            }
            Ok(())
        }
        None => {
            debug!("Writer for {} stopped before the reader", id);
            Ok(())
        }
    }
}

/// Pushes every decoded frame onto the inbound queue, in arrival order.
async fn read_loop(
    mut source: WsSource,
    id: ConnectionId,
    inbound: &InboundSender,
) -> Result<ReadEnd, TransportError> {
    while let Some(frame) = source.next().await {
        let message = match frame? {
            WsMessage::Text(text) => Message::decode(&text)?,
            WsMessage::Binary(bytes) => Message::decode_bytes(&bytes)?,
            WsMessage::Close(_) => return Ok(ReadEnd::CloseFrame),
            // tungstenite answers pings itself; pongs need no reply.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };
        debug!("Received '{}' from {}", message.kind, id);
        inbound
            .send(Envelope::new(id, message))
            .map_err(|_| TransportError::QueueClosed)?;
    }
    Ok(ReadEnd::StreamEnded)
}

/// Forwards queued frames to the socket until the channel closes or a write
/// fails.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    id: ConnectionId,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(WsMessage::Text(frame.as_str().to_owned())).await {
            if is_disconnect_error(&e) {
                info!("Client {} went away during write", id);
            } else {
                warn!("WebSocket send error for {}: {}", id, e);
            }
            return;
        }
    }
    debug!("Outbound channel for {} closed, closing WebSocket sink", id);
    let _ = sink.close().await;
}

/// Errors that only mean the peer is gone.
pub(crate) fn is_disconnect_error(e: &WsError) -> bool {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Io(io_err) => matches!(
            io_err.kind(),
            std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
