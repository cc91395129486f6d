//! Server side of the WebSocket opening handshake.
//!
//! The request head is read and checked here instead of inside tungstenite
//! so that every rejected request still gets an HTTP status line back.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::TransportError;

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const WEBSOCKET_VERSION: &str = "13";

/// Why a request was not upgraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub(crate) status: StatusCode,
    pub(crate) reason: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    /// A complete `HTTP/1.1` error response with the reason as a text body.
    fn response(&self) -> String {
        let mut response = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Error")
        );
        if self.status == StatusCode::UPGRADE_REQUIRED {
            response.push_str(&format!("Sec-WebSocket-Version: {}\r\n", WEBSOCKET_VERSION));
        }
        response.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        response.push_str(&format!("Content-Length: {}\r\n", self.reason.len()));
        response.push_str("Connection: close\r\n\r\n");
        response.push_str(&self.reason);
        response
    }
}

/// Reads the request head from `stream`, answers it, and returns the
/// upgraded socket.
///
/// # Errors
///
/// Returns `TransportError::Rejected` after writing an error response when
/// the request is not a valid upgrade for `path`, or `TransportError::Io` if
/// the peer goes away mid-handshake.
pub(crate) async fn accept(
    mut stream: TcpStream,
    peer: SocketAddr,
    path: &str,
    config: Option<WebSocketConfig>,
) -> Result<WebSocketStream<TcpStream>, TransportError> {
    match read_request(&mut stream, path).await? {
        Ok(accept_key) => {
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                accept_key
            );
            stream.write_all(response.as_bytes()).await?;
            debug!("Upgraded connection from {}", peer);
            Ok(WebSocketStream::from_raw_socket(stream, Role::Server, config).await)
        }
        Err(rejection) => {
            stream.write_all(rejection.response().as_bytes()).await?;
            let _ = stream.shutdown().await;
            Err(TransportError::Rejected {
                peer,
                status: rejection.status,
                reason: rejection.reason,
            })
        }
    }
}

/// Reads until the request head is complete and checks it.
async fn read_request(
    stream: &mut TcpStream,
    path: &str,
) -> Result<Result<String, Rejection>, TransportError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(len)) if len < buf.len() => {
                // Clients must wait for the 101 before sending frames.
                return Ok(Err(Rejection::new(
                    StatusCode::BAD_REQUEST,
                    "Unexpected data after the request head",
                )));
            }
            Ok(httparse::Status::Complete(_)) => return Ok(check_request(&request, path)),
            Ok(httparse::Status::Partial) if buf.len() < MAX_REQUEST_HEAD => continue,
            Ok(httparse::Status::Partial) => {
                return Ok(Err(Rejection::new(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "Request head too large",
                )));
            }
            Err(e) => {
                return Ok(Err(Rejection::new(
                    StatusCode::BAD_REQUEST,
                    format!("Malformed request: {}", e),
                )));
            }
        }
    }
}

/// Validates a parsed upgrade request and derives `Sec-WebSocket-Accept`.
pub(crate) fn check_request(
    request: &httparse::Request<'_, '_>,
    path: &str,
) -> Result<String, Rejection> {
    let target = request.path.unwrap_or("/");
    let target_path = target.split('?').next().unwrap_or(target);
    if target_path != path {
        return Err(Rejection::new(
            StatusCode::NOT_FOUND,
            format!("No WebSocket endpoint at {}", target_path),
        ));
    }
    if request.method != Some("GET") {
        return Err(Rejection::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "WebSocket upgrade requires GET",
        ));
    }
    if request.version != Some(1) {
        return Err(Rejection::new(StatusCode::BAD_REQUEST, "WebSocket upgrade requires HTTP/1.1"));
    }
    if !has_token(request, "Connection", "upgrade") {
        return Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            "'upgrade' token not found in 'Connection' header",
        ));
    }
    if !has_token(request, "Upgrade", "websocket") {
        return Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            "'websocket' token not found in 'Upgrade' header",
        ));
    }
    if header(request, "Sec-WebSocket-Version") != Some(WEBSOCKET_VERSION) {
        return Err(Rejection::new(
            StatusCode::UPGRADE_REQUIRED,
            "Unsupported WebSocket version",
        ));
    }
    match header(request, "Sec-WebSocket-Key") {
        Some(key) if !key.is_empty() => Ok(derive_accept_key(key.as_bytes())),
        _ => Err(Rejection::new(StatusCode::BAD_REQUEST, "Missing 'Sec-WebSocket-Key' header")),
    }
}

fn header<'a>(request: &'a httparse::Request<'_, '_>, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

fn has_token(request: &httparse::Request<'_, '_>, name: &str, token: &str) -> bool {
    request
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .filter_map(|h| std::str::from_utf8(h.value).ok())
        .flat_map(|value| value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
