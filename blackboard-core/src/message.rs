//! The wire message relayed between clients.
//!
//! Every frame is a JSON object with two members: `type`, an application
//! defined discriminator, and `data`, an arbitrary payload. The relay never
//! interprets either; it only checks that a frame decodes structurally and
//! passes the value through untouched.

use std::fmt;
use std::sync::Arc;

use serde::de::Error as _;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::connection::ConnectionId;
use crate::error::CoreError;

/// One relayed message.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Discriminator chosen by the clients (`"draw"`, `"clear"`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload, carried as-is.
    pub data: Value,
}

fn decode_error(reason: &str) -> CoreError {
    CoreError::Decode(serde_json::Error::custom(reason))
}

/// Removes a member by name, preferring an exact match over one that only
/// differs in ASCII case.
fn take_member(members: &mut Map<String, Value>, name: &str) -> Option<Value> {
    if let Some(value) = members.remove(name) {
        return Some(value);
    }
    let key = members.keys().find(|key| key.eq_ignore_ascii_case(name))?.clone();
    members.remove(&key)
}

impl Message {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data }
    }

    /// Decodes a text frame.
    ///
    /// The document must be a JSON object or `null`. Member names match
    /// without regard to ASCII case. Missing members (and a bare `null`) fall
    /// back to an empty `type` and a `null` payload; unknown members are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Decode` if the text is not JSON, is an array or a
    /// scalar, or carries a `type` that is neither a string nor `null`.
    pub fn decode(text: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(text).map_err(CoreError::Decode)?;
        Self::from_value(value)
    }

    /// Decodes a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_slice(bytes).map_err(CoreError::Decode)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, CoreError> {
        let mut members = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(members) => members,
            _ => return Err(decode_error("expected a JSON object with `type` and `data` members")),
        };
        let kind = match take_member(&mut members, "type") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(kind)) => kind,
            Some(_) => return Err(decode_error("`type` must be a string")),
        };
        let data = take_member(&mut members, "data").unwrap_or(Value::Null);
        Ok(Self { kind, data })
    }

    /// Serializes the message once into a frame shared by every recipient.
    pub fn encode(&self) -> Result<Frame, CoreError> {
        let text = serde_json::to_string(self).map_err(CoreError::Encode)?;
        Ok(Frame(Arc::from(text)))
    }
}

/// An encoded message, cheap to clone across recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decoded message together with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: ConnectionId,
    pub message: Message,
}

impl Envelope {
    pub fn new(origin: ConnectionId, message: Message) -> Self {
        Self { origin, message }
    }
}
