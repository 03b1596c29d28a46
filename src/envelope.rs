//! Message envelope wire format
//!
//! Every message crossing the proxy/bridge boundary is wrapped in exactly
//! one JSON object shape:
//!
//! ```json
//! { "data": <any>, "type": "message", "timeStamp": <integer milliseconds> }
//! ```
//!
//! Receivers must tolerate any additional top-level fields a future sender
//! adds; unknown fields are captured and carried through to the delivered
//! event rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{WorkerError, WorkerResult};

/// The `type` tag carried by every envelope this shim produces.
pub const MESSAGE_TYPE: &str = "message";

/// The JSON wrapper for one message crossing the worker boundary
///
/// Parsing accepts any JSON object: the known fields default when absent
/// instead of rejecting the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// User payload, any JSON-compatible value
    #[serde(default)]
    pub data: Value,
    /// Event type tag, `"message"` for everything this shim sends
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Milliseconds since the Unix epoch at send time
    #[serde(rename = "timeStamp", default)]
    pub time_stamp: u64,
    /// Top-level fields this shim does not know about, passed through
    /// for forward compatibility
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Wrap a payload in a `"message"` envelope stamped with the current time
    pub fn message(data: Value) -> Self {
        Self {
            data,
            kind: MESSAGE_TYPE.to_string(),
            time_stamp: now_millis(),
            extra: Map::new(),
        }
    }

    /// Serialize to the wire representation
    pub fn to_wire(&self) -> WorkerResult<String> {
        serde_json::to_string(self).map_err(WorkerError::Serialize)
    }

    /// Parse a wire string back into an envelope
    pub fn from_wire(wire: &str) -> WorkerResult<Self> {
        serde_json::from_str(wire).map_err(WorkerError::Deserialize)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
