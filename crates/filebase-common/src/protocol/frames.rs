//! Channel Wire Frames
//!
//! Both directions of a channel share a single message shape. A call carries a
//! correlation id (`rid`); the matching response reuses that id as its `name`.
//! Server pushes and application-level errors are frames whose `name` is an
//! event name or the literal `"error"` and whose `rid` is absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{FilebaseError, Result};

/// Frame name used for application-level error reports pushed by the server.
pub const ERROR_FRAME_NAME: &str = "error";

/// A single channel message, in either direction.
///
/// # Fields
///
/// - `name`: procedure name (call), correlation id (response), or event name (push)
/// - `args`: call arguments, or a one-element result/payload list
/// - `rid`: correlation id, present only on client→server calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
}

impl ChannelMessage {
    /// Creates a client→server call frame.
    pub fn call(name: impl Into<String>, args: Vec<Value>, rid: impl Into<String>) -> Self {
        ChannelMessage {
            name: name.into(),
            args,
            rid: Some(rid.into()),
        }
    }

    /// Creates a server→client response frame for a completed call.
    ///
    /// The response reuses the call's correlation id as its `name` and wraps
    /// the single result value in `args`.
    pub fn response(rid: impl Into<String>, result: Value) -> Self {
        ChannelMessage {
            name: rid.into(),
            args: vec![result],
            rid: None,
        }
    }

    /// Creates a server→client push frame for a named event.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        ChannelMessage {
            name: name.into(),
            args: vec![payload],
            rid: None,
        }
    }

    /// Creates a server→client application-level error frame.
    ///
    /// Error frames never close the channel; they are dispatched to `error`
    /// event listeners on the client.
    pub fn error(payload: Value) -> Self {
        ChannelMessage {
            name: ERROR_FRAME_NAME.into(),
            args: vec![payload],
            rid: None,
        }
    }

    /// Whether this frame is an application-level error report.
    pub fn is_error(&self) -> bool {
        self.name == ERROR_FRAME_NAME
    }

    /// Encodes the frame as a JSON text payload.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(FilebaseError::from)
    }

    /// Decodes a frame from a JSON text payload.
    ///
    /// A frame that is not valid JSON, or that lacks a `name`, is a
    /// `ChannelProtocol` error.
    pub fn decode(text: &str) -> Result<Self> {
        let msg: ChannelMessage = serde_json::from_str(text)
            .map_err(|e| FilebaseError::ChannelProtocol(format!("malformed frame: {}", e)))?;
        if msg.name.is_empty() {
            return Err(FilebaseError::ChannelProtocol(
                "frame has an empty name".into(),
            ));
        }
        Ok(msg)
    }
}
