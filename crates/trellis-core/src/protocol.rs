use crate::patch::Patch;
use crate::tree::Node;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const ERR_UNKNOWN_EVENT: &str = "unknown_event";
pub const ERR_HANDLER_FAILED: &str = "handler_failed";
pub const ERR_INVALID_MESSAGE: &str = "invalid_message";
pub const ERR_UNKNOWN_CELL: &str = "unknown_cell";
pub const ERR_RENDER_FAILED: &str = "render_failed";

/// Messages pushed from the hub to a connected renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    Init {
        version: u64,
        tree: Node,
        session_id: String,
    },
    Update {
        version: u64,
        patch: Patch,
    },
    State {
        name: String,
        value: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>, name: Option<&str>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
            name: name.map(str::to_string),
        }
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            ServerMsg::Init { version, .. } | ServerMsg::Update { version, .. } => Some(*version),
            _ => None,
        }
    }
}

/// Messages sent by a renderer to the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Event {
        name: String,
        #[serde(default)]
        data: Value,
    },
    State {
        name: String,
        value: Value,
    },
    Heartbeat,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("message encode failed: {0}")]
    Encode(String),
    #[error("message decode failed: {0}")]
    Decode(String),
}

/// Encodes one protocol message as a WebSocket text payload.
pub fn encode_message<T: Serialize>(value: &T) -> Result<String, FrameError> {
    serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8], max_bytes: usize) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_bytes {
        return Err(FrameError::Oversized {
            size: raw.len(),
            max: max_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
