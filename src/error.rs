// Copyright 2020 Joyent, Inc.

//! The error taxonomy shared by the Fast client and server engines.
//!
//! Every failure the engines can produce is one of the named types in
//! this module. The names and `Display` strings are part of the
//! protocol's compatibility surface: they appear on the wire in ERROR
//! messages, in emitted events, and in log output consumed by operators
//! and tests, so they must not drift.
//!
//! All of these types are `Clone`. A single fatal engine error fans out
//! to every pending request and is also retained for introspection, so
//! the one error value ends up in several places at once.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol-level failures: the decoder rejected the byte stream, or a
/// peer violated the message-level rules of the protocol. Any of these
/// is fatal to the client engine; on the server they are fatal to the
/// connection on which they occurred.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FastProtocolError {
    /// The version byte of a frame header was not the supported version.
    #[error("fast protocol: unsupported version {0}")]
    BadVersion(u8),

    /// The type byte of a frame header was not TYPE_JSON.
    #[error("fast protocol: unsupported message type {0}")]
    BadType(u8),

    /// The status byte of a frame header was not DATA, END, or ERROR.
    #[error("fast protocol: unsupported fast message status {0}")]
    BadStatus(u8),

    /// The msgid field of a frame header had its high bit set.
    #[error("fast protocol: invalid msgid {0}")]
    BadMsgid(u32),

    /// The declared payload length exceeds the configured maximum.
    #[error("fast protocol: data length {datalen} exceeds maximum of {max} bytes")]
    DataTooLong { datalen: usize, max: usize },

    /// The payload checksum did not match any accepted CRC variant.
    #[error("fast protocol: checksum mismatch: header has {expected}, calculated {calculated}")]
    ChecksumMismatch { expected: u32, calculated: u32 },

    /// The payload was not valid UTF-8 JSON of the expected shape.
    #[error("fast protocol: invalid JSON in data payload: {0}")]
    InvalidJson(String),

    /// An ERROR message's `data.d` lacked the required error fields.
    #[error("fast protocol: data.d for ERROR messages must have name and message properties")]
    BadErrorShape,

    /// The byte stream ended in the middle of a frame.
    #[error("fast protocol: incomplete message at end-of-stream")]
    IncompleteMessage,

    /// A message arrived for a msgid with no pending or aborted request.
    #[error("fast protocol: received message with unknown msgid {0}")]
    UnknownMsgid(u32),

    /// The transport ended while requests were still pending.
    #[error("unexpected end of transport stream")]
    UnexpectedEnd,

    /// A client sent a message whose status was not DATA.
    #[error("fast protocol: clients may only send DATA messages")]
    NotData,

    /// A client reused a msgid that is still active on the connection.
    #[error("fast protocol: received message with duplicate msgid {0}")]
    DuplicateMsgid(u32),

    /// A message's `data.d` had the wrong shape for its direction.
    #[error("fast protocol: {0}")]
    BadDataShape(&'static str),
}

/// Wraps an underlying transport failure, or marks a local detach from
/// the transport.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> TransportError {
        TransportError {
            message: message.into(),
        }
    }

    /// The error used to fail pending requests when `detach` is called.
    pub fn detached() -> TransportError {
        TransportError::new("client detached from transport")
    }
}

/// The error description carried in the `d` field of a server ERROR
/// message: a name, a message, and optional structured properties. The
/// `ase_errors` field is preserved opaquely when a peer sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RemoteServerError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ase_errors: Option<Value>,
}

impl RemoteServerError {
    pub fn new(name: &str, message: &str) -> RemoteServerError {
        RemoteServerError {
            name: String::from(name),
            message: String::from(message),
            info: None,
            context: None,
            ase_errors: None,
        }
    }

    pub fn with_info(
        name: &str,
        message: &str,
        info: Map<String, Value>,
    ) -> RemoteServerError {
        RemoteServerError {
            info: Some(info),
            ..RemoteServerError::new(name, message)
        }
    }

    /// The fallback used when an ERROR message's `d` cannot be parsed
    /// into this shape.
    pub(crate) fn unspecified() -> RemoteServerError {
        RemoteServerError::new(
            "UnspecifiedServerError",
            "Server reported unspecified error.",
        )
    }
}

/// Client-side wrapper around an ERROR message received from the
/// server. The remote error description is its cause.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("server error: {}", .cause.message)]
pub struct FastServerError {
    #[source]
    pub cause: RemoteServerError,
}

impl FastServerError {
    pub fn new(cause: RemoteServerError) -> FastServerError {
        FastServerError { cause }
    }
}

/// Synthesized when a request is terminated locally: by `abort`, by a
/// request timeout (the timeout is then the cause), or during engine
/// teardown.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("request aborted")]
pub struct RequestAbortedError {
    #[source]
    pub cause: Option<Box<FastError>>,
}

impl RequestAbortedError {
    pub fn new() -> RequestAbortedError {
        RequestAbortedError { cause: None }
    }

    pub fn with_cause(cause: FastError) -> RequestAbortedError {
        RequestAbortedError {
            cause: Some(Box::new(cause)),
        }
    }
}

impl Default for RequestAbortedError {
    fn default() -> Self {
        RequestAbortedError::new()
    }
}

/// Synthesized when a per-request timer fires before the terminal
/// message arrives.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("request timed out after {timeout_ms}ms")]
pub struct TimeoutError {
    pub timeout_ms: u64,
}

/// An outbound message failed validation or could not be serialized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    /// The msgid is outside the 31-bit message id space.
    #[error("msgid is not an integer between 0 and MSGID_MAX (got {0})")]
    BadMsgid(i64),

    /// The status byte is not DATA, END, or ERROR.
    #[error("unsupported fast message status: {0}")]
    BadStatus(u8),

    /// The data field is missing, null, or not a JSON object.
    #[error("data object is required and must be a JSON object")]
    BadData,

    /// The data payload could not be serialized to JSON.
    #[error("failed to serialize message data: {0}")]
    Serialize(String),
}

/// Any error a Fast engine can produce.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FastError {
    #[error(transparent)]
    Protocol(#[from] FastProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Server(#[from] FastServerError),
    #[error(transparent)]
    Aborted(#[from] RequestAbortedError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<std::io::Error> for FastError {
    fn from(err: std::io::Error) -> FastError {
        FastError::Transport(TransportError::new(format!(
            "transport error: {}",
            err
        )))
    }
}

/// The terminal error delivered to the caller of an RPC request. It
/// always wraps a deeper cause, and its `info` block always carries
/// `rpcMsgid` and `rpcMethod`; for server errors the server-supplied
/// info properties are merged in as well.
#[derive(Debug, Clone, PartialEq)]
pub struct FastRequestError {
    pub msgid: u32,
    pub method: String,
    pub info: Map<String, Value>,
    pub cause: Box<FastError>,
}

impl FastRequestError {
    pub fn new(msgid: u32, method: &str, cause: FastError) -> FastRequestError {
        let mut info = Map::new();
        if let FastError::Server(server_err) = &cause {
            if let Some(server_info) = &server_err.cause.info {
                for (k, v) in server_info {
                    info.insert(k.clone(), v.clone());
                }
            }
        }
        info.insert(String::from("rpcMsgid"), Value::from(msgid));
        info.insert(String::from("rpcMethod"), Value::from(method));

        FastRequestError {
            msgid,
            method: String::from(method),
            info,
            cause: Box::new(cause),
        }
    }
}

impl fmt::Display for FastRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request failed: {}", self.cause)
    }
}

impl std::error::Error for FastRequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}
