use std::io;

use thiserror::Error;

use crate::packet::{STATUS_AUTH_FAILED, STATUS_BAD_REQUEST};

/// Malformed or oversized frame. Fatal to the connection that produced it.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },

    #[error("frame length {0} is shorter than the fixed header")]
    TooShort(usize),

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("ext ({ext}) + payload ({pl}) lengths disagree with frame length {len}")]
    LengthMismatch { len: usize, ext: usize, pl: usize },

    #[error("peer closed the stream")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(i32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or undecodable credentials")]
    Malformed,

    #[error("credentials rejected for uid {0}")]
    Rejected(i64),
}

impl AuthError {
    /// Status code reported to the client in `AUTH_STATUS`.
    pub fn status(&self) -> i64 {
        match self {
            AuthError::Malformed => STATUS_BAD_REQUEST,
            AuthError::Rejected(_) => STATUS_AUTH_FAILED,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AuthError::Malformed => "params decode err",
            AuthError::Rejected(_) => "auth failed",
        }
    }
}

/// Failure talking to the queue, presence, membership or notification collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic}/{group} failed: {reason}")]
    Subscribe { topic: String, group: String, reason: String },

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt record at offset {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: FrameError,
    },

    #[error("store worker failed: {0}")]
    Worker(String),
}

/// Ends the loops of a single connection. Never escapes the connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker id {0} out of range [0, 1024)")]
    InvalidWorkerId(i64),
}

/// Why a dispatch worker could not resolve a packet into deliverable copies.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("message type {0:?} is not routable")]
    NotRoutable(crate::packet::MessageType),

    #[error("membership lookup for {id} failed: {source}")]
    Membership {
        id: i64,
        #[source]
        source: TransportError,
    },
}
