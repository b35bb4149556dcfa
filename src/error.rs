//! Error taxonomy for the badge pipeline.
//!
//! Transport, storage and send failures each get their own type so the layer
//! that can act on them (supervisor, ingest task, outbound path) matches on a
//! closed set. Binary plumbing wraps these in `anyhow` at the edges.

use std::time::Duration;

use thiserror::Error;

/// Opening a link to the node failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Device path missing, cannot be opened, or TCP peer refused.
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),

    /// The config handshake did not finish in time.
    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),
}

/// An established link stopped delivering events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("link lost: {reason}")]
pub struct LinkLost {
    pub reason: String,
}

impl LinkLost {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for LinkLost {
    fn from(err: std::io::Error) -> Self {
        LinkLost::new(err.to_string())
    }
}

/// Outbound text could not be handed to the radio.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message is empty")]
    Empty,

    #[error("message too long ({len} bytes, max {max})")]
    TooLong { len: usize, max: usize },

    #[error("not connected to the node")]
    NotConnected,

    #[error("link write failed: {0}")]
    Link(String),

    #[error("could not record outbound message: {0}")]
    Persist(String),

    #[error("link supervisor has stopped")]
    Closed,
}

/// Structured store failure. Duplicates are not errors.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// The supervisor hit its attempt ceiling and stopped retrying on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("gave up after {attempts} connect attempts (last error: {last_error})")]
pub struct LinkExhausted {
    pub attempts: u32,
    pub last_error: String,
}
