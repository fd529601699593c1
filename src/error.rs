//! Error taxonomy for the bridge.
//!
//! Three recoverable kinds are distinguished so callers can tell "the network
//! failed" from "my body routine failed" from "I cancelled it":
//!
//! - [`Error::Transport`] — connectivity failures, abrupt stream termination,
//!   and protocol violations by the wrapped transport
//! - [`Error::BodyProducer`] — the caller-supplied request-body routine failed
//! - [`Error::Cancelled`] — the request was cancelled; takes priority over
//!   other in-flight errors once cancellation has been requested
//!
//! Contract violations (concurrent reads on one response, resuming a
//! restartable body from a nonzero offset, using a pool after shutdown) are
//! programming errors and panic instead of appearing here.

use std::sync::Arc;

use thiserror::Error;

/// A standard boxed error type used throughout the crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A shared error source, cloneable so a terminal error can be surfaced to
/// both a parked reader and the concluding trailer call.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// The error type returned by every fallible operation of the bridge.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The wrapped transport failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// The caller-supplied request-body producer failed.
    #[error("request body producer: {0}")]
    BodyProducer(SharedError),

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

/// Failures originating in the wrapped native transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    Connect(SharedError),

    /// The stream terminated before delivery completed.
    #[error("stream terminated: {0}")]
    Terminated(SharedError),

    /// Writing the request body to the transport failed.
    #[error("request body write failed: {0}")]
    Write(SharedError),

    /// The transport violated the delivery protocol
    /// (e.g. body bytes before response metadata).
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl Error {
    /// Wraps an arbitrary error as a body-producer failure.
    pub fn body_producer(err: impl Into<BoxError>) -> Self {
        Error::BodyProducer(Arc::from(err.into()))
    }

    /// True for errors of the cancellation class.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl TransportError {
    /// Wraps a connection-establishment failure.
    pub fn connect(err: impl Into<BoxError>) -> Self {
        TransportError::Connect(Arc::from(err.into()))
    }

    /// Wraps an abrupt stream termination.
    pub fn terminated(err: impl Into<BoxError>) -> Self {
        TransportError::Terminated(Arc::from(err.into()))
    }

    /// Wraps a request-body write failure.
    pub fn write(err: impl Into<BoxError>) -> Self {
        TransportError::Write(Arc::from(err.into()))
    }
}
