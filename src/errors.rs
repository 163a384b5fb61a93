//! Errors surfaced by the cluster client.
//!
//! Every error that can ride a shared future is `Clone`; IO errors are
//! wrapped in `Arc` for that reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::Host;

pub use crate::frame::response::{DbError, WriteType};

/// An error raised by the I/O layer underneath a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection has been closed (locally or by the peer).
    #[error("Connection closed")]
    Closed,

    /// No response arrived within the request timeout.
    #[error("Request timeout after {0:?}")]
    RequestTimeout(Duration),

    /// The connection is no longer usable.
    #[error("Connection broken: {0}")]
    Broken(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> ConnectionError {
        ConnectionError::Io(Arc::new(error))
    }
}

/// Raised when a host's connection manager has no connections to hand out.
/// Callers treat this as a host-miss and advance the request plan.
#[derive(Error, Debug, Clone)]
#[error("No open connections to the host")]
pub struct NoConnectionError;

/// An error of a single request attempt on a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// The connection failed, not the server.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    Db(DbError, String),

    /// The selected host had no connections at dispatch time.
    #[error(transparent)]
    NoConnection(#[from] NoConnectionError),

    /// The server responded with a frame the attempt cannot interpret.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),
}

impl From<crate::frame::response::Error> for RequestAttemptError {
    fn from(error: crate::frame::response::Error) -> RequestAttemptError {
        RequestAttemptError::Db(error.error, error.reason)
    }
}

/// An error of a QUERY, PREPARE, EXECUTE or BATCH request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The load balancing plan was exhausted without a successful attempt.
    /// `errors` maps every failed host to the last cause observed on it.
    #[error("No hosts available for the request (tried {})", .errors.len())]
    NoHostsAvailable {
        errors: HashMap<Host, RequestAttemptError>,
    },

    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Switching the chosen connection to the target keyspace failed.
    #[error("Switching connection to keyspace \"{keyspace}\" failed: {error}")]
    UseKeyspace {
        keyspace: String,
        error: RequestAttemptError,
    },

    /// Preparing a statement on the chosen host failed.
    #[error("Preparing statement on the selected host failed: {0}")]
    Prepare(RequestAttemptError),

    /// Unexpected message received.
    #[error("Protocol Error: {0}")]
    Protocol(&'static str),
}

/// An error of `ClusterClient::connect`.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    /// The client was already closed or is closing.
    #[error("Client has been closed")]
    ClientClosed,

    /// No host produced a connection. `errors` maps every host whose connect
    /// loop gave up to its last connection error.
    #[error("No hosts could be brought online ({} failed)", .errors.len())]
    NoHostsAvailable {
        errors: HashMap<Host, ConnectionError>,
    },
}

/// An error of `ClusterClient::close`.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CloseError {
    /// `close` was called on a client that never connected.
    #[error("Client was never connected")]
    ClientNotConnected,
}
