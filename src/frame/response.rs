use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use super::types::Consistency;

/// A semantic error decoded from an ERROR response.
///
/// Only the codes the dispatcher classifies carry their detail fields;
/// everything else the server may send lands in [`DbError::Other`] with its
/// raw code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The query text failed to parse on the server
    #[error("The query text failed to parse on the server")]
    SyntaxError,

    /// The query parsed but the server rejected it as invalid
    #[error("The query parsed but the server rejected it as invalid")]
    Invalid,

    /// Tried to create a keyspace or table that already exists
    #[error(
        "Tried to create a keyspace or table that already exists \
        (keyspace: {keyspace}, table: {table})"
    )]
    AlreadyExists {
        /// Keyspace that was created, or the keyspace of the created table
        keyspace: String,
        /// Created table; empty when a keyspace creation clashed
        table: String,
    },

    /// The server rejected the provided credentials
    #[error("The server rejected the provided credentials")]
    AuthenticationError,

    /// The authenticated user may not perform this query
    #[error("The authenticated user may not perform this query")]
    Unauthorized,

    /// The query conflicts with the server's configuration
    #[error("The query conflicts with the server's configuration")]
    ConfigError,

    /// The coordinator saw too few live replicas for the requested consistency
    #[error(
        "The coordinator saw too few live replicas for the requested consistency \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        /// Consistency the request asked for
        consistency: Consistency,
        /// Replicas the consistency needs alive
        required: i32,
        /// Replicas the coordinator believed alive
        alive: i32,
    },

    /// The coordinator is overloaded and shed the request
    #[error("The coordinator is overloaded and shed the request")]
    Overloaded,

    /// The coordinator is still bootstrapping and cannot serve requests yet
    #[error("The coordinator is still bootstrapping and cannot serve requests yet")]
    IsBootstrapping,

    /// A truncation failed server-side
    #[error("A truncation failed server-side")]
    TruncateError,

    /// The coordinator timed out collecting read responses
    #[error("The coordinator timed out collecting read responses \
            (consistency: {consistency}, received: {received}, required: {required}, data_present: {data_present})")]
    ReadTimeout {
        /// Consistency the request asked for
        consistency: Consistency,
        /// Replicas that answered before the timeout
        received: i32,
        /// Replicas the consistency needs to answer
        required: i32,
        /// Whether the replica asked for actual data answered
        data_present: bool,
    },

    /// The coordinator timed out collecting write acknowledgements
    #[error("The coordinator timed out collecting write acknowledgements \
            (consistency: {consistency}, received: {received}, required: {required}, write_type: {write_type})")]
    WriteTimeout {
        /// Consistency the request asked for
        consistency: Consistency,
        /// Replicas that acknowledged before the timeout
        received: i32,
        /// Replicas the consistency needs to acknowledge
        required: i32,
        /// What kind of write timed out
        write_type: WriteType,
    },

    /// The execute carried a prepared id the coordinator does not know;
    /// the statement has to be prepared there again
    #[error("The execute carried a prepared id the coordinator does not know")]
    Unprepared {
        /// The unknown prepared id
        statement_id: Bytes,
    },

    /// The server failed internally; likely a server-side bug
    #[error("The server failed internally; likely a server-side bug")]
    ServerError,

    /// The server could not make sense of a protocol message
    #[error("The server could not make sense of a protocol message")]
    ProtocolError,

    /// An error code this driver does not classify
    #[error("Server error with unclassified code {0:#06x}")]
    Other(i32),
}

impl DbError {
    /// Returns the error code carried by the ERROR response this error was
    /// decoded from.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// What kind of write a WRITE_TIMEOUT error was about. Retry policies key
/// their decisions on this: it tells them whether the write may have been
/// applied anywhere and whether replaying it is sound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    /// A plain write, not part of a batch
    Simple,
    /// A write from a logged batch; the batch log itself was written, so the
    /// batch will eventually be replayed by the cluster
    Batch,
    /// A write from an unlogged batch; no batch log backs it
    UnloggedBatch,
    /// A counter write, batched or not
    Counter,
    /// The write of the batch log itself timed out, before any batch
    /// statement was applied
    BatchLog,
    /// A compare-and-set write timed out during its paxos round
    Cas,
    /// The write could not take a materialized-view lock in time
    View,
    /// The write was held back by the CDC space limit
    Cdc,
    /// A write type this driver does not know
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

impl WriteType {
    /// The write type as the protocol spells it.
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(write_type) => write_type.as_str(),
        }
    }
}

/// An ERROR response: the semantic error plus the server's message.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

/// A handle to result metadata decoded by the protocol layer.
///
/// The cluster client never inspects column specifications; it only pairs
/// metadata with raw rows when materializing results of EXECUTE requests
/// that skipped metadata on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultMetadata {
    pub column_count: usize,
}

/// A RESULT response to a PREPARE request.
#[derive(Debug, Clone)]
pub struct PreparedResponse {
    pub id: Bytes,
    pub metadata: ResultMetadata,
}

/// A RESULT response carrying rows without metadata; the caller supplies the
/// metadata it got when preparing.
#[derive(Debug, Clone)]
pub struct RawRowsResponse {
    pub raw_rows: Bytes,
    pub paging_state: Option<Bytes>,
}

/// A RESULT response carrying rows together with their metadata.
#[derive(Debug, Clone)]
pub struct RowsResponse {
    pub metadata: ResultMetadata,
    pub raw_rows: Bytes,
    pub paging_state: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Error(Error),
    SetKeyspace(String),
    Prepared(PreparedResponse),
    RawRows(RawRowsResponse),
    Rows(RowsResponse),
    Void,
}

impl ResponseBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Error(_) => "ERROR",
            ResponseBody::SetKeyspace(_) => "SET_KEYSPACE",
            ResponseBody::Prepared(_) => "PREPARED",
            ResponseBody::RawRows(_) => "RAW_ROWS",
            ResponseBody::Rows(_) => "ROWS",
            ResponseBody::Void => "VOID",
        }
    }
}

/// A semantic response frame decoded by the connection layer.
#[derive(Debug, Clone)]
pub struct Response {
    pub body: ResponseBody,
    pub trace_id: Option<Uuid>,
}

impl Response {
    pub fn new(body: ResponseBody) -> Response {
        Response {
            body,
            trace_id: None,
        }
    }

    pub(crate) fn void() -> Response {
        Response::new(ResponseBody::Void)
    }
}
