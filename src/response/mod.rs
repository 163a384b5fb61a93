//! User-visible results of dispatched requests.

use bytes::Bytes;
use uuid::Uuid;

use crate::cluster::Host;
use crate::frame::response::ResultMetadata;
use crate::frame::types::Consistency;
use crate::statement::ExecutionOptions;

/// Metadata attached to every resolved request.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub(crate) keyspace: Option<String>,
    pub(crate) statement: Option<String>,
    pub(crate) options: ExecutionOptions,
    pub(crate) hosts_tried: Vec<Host>,
    pub(crate) consistency: Consistency,
    pub(crate) retry_count: u32,
    pub(crate) trace_id: Option<Uuid>,
}

impl ExecutionInfo {
    /// Keyspace the request targeted, if any.
    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// CQL text of the dispatched statement; `None` for batches.
    pub fn statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    /// The per-call options the request was dispatched with.
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Every host an attempt was actually sent to, in order.
    pub fn hosts_tried(&self) -> &[Host] {
        &self.hosts_tried
    }

    /// Consistency of the final attempt.
    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// How many times the retry policy re-sent the request.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Tracing session id, if the server traced the request. Fetching the
    /// trace record itself is left to the metadata layer.
    pub fn trace_id(&self) -> Option<Uuid> {
        self.trace_id
    }
}

/// One page of rows, paired with the metadata needed to decode it.
#[derive(Debug, Clone)]
pub struct Rows {
    pub(crate) metadata: ResultMetadata,
    pub(crate) raw_rows: Bytes,
}

impl Rows {
    pub fn metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    /// Raw rows payload, to be decoded by the protocol layer against
    /// [`Self::metadata`].
    pub fn raw_rows(&self) -> &Bytes {
        &self.raw_rows
    }
}

/// Result of a dispatched request.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub(crate) rows: Option<Rows>,
    pub(crate) paging_state: Option<Bytes>,
    pub(crate) info: ExecutionInfo,
}

impl QueryResult {
    /// The rows page, if the response carried one.
    pub fn rows(&self) -> Option<&Rows> {
        self.rows.as_ref()
    }

    /// Cursor to resume a large result, if the server returned one.
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }

    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.info
    }
}
