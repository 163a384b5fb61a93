//! Statements a caller can submit: simple queries, prepared statements and
//! batches, plus the per-call execution options.

pub mod batch;
pub mod prepared;

use std::time::Duration;

use bytes::Bytes;

use crate::frame::types::Consistency;

/// Configuration carried by a statement across executions.
#[derive(Debug, Clone, Default)]
pub struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) is_idempotent: bool,
    pub(crate) tracing: bool,
}

/// An unprepared CQL statement with pre-serialized values.
///
/// Parameter binding happens outside the cluster client; `values` are the
/// already-serialized parameters in statement order.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) cql: String,
    pub(crate) values: Vec<Bytes>,
    pub(crate) config: StatementConfig,
}

impl Statement {
    pub fn new(cql: impl Into<String>) -> Statement {
        Statement {
            cql: cql.into(),
            values: Vec::new(),
            config: StatementConfig::default(),
        }
    }

    pub fn with_values(mut self, values: Vec<Bytes>) -> Statement {
        self.values = values;
        self
    }

    pub fn cql(&self) -> &str {
        &self.cql
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.config.consistency = Some(consistency);
    }

    /// Marks the statement as idempotent, widening what the retry policy may
    /// replay.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    /// Enables server-side tracing for this statement.
    pub fn set_tracing(&mut self, tracing: bool) {
        self.config.tracing = tracing;
    }
}

impl From<&str> for Statement {
    fn from(cql: &str) -> Statement {
        Statement::new(cql)
    }
}

impl From<String> for Statement {
    fn from(cql: String) -> Statement {
        Statement::new(cql)
    }
}

/// Per-call overrides for a single `query`/`prepare`/`execute`/`batch` call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Overrides the statement's and the client's default consistency.
    pub consistency: Option<Consistency>,
    /// Target keyspace; defaults to the session keyspace.
    pub keyspace: Option<String>,
    /// Overrides the client's default request timeout.
    pub request_timeout: Option<Duration>,
    /// Desired page size for row results.
    pub page_size: Option<i32>,
}
