use bytes::Bytes;

use super::StatementConfig;
use crate::frame::response::ResultMetadata;
use crate::frame::types::Consistency;

/// A statement prepared through the cluster client.
///
/// The prepared id is deliberately absent here: ids are host-local tokens
/// kept in the client's per-host registry, and the right one is resolved at
/// dispatch time for whichever host the plan selects.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) cql: String,
    pub(crate) metadata: ResultMetadata,
    pub(crate) values: Vec<Bytes>,
    pub(crate) config: StatementConfig,
}

impl PreparedStatement {
    pub(crate) fn new(cql: String, metadata: ResultMetadata) -> PreparedStatement {
        PreparedStatement {
            cql,
            metadata,
            values: Vec::new(),
            config: StatementConfig::default(),
        }
    }

    pub fn cql(&self) -> &str {
        &self.cql
    }

    /// Result metadata received when the statement was prepared; used to
    /// materialize row results that skip metadata on the wire.
    pub fn result_metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    /// Binds pre-serialized values, returning the bound statement.
    pub fn bind(mut self, values: Vec<Bytes>) -> PreparedStatement {
        self.values = values;
        self
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
}
