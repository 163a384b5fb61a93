use super::{prepared::PreparedStatement, Statement, StatementConfig};
use crate::frame::types::Consistency;

pub use crate::frame::request::BatchType;

/// One statement of a batch: either a simple CQL string or a bound prepared
/// statement whose host-local id is resolved at dispatch time.
#[derive(Debug, Clone)]
pub enum BatchStatement {
    Simple(Statement),
    Bound(PreparedStatement),
}

impl From<Statement> for BatchStatement {
    fn from(statement: Statement) -> BatchStatement {
        BatchStatement::Simple(statement)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(prepared: PreparedStatement) -> BatchStatement {
        BatchStatement::Bound(prepared)
    }
}

/// A batch of statements executed as one request.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub(crate) batch_type: BatchType,
    pub(crate) statements: Vec<BatchStatement>,
    pub(crate) config: StatementConfig,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Batch {
        Batch {
            batch_type,
            ..Batch::default()
        }
    }

    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn statements(&self) -> &[BatchStatement] {
        &self.statements
    }

    /// Sets the consistency to be used when executing this batch.
    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.config.consistency = Some(consistency);
    }

    /// Marks the whole batch as idempotent, widening what the retry policy
    /// may replay.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }
}
