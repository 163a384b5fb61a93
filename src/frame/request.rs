use bytes::Bytes;

use super::types::Consistency;

/// Parameters shared by all data-carrying requests.
///
/// The dispatcher rewrites `consistency` and `retries` in place when the
/// retry policy asks for another attempt; everything else is set once when
/// the frame is built.
#[derive(Debug, Clone, Default)]
pub struct RequestParameters {
    pub consistency: Consistency,
    pub paging_state: Option<Bytes>,
    pub page_size: Option<i32>,
    pub tracing: bool,
    pub retries: u32,
}

/// A QUERY frame: an unprepared CQL statement with pre-serialized values.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub cql: String,
    pub values: Vec<Bytes>,
    pub parameters: RequestParameters,
}

impl QueryRequest {
    pub(crate) fn use_keyspace(keyspace: &str) -> QueryRequest {
        QueryRequest {
            cql: format!("USE {}", keyspace),
            values: Vec::new(),
            parameters: RequestParameters::default(),
        }
    }
}

/// A PREPARE frame.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub cql: String,
}

/// An EXECUTE frame: a host-local prepared id with pre-serialized values.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub id: Bytes,
    pub values: Vec<Bytes>,
    pub parameters: RequestParameters,
}

/// The kind of a BATCH frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

/// One entry of a BATCH frame. Bound statements are spliced in as `Prepared`
/// entries once their host-local id is known.
#[derive(Debug, Clone)]
pub enum BatchEntry {
    Query { cql: String, values: Vec<Bytes> },
    Prepared { id: Bytes, values: Vec<Bytes> },
}

/// A BATCH frame.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub batch_type: BatchType,
    pub entries: Vec<BatchEntry>,
    pub parameters: RequestParameters,
}

/// A semantic request frame, ready to be encoded by the connection layer.
#[derive(Debug, Clone)]
pub enum Request {
    Query(QueryRequest),
    Prepare(PrepareRequest),
    Execute(ExecuteRequest),
    Batch(BatchRequest),
}

impl Request {
    /// Native-protocol opcode name, for diagnostics.
    pub fn opcode(&self) -> &'static str {
        match self {
            Request::Query(_) => "QUERY",
            Request::Prepare(_) => "PREPARE",
            Request::Execute(_) => "EXECUTE",
            Request::Batch(_) => "BATCH",
        }
    }

    pub fn parameters(&self) -> Option<&RequestParameters> {
        match self {
            Request::Query(q) => Some(&q.parameters),
            Request::Prepare(_) => None,
            Request::Execute(e) => Some(&e.parameters),
            Request::Batch(b) => Some(&b.parameters),
        }
    }

    fn parameters_mut(&mut self) -> Option<&mut RequestParameters> {
        match self {
            Request::Query(q) => Some(&mut q.parameters),
            Request::Prepare(_) => None,
            Request::Execute(e) => Some(&mut e.parameters),
            Request::Batch(b) => Some(&mut b.parameters),
        }
    }

    pub fn consistency(&self) -> Option<Consistency> {
        self.parameters().map(|p| p.consistency)
    }

    pub fn retries(&self) -> u32 {
        self.parameters().map(|p| p.retries).unwrap_or(0)
    }

    pub(crate) fn set_consistency(&mut self, consistency: Consistency) {
        if let Some(parameters) = self.parameters_mut() {
            parameters.consistency = consistency;
        }
    }

    pub(crate) fn set_retries(&mut self, retries: u32) {
        if let Some(parameters) = self.parameters_mut() {
            parameters.retries = retries;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_rewrite_touches_only_data_requests() {
        let mut query = Request::Query(QueryRequest {
            cql: "SELECT * FROM t".to_string(),
            values: Vec::new(),
            parameters: RequestParameters::default(),
        });
        query.set_consistency(Consistency::One);
        query.set_retries(2);
        assert_eq!(query.consistency(), Some(Consistency::One));
        assert_eq!(query.retries(), 2);

        let mut prepare = Request::Prepare(PrepareRequest {
            cql: "SELECT * FROM t".to_string(),
        });
        prepare.set_consistency(Consistency::One);
        assert_eq!(prepare.consistency(), None);
        assert_eq!(prepare.retries(), 0);
    }

    #[test]
    fn use_keyspace_builds_a_use_query() {
        let query = QueryRequest::use_keyspace("ks");
        assert_eq!(query.cql, "USE ks");
        assert!(query.values.is_empty());
    }
}
