use std::sync::Arc;

use rand::Rng;

use crate::errors::NoConnectionError;
use crate::network::PooledConnection;

/// The live connections of one host.
///
/// The manager is a plain ordered set guarded by the client's monitor; it is
/// read by snapshotting, so no lock is held while requests are in flight.
pub(crate) struct ConnectionManager {
    connections: Vec<Arc<PooledConnection>>,
}

impl ConnectionManager {
    pub(crate) fn new() -> ConnectionManager {
        ConnectionManager {
            connections: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, connections: Vec<Arc<PooledConnection>>) {
        self.connections.extend(connections);
    }

    /// Cheap ordered copy of the current connections.
    pub(crate) fn snapshot(&self) -> Vec<Arc<PooledConnection>> {
        self.connections.clone()
    }

    /// Picks a connection uniformly at random. Failing on an empty manager is
    /// recoverable: the dispatcher advances its plan to the next host.
    pub(crate) fn random(&self) -> Result<Arc<PooledConnection>, NoConnectionError> {
        match self.connections.len() {
            0 => Err(NoConnectionError),
            1 => Ok(Arc::clone(&self.connections[0])),
            len => {
                let idx = rand::rng().random_range(0..len);
                Ok(Arc::clone(&self.connections[idx]))
            }
        }
    }
}
