//! The connection contract and the per-connection state the cluster client
//! layers on top of it: the keyspace-switch attribute bag.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::errors::{ConnectionError, RequestAttemptError};
use crate::frame::request::QueryRequest;
use crate::frame::response::ResponseBody;
use crate::frame::Request;
use crate::frame::Response;
use crate::utils::futures::{BoxedFuture, SharedFuture};

/// A single connection to one host, owned by that host's connection manager.
///
/// Implementations encode semantic frames, multiplex in-flight requests over
/// the socket and deliver responses in send order. The client relies on the
/// connection tracking the keyspace it was last `USE`'d into.
pub trait Connection: Send + Sync {
    /// Sends one request frame; the future resolves with the decoded
    /// response, or with a connection-level error if the socket failed or
    /// `timeout` elapsed first.
    fn send_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> BoxedFuture<'static, Result<Response, ConnectionError>>;

    /// Closes the connection. Settles once in-flight requests were failed.
    fn close(&self) -> BoxedFuture<'static, ()>;

    /// The keyspace this connection currently operates in.
    fn keyspace(&self) -> Option<String>;
}

pub(crate) type SwitchFuture = SharedFuture<Result<(), RequestAttemptError>>;

struct PendingSwitch {
    keyspace: String,
    done: SwitchFuture,
}

/// A connection plus the mutable attributes the dispatcher needs on it:
/// the pending keyspace switch, shared by all callers targeting the same
/// keyspace so that only one `USE` frame is ever in flight per connection.
pub(crate) struct PooledConnection {
    connection: Arc<dyn Connection>,
    pending_switch: Mutex<Option<PendingSwitch>>,
}

impl PooledConnection {
    pub(crate) fn new(connection: Arc<dyn Connection>) -> Arc<PooledConnection> {
        Arc::new(PooledConnection {
            connection,
            pending_switch: Mutex::new(None),
        })
    }

    pub(crate) fn keyspace(&self) -> Option<String> {
        self.connection.keyspace()
    }

    pub(crate) fn send_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> BoxedFuture<'static, Result<Response, ConnectionError>> {
        self.connection.send_request(request, timeout)
    }

    pub(crate) fn close(&self) -> BoxedFuture<'static, ()> {
        self.connection.close()
    }

    /// Ensures the connection operates in `keyspace`.
    ///
    /// Concurrent callers targeting the same keyspace coalesce onto one
    /// in-flight `USE`; a caller targeting a different keyspace supersedes
    /// the pending pair. A successful switch also records the keyspace in
    /// the session-wide cell.
    pub(crate) fn use_keyspace(
        self: &Arc<Self>,
        keyspace: &str,
        timeout: Duration,
        session_keyspace: Arc<ArcSwapOption<String>>,
    ) -> SwitchFuture {
        let mut pending = self.pending_switch.lock().unwrap();

        if self.connection.keyspace().as_deref() == Some(keyspace) {
            return future::ready(Ok(())).boxed().shared();
        }
        if let Some(switch) = pending.as_ref() {
            if switch.keyspace == keyspace {
                trace!(keyspace, "Joining pending keyspace switch");
                return switch.done.clone();
            }
        }

        debug!(keyspace, "Switching connection keyspace");
        let this: Weak<PooledConnection> = Arc::downgrade(self);
        let connection = Arc::clone(&self.connection);
        let target = keyspace.to_owned();
        let switch: SwitchFuture = {
            let target = target.clone();
            async move {
                let request = Request::Query(QueryRequest::use_keyspace(&target));
                let result = match connection.send_request(request, timeout).await {
                    Ok(response) => match response.body {
                        ResponseBody::SetKeyspace(name) => {
                            session_keyspace.store(Some(Arc::new(name)));
                            Ok(())
                        }
                        ResponseBody::Error(error) => Err(error.into()),
                        other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
                    },
                    Err(error) => Err(RequestAttemptError::Connection(error)),
                };
                // Clear the pending pair, unless a switch to a different
                // keyspace superseded this one in the meantime.
                if let Some(pooled) = this.upgrade() {
                    let mut pending = pooled.pending_switch.lock().unwrap();
                    if pending.as_ref().is_some_and(|p| p.keyspace == target) {
                        *pending = None;
                    }
                }
                result
            }
            .boxed()
            .shared()
        };
        *pending = Some(PendingSwitch {
            keyspace: target,
            done: switch.clone(),
        });
        switch
    }
}
