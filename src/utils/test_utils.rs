//! Mock collaborators for exercising the cluster client without a server:
//! scriptable connections, a connector with per-host attempt accounting, a
//! registry that lets tests fire topology events, and policy doubles.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::cluster::{Connector, Host, HostDistance, HostListener, Registry};
use crate::errors::{ConnectionError, DbError, WriteType};
use crate::frame::request::Request;
use crate::frame::response::{
    Error, PreparedResponse, RawRowsResponse, Response, ResponseBody, ResultMetadata, RowsResponse,
};
use crate::frame::types::Consistency;
use crate::network::Connection;
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::reconnection::ConstantReconnectionPolicy;
use crate::policies::retry::{RetryDecision, RetryPolicy};
use crate::utils::futures::BoxedFuture;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

pub(crate) fn test_host(octet: u8) -> Host {
    let address = SocketAddr::from(([10, 0, 0, octet], 9042));
    Host::new(Uuid::new_v4(), address)
}

/// A reconnection policy whose schedule is immediately exhausted, so connect
/// loops fail fast in tests.
pub(crate) fn no_reconnection() -> ConstantReconnectionPolicy {
    ConstantReconnectionPolicy::with_max_retries(Duration::from_millis(1), 0)
}

pub(crate) fn rows_response() -> Response {
    Response::new(ResponseBody::Rows(RowsResponse {
        metadata: ResultMetadata { column_count: 2 },
        raw_rows: Bytes::from_static(b"rows"),
        paging_state: None,
    }))
}

pub(crate) fn error_response(error: DbError, reason: &str) -> Response {
    Response::new(ResponseBody::Error(Error {
        error,
        reason: reason.to_string(),
    }))
}

/// The prepared id the default responder hands out for a given cql.
pub(crate) fn prepared_id(cql: &str) -> Bytes {
    Bytes::from(format!("id:{}", cql))
}

type Responder = Box<dyn FnMut(&Request) -> Result<Response, ConnectionError> + Send>;

fn default_responder() -> Responder {
    Box::new(|request| {
        Ok(match request {
            Request::Query(query) if query.cql.starts_with("USE ") => {
                let keyspace = query.cql.trim_start_matches("USE ").to_string();
                Response::new(ResponseBody::SetKeyspace(keyspace))
            }
            Request::Query(_) => rows_response(),
            Request::Prepare(prepare) => Response::new(ResponseBody::Prepared(PreparedResponse {
                id: prepared_id(&prepare.cql),
                metadata: ResultMetadata { column_count: 2 },
            })),
            Request::Execute(_) => Response::new(ResponseBody::RawRows(RawRowsResponse {
                raw_rows: Bytes::from_static(b"raw"),
                paging_state: None,
            })),
            Request::Batch(_) => Response::new(ResponseBody::Void),
        })
    })
}

/// A scriptable [Connection]. Sent frames are recorded before the responder
/// runs; an optional gate holds every response until [`Self::release`],
/// which lets tests pile up concurrent requests deterministically.
pub(crate) struct MockConnection {
    keyspace: Arc<Mutex<Option<String>>>,
    sent: Mutex<Vec<Request>>,
    closed: Arc<AtomicBool>,
    responder: Mutex<Responder>,
    gate: Option<Arc<Semaphore>>,
}

impl MockConnection {
    pub(crate) fn new() -> MockConnection {
        MockConnection {
            keyspace: Arc::new(Mutex::new(None)),
            sent: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
            responder: Mutex::new(default_responder()),
            gate: None,
        }
    }

    pub(crate) fn gated() -> MockConnection {
        MockConnection {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..MockConnection::new()
        }
    }

    pub(crate) fn with_responder(
        responder: impl FnMut(&Request) -> Result<Response, ConnectionError> + Send + 'static,
    ) -> MockConnection {
        MockConnection {
            responder: Mutex::new(Box::new(responder)),
            ..MockConnection::new()
        }
    }

    /// Every request fails at the transport level.
    pub(crate) fn failing() -> MockConnection {
        MockConnection::with_responder(|_| {
            Err(ConnectionError::Broken("mock connection failure".to_string()))
        })
    }

    /// Every request draws the same server error.
    pub(crate) fn erroring(error: DbError, reason: &str) -> MockConnection {
        let reason = reason.to_string();
        MockConnection::with_responder(move |_| Ok(error_response(error.clone(), &reason)))
    }

    pub(crate) fn set_keyspace(&self, keyspace: &str) {
        *self.keyspace.lock().unwrap() = Some(keyspace.to_string());
    }

    /// Opens the gate, letting all waiting and future responses through.
    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1 << 20);
        }
    }

    pub(crate) fn sent_requests(&self) -> Vec<Request> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self, opcode: &str) -> usize {
        self.sent_requests()
            .iter()
            .filter(|request| request.opcode() == opcode)
            .count()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn send_request(
        &self,
        request: Request,
        _timeout: Duration,
    ) -> BoxedFuture<'static, Result<Response, ConnectionError>> {
        self.sent.lock().unwrap().push(request.clone());
        if self.closed.load(Ordering::SeqCst) {
            return futures::future::ready(Err(ConnectionError::Closed)).boxed();
        }
        let reply = {
            let mut responder = self.responder.lock().unwrap();
            (&mut *responder)(&request)
        };
        let gate = self.gate.clone();
        let closed = Arc::clone(&self.closed);
        let keyspace = Arc::clone(&self.keyspace);
        async move {
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
            if closed.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            if let Ok(response) = &reply {
                if let ResponseBody::SetKeyspace(name) = &response.body {
                    *keyspace.lock().unwrap() = Some(name.clone());
                }
            }
            reply
        }
        .boxed()
    }

    fn close(&self) -> BoxedFuture<'static, ()> {
        self.closed.store(true, Ordering::SeqCst);
        futures::future::ready(()).boxed()
    }

    fn keyspace(&self) -> Option<String> {
        self.keyspace.lock().unwrap().clone()
    }
}

type ConnectFn =
    Box<dyn Fn(&Host, usize) -> Result<Vec<Arc<dyn Connection>>, ConnectionError> + Send + Sync>;

/// A scriptable [Connector] that counts connection attempts per host.
pub(crate) struct MockConnector {
    connect_fn: ConnectFn,
    attempts: Mutex<HashMap<Uuid, usize>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockConnector {
    /// The closure receives the host and the 1-based attempt number.
    pub(crate) fn with(
        connect_fn: impl Fn(&Host, usize) -> Result<Vec<Arc<dyn Connection>>, ConnectionError>
            + Send
            + Sync
            + 'static,
    ) -> MockConnector {
        MockConnector {
            connect_fn: Box::new(connect_fn),
            attempts: Mutex::new(HashMap::new()),
            gate: None,
        }
    }

    /// Serves a fixed set of connections per host; unknown hosts fail.
    pub(crate) fn serving(connections: HashMap<Host, Vec<Arc<MockConnection>>>) -> MockConnector {
        MockConnector::with(move |host, _attempt| {
            connections
                .get(host)
                .map(|connections| {
                    connections
                        .iter()
                        .map(|connection| Arc::clone(connection) as Arc<dyn Connection>)
                        .collect()
                })
                .ok_or_else(|| ConnectionError::Broken("no route to host".to_string()))
        })
    }

    /// Every attempt towards every host fails.
    pub(crate) fn failing() -> MockConnector {
        MockConnector::with(|_, _| Err(ConnectionError::Broken("connect refused".to_string())))
    }

    /// Holds every connect attempt until permits arrive on `gate`.
    pub(crate) fn with_gate(mut self, gate: Arc<Semaphore>) -> MockConnector {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn attempts(&self, host: &Host) -> usize {
        *self
            .attempts
            .lock()
            .unwrap()
            .get(&host.host_id())
            .unwrap_or(&0)
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        host: &Host,
        _distance: HostDistance,
    ) -> BoxedFuture<'static, Result<Vec<Arc<dyn Connection>>, ConnectionError>> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(host.host_id()).or_insert(0);
            *count += 1;
            *count
        };
        let result = (self.connect_fn)(host, attempt);
        let gate = self.gate.clone();
        async move {
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
            result
        }
        .boxed()
    }
}

/// A [Registry] tests drive by hand: membership is a plain list, and
/// topology events are fired explicitly at the registered listeners.
pub(crate) struct MockRegistry {
    hosts: Mutex<Vec<Host>>,
    listeners: Mutex<Vec<Arc<dyn HostListener>>>,
}

impl MockRegistry {
    pub(crate) fn with_hosts(hosts: Vec<Host>) -> Arc<MockRegistry> {
        Arc::new(MockRegistry {
            hosts: Mutex::new(hosts),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn add_host(&self, host: Host) {
        self.hosts.lock().unwrap().push(host);
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub(crate) fn fire_host_up(&self, host: &Host) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.host_up(host);
        }
    }

    pub(crate) async fn fire_host_down(&self, host: &Host) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.host_down(host).await;
        }
    }
}

impl Registry for MockRegistry {
    fn hosts(&self) -> Vec<Host> {
        self.hosts.lock().unwrap().clone()
    }

    fn add_listener(&self, listener: Arc<dyn HostListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn HostListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .lock()
            .unwrap()
            .retain(|registered| Arc::as_ptr(registered) as *const () != target);
    }
}

/// A load balancing policy with a fixed plan, for deterministic failover
/// tests.
#[derive(Debug)]
pub(crate) struct SequencePolicy {
    hosts: Vec<Host>,
}

impl SequencePolicy {
    pub(crate) fn new(hosts: Vec<Host>) -> SequencePolicy {
        SequencePolicy { hosts }
    }
}

impl LoadBalancingPolicy for SequencePolicy {
    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn plan(&self, _request: &RoutingInfo<'_>, _hosts: &[Host]) -> Plan {
        Box::new(self.hosts.clone().into_iter())
    }

    fn name(&self) -> String {
        "SequencePolicy".to_string()
    }
}

/// One recorded consultation of a [ScriptedRetryPolicy].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RetryCall {
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
        retries: u32,
    },
    WriteTimeout {
        consistency: Consistency,
        write_type: WriteType,
        required: i32,
        received: i32,
        retries: u32,
    },
    ReadTimeout {
        consistency: Consistency,
        required: i32,
        received: i32,
        data_present: bool,
        retries: u32,
    },
}

/// A retry policy that replays scripted decisions and records every
/// consultation with the fields it received.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRetryPolicy {
    decisions: Mutex<VecDeque<RetryDecision>>,
    calls: Mutex<Vec<RetryCall>>,
}

impl ScriptedRetryPolicy {
    pub(crate) fn with_decisions(decisions: Vec<RetryDecision>) -> ScriptedRetryPolicy {
        ScriptedRetryPolicy {
            decisions: Mutex::new(decisions.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<RetryCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next_decision(&self) -> RetryDecision {
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RetryDecision::Reraise)
    }
}

impl RetryPolicy for ScriptedRetryPolicy {
    fn on_unavailable(
        &self,
        _request: &RoutingInfo<'_>,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retries: u32,
    ) -> RetryDecision {
        self.calls.lock().unwrap().push(RetryCall::Unavailable {
            consistency,
            required,
            alive,
            retries,
        });
        self.next_decision()
    }

    fn on_write_timeout(
        &self,
        _request: &RoutingInfo<'_>,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        retries: u32,
    ) -> RetryDecision {
        self.calls.lock().unwrap().push(RetryCall::WriteTimeout {
            consistency,
            write_type: write_type.clone(),
            required,
            received,
            retries,
        });
        self.next_decision()
    }

    fn on_read_timeout(
        &self,
        _request: &RoutingInfo<'_>,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_present: bool,
        retries: u32,
    ) -> RetryDecision {
        self.calls.lock().unwrap().push(RetryCall::ReadTimeout {
            consistency,
            required,
            received,
            data_present,
            retries,
        });
        self.next_decision()
    }
}
