//! The cluster client: the request dispatcher and everything it leans on to
//! make a single correct dispatch decision without blocking: per-host
//! connection managers, the prepared-statement registry, the keyspace
//! switcher, the connect loop and the topology listener.
//!
//! All shared tables live behind one monitor ([`Tables`]); the monitor is
//! held only across map reads and writes, never across I/O. Work that many
//! callers may wait on (in-flight prepares, pending keyspace switches,
//! lifecycle transitions) is represented as shared futures handed to every
//! caller.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::join_all;
use futures::{future, FutureExt};
use tracing::{debug, trace, warn};

use crate::cluster::connection_manager::ConnectionManager;
use crate::cluster::{Connector, Host, HostDistance, HostListener, Registry};
use crate::errors::{
    CloseError, ConnectError, ConnectionError, ExecutionError, RequestAttemptError,
};
use crate::frame::request::{
    BatchEntry, BatchRequest, ExecuteRequest, PrepareRequest, QueryRequest, RequestParameters,
};
use crate::frame::response::{DbError, ResponseBody, ResultMetadata};
use crate::frame::types::Consistency;
use crate::frame::{Request, Response};
use crate::network::PooledConnection;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoutingInfo};
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::retry::{RetryDecision, RetryPolicy};
use crate::response::{ExecutionInfo, QueryResult, Rows};
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared::PreparedStatement;
use crate::statement::{ExecutionOptions, Statement};
use crate::utils::futures::{BoxedFuture, SharedFuture};

type PrepareFuture = SharedFuture<Result<Bytes, RequestAttemptError>>;
type ConnectFuture = SharedFuture<Result<(), ConnectError>>;
type CloseFuture = SharedFuture<()>;

/// Configuration for a [ClusterClient]: the external collaborators and the
/// policy plane, plus request defaults.
pub struct ClusterClientConfig {
    pub registry: Arc<dyn Registry>,
    pub connector: Arc<dyn Connector>,
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Consistency used when neither the statement nor the call options set one.
    pub default_consistency: Consistency,
    /// Timeout applied to every request that does not override it.
    pub request_timeout: Duration,
}

/// Lifecycle of the client. Transitions are monotonic: `Idle → Connecting →
/// Connected → Closing → Closed`, with `Connecting → Defunct → Closing` on a
/// failed connect. The in-progress transitions carry their shared futures so
/// that repeat callers join the same work.
enum ClientState {
    Idle,
    Connecting(ConnectFuture),
    Connected,
    Defunct,
    Closing(CloseFuture),
    Closed,
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::Idle => "Idle",
            ClientState::Connecting(_) => "Connecting",
            ClientState::Connected => "Connected",
            ClientState::Defunct => "Defunct",
            ClientState::Closing(_) => "Closing",
            ClientState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Per-host tables. Created when the first successful connection for the
/// host lands, dropped as one on host-down, so the prepared maps exist iff
/// the connection manager does.
struct HostTables {
    pool: ConnectionManager,
    prepared: HashMap<String, Bytes>,
    preparing: HashMap<String, PrepareFuture>,
}

impl HostTables {
    fn new() -> HostTables {
        HostTables {
            pool: ConnectionManager::new(),
            prepared: HashMap::new(),
            preparing: HashMap::new(),
        }
    }
}

/// Everything guarded by the client's monitor.
struct Tables {
    state: ClientState,
    hosts: HashMap<Host, HostTables>,
    /// Hosts whose initial or reconnect attempt is in flight.
    connecting: HashSet<Host>,
}

struct ClientInner {
    self_ref: Weak<ClientInner>,
    registry: Arc<dyn Registry>,
    connector: Arc<dyn Connector>,
    load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    default_consistency: Consistency,
    request_timeout: Duration,
    /// Session keyspace: the last keyspace observed on any SET_KEYSPACE
    /// response, process-wide. Written only by response handling, read by
    /// every dispatch.
    keyspace: Arc<ArcSwapOption<String>>,
    tables: Mutex<Tables>,
}

/// The cluster client: dispatches CQL requests across a pool of per-host
/// connections, under the control of the load balancing, reconnection and
/// retry policies.
pub struct ClusterClient {
    inner: Arc<ClientInner>,
}

/// What a dispatch resolved to, before the entry point shapes it for the
/// caller.
struct DispatchOutcome {
    response: Response,
    hosts_tried: Vec<Host>,
    consistency: Consistency,
    retries: u32,
}

/// The statement a dispatch is carrying; frames are rebuilt from it per
/// attempt because prepared ids are host-local.
enum RequestPayload<'a> {
    Query(&'a Statement),
    Prepare {
        cql: &'a str,
    },
    Execute {
        prepared: &'a PreparedStatement,
        paging_state: Option<Bytes>,
    },
    Batch(&'a Batch),
}

impl ClusterClient {
    pub fn with_config(config: ClusterClientConfig) -> ClusterClient {
        let inner = Arc::new_cyclic(|self_ref| ClientInner {
            self_ref: self_ref.clone(),
            registry: config.registry,
            connector: config.connector,
            load_balancing_policy: config.load_balancing_policy,
            reconnection_policy: config.reconnection_policy,
            retry_policy: config.retry_policy,
            default_consistency: config.default_consistency,
            request_timeout: config.request_timeout,
            keyspace: Arc::new(ArcSwapOption::empty()),
            tables: Mutex::new(Tables {
                state: ClientState::Idle,
                hosts: HashMap::new(),
                connecting: HashSet::new(),
            }),
        });
        ClusterClient { inner }
    }

    /// Brings the client online: registers for topology events and runs a
    /// connect loop for every currently known host.
    ///
    /// Fails with [ConnectError::NoHostsAvailable] if no host produced a
    /// connection; concurrent and repeated calls join the one in-progress
    /// connect.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let pending = {
            let mut tables = self.inner.tables.lock().unwrap();
            match &tables.state {
                ClientState::Idle => {
                    let inner = Arc::clone(&self.inner);
                    let connect: ConnectFuture = ClientInner::initial_connect(inner)
                        .boxed()
                        .shared();
                    tables.state = ClientState::Connecting(connect.clone());
                    connect
                }
                ClientState::Connecting(connect) => connect.clone(),
                ClientState::Connected => return Ok(()),
                ClientState::Defunct | ClientState::Closing(_) | ClientState::Closed => {
                    return Err(ConnectError::ClientClosed)
                }
            }
        };
        pending.await
    }

    /// Tears the client down: deregisters from the registry and closes every
    /// connection. A close issued while a connect is in progress waits for
    /// the connect to settle first.
    pub async fn close(&self) -> Result<(), CloseError> {
        let pending = {
            let mut tables = self.inner.tables.lock().unwrap();
            match &tables.state {
                ClientState::Idle => return Err(CloseError::ClientNotConnected),
                ClientState::Closed => return Ok(()),
                ClientState::Closing(close) => close.clone(),
                ClientState::Connecting(connect) => {
                    let close = self.inner.close_future(Some(connect.clone()));
                    tables.state = ClientState::Closing(close.clone());
                    close
                }
                ClientState::Connected | ClientState::Defunct => {
                    let close = self.inner.close_future(None);
                    tables.state = ClientState::Closing(close.clone());
                    close
                }
            }
        };
        pending.await;
        Ok(())
    }

    /// The session keyspace: the one observed on the latest SET_KEYSPACE
    /// response, used as the default target for requests.
    pub fn keyspace(&self) -> Option<String> {
        self.inner.keyspace.load_full().map(|name| (*name).clone())
    }

    /// Runs an unprepared statement.
    pub async fn query(
        &self,
        statement: &Statement,
        options: &ExecutionOptions,
    ) -> Result<QueryResult, ExecutionError> {
        let consistency = options
            .consistency
            .or(statement.config.consistency)
            .unwrap_or(self.inner.default_consistency);
        let timeout = options.request_timeout.unwrap_or(self.inner.request_timeout);
        let keyspace = self.inner.target_keyspace(options);
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref(),
            cql: Some(statement.cql()),
            consistency,
            is_idempotent: statement.config.is_idempotent,
        };
        let outcome = self
            .inner
            .run_request(
                RequestPayload::Query(statement),
                &routing,
                keyspace.as_deref(),
                consistency,
                timeout,
                options,
            )
            .await?;
        Ok(build_result(
            outcome,
            keyspace,
            Some(statement.cql.clone()),
            options.clone(),
            None,
        ))
    }

    /// Prepares a statement on some host picked by the load balancing plan.
    /// The resulting id is cached for that host; other hosts prepare lazily
    /// on their first execute.
    pub async fn prepare(
        &self,
        cql: impl Into<String>,
        options: &ExecutionOptions,
    ) -> Result<PreparedStatement, ExecutionError> {
        let cql = cql.into();
        let consistency = options
            .consistency
            .unwrap_or(self.inner.default_consistency);
        let timeout = options.request_timeout.unwrap_or(self.inner.request_timeout);
        let keyspace = self.inner.target_keyspace(options);
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref(),
            cql: Some(&cql),
            consistency,
            is_idempotent: false,
        };
        let outcome = self
            .inner
            .run_request(
                RequestPayload::Prepare { cql: &cql },
                &routing,
                keyspace.as_deref(),
                consistency,
                timeout,
                options,
            )
            .await?;
        match outcome.response.body {
            ResponseBody::Prepared(prepared) => {
                Ok(PreparedStatement::new(cql, prepared.metadata))
            }
            _ => Err(ExecutionError::Protocol(
                "Expected PREPARED response to a PREPARE request",
            )),
        }
    }

    /// Executes a prepared statement, resolving its host-local id on the
    /// chosen host first (preparing there if needed).
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        options: &ExecutionOptions,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, ExecutionError> {
        let consistency = options
            .consistency
            .or(prepared.config.consistency)
            .unwrap_or(self.inner.default_consistency);
        let timeout = options.request_timeout.unwrap_or(self.inner.request_timeout);
        let keyspace = self.inner.target_keyspace(options);
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref(),
            cql: Some(prepared.cql()),
            consistency,
            is_idempotent: prepared.config.is_idempotent,
        };
        let outcome = self
            .inner
            .run_request(
                RequestPayload::Execute {
                    prepared,
                    paging_state,
                },
                &routing,
                keyspace.as_deref(),
                consistency,
                timeout,
                options,
            )
            .await?;
        Ok(build_result(
            outcome,
            keyspace,
            Some(prepared.cql.clone()),
            options.clone(),
            Some(prepared.result_metadata()),
        ))
    }

    /// Runs a batch, first preparing any bound statement whose id is unknown
    /// on the chosen host.
    pub async fn batch(
        &self,
        batch: &Batch,
        options: &ExecutionOptions,
    ) -> Result<QueryResult, ExecutionError> {
        let consistency = options
            .consistency
            .or(batch.config.consistency)
            .unwrap_or(self.inner.default_consistency);
        let timeout = options.request_timeout.unwrap_or(self.inner.request_timeout);
        let keyspace = self.inner.target_keyspace(options);
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref(),
            cql: None,
            consistency,
            is_idempotent: batch.config.is_idempotent,
        };
        let outcome = self
            .inner
            .run_request(
                RequestPayload::Batch(batch),
                &routing,
                keyspace.as_deref(),
                consistency,
                timeout,
                options,
            )
            .await?;
        Ok(build_result(outcome, keyspace, None, options.clone(), None))
    }
}

impl ClientInner {
    fn target_keyspace(&self, options: &ExecutionOptions) -> Option<String> {
        options
            .keyspace
            .clone()
            .or_else(|| self.keyspace.load_full().map(|name| (*name).clone()))
    }

    async fn initial_connect(inner: Arc<ClientInner>) -> Result<(), ConnectError> {
        let listener: Arc<dyn HostListener> = Arc::clone(&inner) as Arc<dyn HostListener>;
        inner.registry.add_listener(listener);

        let targets: Vec<(Host, HostDistance)> = inner
            .registry
            .hosts()
            .into_iter()
            .filter_map(|host| match inner.load_balancing_policy.distance(&host) {
                HostDistance::Ignored => None,
                distance => Some((host, distance)),
            })
            .collect();
        {
            let mut tables = inner.tables.lock().unwrap();
            for (host, _) in &targets {
                tables.connecting.insert(host.clone());
            }
        }
        debug!(hosts = targets.len(), "Connecting to cluster");

        let attempts = targets.into_iter().map(|(host, distance)| {
            let inner = Arc::clone(&inner);
            async move {
                let result = inner.connect_to_host(&host, distance).await;
                (host, result)
            }
        });
        let mut errors: HashMap<Host, ConnectionError> = HashMap::new();
        for (host, result) in join_all(attempts).await {
            if let Err(error) = result {
                errors.insert(host, error);
            }
        }

        let mut tables = inner.tables.lock().unwrap();
        if !tables.hosts.is_empty() {
            if let ClientState::Connecting(_) = tables.state {
                tables.state = ClientState::Connected;
            }
            drop(tables);
            debug!("Cluster client connected");
            Ok(())
        } else {
            let close = if let ClientState::Connecting(_) = tables.state {
                tables.state = ClientState::Defunct;
                let close = inner.close_future(None);
                tables.state = ClientState::Closing(close.clone());
                Some(close)
            } else {
                None
            };
            drop(tables);
            warn!(failed = errors.len(), "Connect failed on every host");
            if let Some(close) = close {
                tokio::spawn(close);
            }
            Err(ConnectError::NoHostsAvailable { errors })
        }
    }

    /// Builds the shared teardown future. Does not touch the state machine;
    /// the caller installs it as `Closing` under the monitor.
    fn close_future(self: &Arc<Self>, settle: Option<ConnectFuture>) -> CloseFuture {
        let inner = Arc::clone(self);
        async move {
            if let Some(connect) = settle {
                // A close issued mid-connect waits for the connect to
                // settle, whatever its outcome.
                let _ = connect.await;
            }
            debug!("Closing cluster client");
            let listener: Arc<dyn HostListener> = Arc::clone(&inner) as Arc<dyn HostListener>;
            inner.registry.remove_listener(&listener);
            let connections: Vec<Arc<PooledConnection>> = {
                let mut tables = inner.tables.lock().unwrap();
                tables.connecting.clear();
                tables
                    .hosts
                    .drain()
                    .flat_map(|(_, host_tables)| host_tables.pool.snapshot())
                    .collect()
            };
            join_all(connections.iter().map(|connection| connection.close())).await;
            inner.tables.lock().unwrap().state = ClientState::Closed;
            debug!("Cluster client closed");
        }
        .boxed()
        .shared()
    }

    /// Brings one host online, retrying connection-level failures on the
    /// reconnection policy's schedule. Gives up silently if the host is
    /// withdrawn while the loop runs, and with the last error once the
    /// schedule is exhausted.
    async fn connect_to_host(
        self: &Arc<Self>,
        host: &Host,
        distance: HostDistance,
    ) -> Result<(), ConnectionError> {
        let mut schedule = self.reconnection_policy.schedule();
        loop {
            match self.connector.connect(host, distance).await {
                Ok(connections) => {
                    let pooled: Vec<Arc<PooledConnection>> = connections
                        .into_iter()
                        .map(PooledConnection::new)
                        .collect();
                    let withdrawn = {
                        let mut tables = self.tables.lock().unwrap();
                        if tables.connecting.remove(host) {
                            let host_tables = tables
                                .hosts
                                .entry(host.clone())
                                .or_insert_with(HostTables::new);
                            host_tables.pool.add(pooled);
                            None
                        } else {
                            Some(pooled)
                        }
                    };
                    return match withdrawn {
                        None => {
                            debug!(host = %host, "Host is up");
                            Ok(())
                        }
                        Some(pooled) => {
                            debug!(host = %host, "Host withdrawn while connecting, dropping fresh connections");
                            join_all(pooled.iter().map(|connection| connection.close())).await;
                            Ok(())
                        }
                    };
                }
                Err(error) => match schedule.next() {
                    Some(delay) => {
                        debug!(host = %host, error = %error, delay = ?delay, "Connecting to host failed, will retry");
                        tokio::time::sleep(delay).await;
                        if !self.tables.lock().unwrap().connecting.contains(host) {
                            debug!(host = %host, "Host withdrawn while waiting to reconnect, giving up");
                            return Ok(());
                        }
                    }
                    None => {
                        warn!(host = %host, error = %error, "Reconnection schedule exhausted, host will not come up this cycle");
                        self.tables.lock().unwrap().connecting.remove(host);
                        return Err(error);
                    }
                },
            }
        }
    }

    /// Returns the host-local prepared id for `cql`, preparing it on
    /// `connection` if needed. Concurrent callers for the same `(host, cql)`
    /// share one in-flight prepare.
    fn prepare_on_host(
        &self,
        host: &Host,
        connection: &Arc<PooledConnection>,
        cql: &str,
        timeout: Duration,
    ) -> PrepareFuture {
        let mut tables = self.tables.lock().unwrap();
        let Some(host_tables) = tables.hosts.get_mut(host) else {
            // The host vanished between picking the connection and preparing
            // on it; prepare without caching.
            drop(tables);
            return Self::send_prepare(Arc::clone(connection), cql.to_owned(), timeout)
                .boxed()
                .shared();
        };
        if let Some(id) = host_tables.prepared.get(cql) {
            let id = id.clone();
            return future::ready(Ok(id)).boxed().shared();
        }
        if let Some(preparing) = host_tables.preparing.get(cql) {
            trace!(host = %host, "Joining in-flight prepare");
            return preparing.clone();
        }

        trace!(host = %host, cql, "Preparing statement on host");
        let prepare: PrepareFuture = {
            let weak = self.self_ref.clone();
            let connection = Arc::clone(connection);
            let host = host.clone();
            let cql_text = cql.to_owned();
            async move {
                let result = Self::send_prepare(connection, cql_text.clone(), timeout).await;
                if let Some(inner) = weak.upgrade() {
                    let mut tables = inner.tables.lock().unwrap();
                    if let Some(host_tables) = tables.hosts.get_mut(&host) {
                        host_tables.preparing.remove(&cql_text);
                        if let Ok(id) = &result {
                            host_tables.prepared.insert(cql_text.clone(), id.clone());
                        }
                    }
                }
                result
            }
            .boxed()
            .shared()
        };
        host_tables.preparing.insert(cql.to_owned(), prepare.clone());
        prepare
    }

    async fn send_prepare(
        connection: Arc<PooledConnection>,
        cql: String,
        timeout: Duration,
    ) -> Result<Bytes, RequestAttemptError> {
        let request = Request::Prepare(PrepareRequest { cql });
        match connection.send_request(request, timeout).await {
            Ok(response) => match response.body {
                ResponseBody::Prepared(prepared) => Ok(prepared.id),
                ResponseBody::Error(error) => Err(error.into()),
                other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
            },
            Err(error) => Err(RequestAttemptError::Connection(error)),
        }
    }

    /// Builds the request frame for one attempt on `host`, resolving every
    /// prepared id the frame needs on that host.
    async fn resolve_frame(
        &self,
        payload: &RequestPayload<'_>,
        host: &Host,
        connection: &Arc<PooledConnection>,
        consistency: Consistency,
        retries: u32,
        timeout: Duration,
        options: &ExecutionOptions,
    ) -> Result<Request, ExecutionError> {
        let parameters = |tracing: bool, paging_state: Option<Bytes>| RequestParameters {
            consistency,
            paging_state,
            page_size: options.page_size,
            tracing,
            retries,
        };
        match payload {
            RequestPayload::Query(statement) => Ok(Request::Query(QueryRequest {
                cql: statement.cql.clone(),
                values: statement.values.clone(),
                parameters: parameters(statement.config.tracing, None),
            })),
            RequestPayload::Prepare { cql } => Ok(Request::Prepare(PrepareRequest {
                cql: (*cql).to_owned(),
            })),
            RequestPayload::Execute {
                prepared,
                paging_state,
            } => {
                let id = self
                    .prepare_on_host(host, connection, prepared.cql(), timeout)
                    .await
                    .map_err(ExecutionError::Prepare)?;
                Ok(Request::Execute(ExecuteRequest {
                    id,
                    values: prepared.values.clone(),
                    parameters: parameters(prepared.config.tracing, paging_state.clone()),
                }))
            }
            RequestPayload::Batch(batch) => {
                let entries = self
                    .resolve_batch_entries(batch, host, connection, timeout)
                    .await?;
                Ok(Request::Batch(BatchRequest {
                    batch_type: batch.batch_type,
                    entries,
                    parameters: parameters(batch.config.tracing, None),
                }))
            }
        }
    }

    /// Turns batch statements into frame entries. Bound statements with an
    /// unknown id on `host` are prepared first (one prepare per distinct
    /// cql) and the resolved ids are spliced back in original order.
    async fn resolve_batch_entries(
        &self,
        batch: &Batch,
        host: &Host,
        connection: &Arc<PooledConnection>,
        timeout: Duration,
    ) -> Result<Vec<BatchEntry>, ExecutionError> {
        let mut entries: Vec<Option<BatchEntry>> = Vec::with_capacity(batch.statements.len());
        let mut unprepared: Vec<(usize, String)> = Vec::new();
        {
            let tables = self.tables.lock().unwrap();
            let host_tables = tables.hosts.get(host);
            for (index, statement) in batch.statements.iter().enumerate() {
                match statement {
                    BatchStatement::Simple(statement) => entries.push(Some(BatchEntry::Query {
                        cql: statement.cql.clone(),
                        values: statement.values.clone(),
                    })),
                    BatchStatement::Bound(prepared) => {
                        match host_tables.and_then(|tables| tables.prepared.get(prepared.cql())) {
                            Some(id) => entries.push(Some(BatchEntry::Prepared {
                                id: id.clone(),
                                values: prepared.values.clone(),
                            })),
                            None => {
                                entries.push(None);
                                unprepared.push((index, prepared.cql().to_owned()));
                            }
                        }
                    }
                }
            }
        }

        if !unprepared.is_empty() {
            let mut distinct: Vec<String> = Vec::new();
            for (_, cql) in &unprepared {
                if !distinct.contains(cql) {
                    distinct.push(cql.clone());
                }
            }
            debug!(host = %host, statements = distinct.len(), "Preparing batch statements on host");
            let prepares = distinct
                .iter()
                .map(|cql| self.prepare_on_host(host, connection, cql, timeout));
            let mut ids: HashMap<&str, Bytes> = HashMap::new();
            for (cql, result) in distinct.iter().zip(join_all(prepares).await) {
                ids.insert(cql.as_str(), result.map_err(ExecutionError::Prepare)?);
            }
            for (index, cql) in unprepared {
                if let Some(BatchStatement::Bound(prepared)) = batch.statements.get(index) {
                    entries[index] = Some(BatchEntry::Prepared {
                        id: ids[cql.as_str()].clone(),
                        values: prepared.values.clone(),
                    });
                }
            }
        }

        Ok(entries
            .into_iter()
            .map(|entry| entry.expect("Bug in batch entry resolution"))
            .collect())
    }

    /// The shared dispatch loop of `query`, `prepare`, `execute` and
    /// `batch`: walk the load balancing plan, align the keyspace, resolve
    /// prepared ids, send, classify the response and retry as the policy
    /// dictates.
    async fn run_request(
        &self,
        payload: RequestPayload<'_>,
        routing: &RoutingInfo<'_>,
        target_keyspace: Option<&str>,
        starting_consistency: Consistency,
        timeout: Duration,
        options: &ExecutionOptions,
    ) -> Result<DispatchOutcome, ExecutionError> {
        let known_hosts = self.registry.hosts();
        let mut plan = self.load_balancing_policy.plan(routing, &known_hosts);
        let mut errors: HashMap<Host, RequestAttemptError> = HashMap::new();
        let mut hosts_tried: Vec<Host> = Vec::new();
        let mut consistency = starting_consistency;
        let mut retries: u32 = 0;

        'hosts_in_plan: loop {
            let Some(host) = plan.next() else {
                return Err(ExecutionError::NoHostsAvailable { errors });
            };

            let connection = {
                let tables = self.tables.lock().unwrap();
                let Some(host_tables) = tables.hosts.get(&host) else {
                    // The host was removed while the plan was being walked.
                    continue 'hosts_in_plan;
                };
                match host_tables.pool.random() {
                    Ok(connection) => connection,
                    Err(error) => {
                        errors.insert(host.clone(), error.into());
                        continue 'hosts_in_plan;
                    }
                }
            };
            hosts_tried.push(host.clone());

            // Keyspace errors are semantic, not host faults: they fail the
            // request without advancing the plan.
            if let Some(keyspace) = target_keyspace {
                if connection.keyspace().as_deref() != Some(keyspace) {
                    connection
                        .use_keyspace(keyspace, timeout, Arc::clone(&self.keyspace))
                        .await
                        .map_err(|error| ExecutionError::UseKeyspace {
                            keyspace: keyspace.to_owned(),
                            error,
                        })?;
                }
            }

            let mut request = self
                .resolve_frame(
                    &payload,
                    &host,
                    &connection,
                    consistency,
                    retries,
                    timeout,
                    options,
                )
                .await?;

            'same_host_retries: loop {
                trace!(host = %host, opcode = request.opcode(), "Sending request");
                let error = match connection.send_request(request.clone(), timeout).await {
                    Ok(response) => match response.body {
                        ResponseBody::Error(error) => error,
                        _ => {
                            self.note_response(&payload, &host, &response);
                            return Ok(DispatchOutcome {
                                response,
                                hosts_tried,
                                consistency,
                                retries,
                            });
                        }
                    },
                    Err(error) => {
                        debug!(host = %host, error = %error, "Request failed on connection, advancing plan");
                        errors.insert(host.clone(), RequestAttemptError::Connection(error));
                        continue 'hosts_in_plan;
                    }
                };

                let decision = match &error.error {
                    DbError::Unavailable {
                        consistency: cl,
                        required,
                        alive,
                    } => Some(self.retry_policy.on_unavailable(
                        routing, *cl, *required, *alive, retries,
                    )),
                    DbError::WriteTimeout {
                        consistency: cl,
                        received,
                        required,
                        write_type,
                    } => Some(self.retry_policy.on_write_timeout(
                        routing, *cl, write_type, *required, *received, retries,
                    )),
                    DbError::ReadTimeout {
                        consistency: cl,
                        received,
                        required,
                        data_present,
                    } => Some(self.retry_policy.on_read_timeout(
                        routing,
                        *cl,
                        *required,
                        *received,
                        *data_present,
                        retries,
                    )),
                    _ => None,
                };
                match decision {
                    None | Some(RetryDecision::Reraise) => {
                        return Err(ExecutionError::DbError(error.error, error.reason));
                    }
                    Some(RetryDecision::Ignore) => {
                        debug!(host = %host, "Retry policy ignored the server error");
                        return Ok(DispatchOutcome {
                            response: Response::void(),
                            hosts_tried,
                            consistency,
                            retries,
                        });
                    }
                    Some(RetryDecision::Retry(new_consistency)) => {
                        debug!(host = %host, %new_consistency, "Retrying on the same connection");
                        retries += 1;
                        consistency = new_consistency;
                        request.set_consistency(new_consistency);
                        request.set_retries(retries);
                        continue 'same_host_retries;
                    }
                }
            }
        }
    }

    /// Side effects of successful responses: SET_KEYSPACE moves the session
    /// keyspace, PREPARED lands in the host's registry.
    fn note_response(&self, payload: &RequestPayload<'_>, host: &Host, response: &Response) {
        match &response.body {
            ResponseBody::SetKeyspace(keyspace) => {
                debug!(keyspace, "Session keyspace changed");
                self.keyspace.store(Some(Arc::new(keyspace.clone())));
            }
            ResponseBody::Prepared(prepared) => {
                if let RequestPayload::Prepare { cql } = payload {
                    let mut tables = self.tables.lock().unwrap();
                    if let Some(host_tables) = tables.hosts.get_mut(host) {
                        host_tables.preparing.remove(*cql);
                        host_tables
                            .prepared
                            .insert((*cql).to_owned(), prepared.id.clone());
                    }
                }
            }
            _ => {}
        }
    }
}

impl HostListener for ClientInner {
    // host_found / host_lost track bare membership, which the registry owns;
    // nothing to do at this layer.

    fn host_up(&self, host: &Host) {
        let distance = self.load_balancing_policy.distance(host);
        {
            let mut tables = self.tables.lock().unwrap();
            match tables.state {
                ClientState::Defunct | ClientState::Closing(_) | ClientState::Closed => return,
                _ => {}
            }
            if tables.connecting.contains(host) {
                trace!(host = %host, "Host already connecting, ignoring host-up");
                return;
            }
            if distance == HostDistance::Ignored {
                trace!(host = %host, "Host is ignored by the load balancing policy");
                return;
            }
            tables.connecting.insert(host.clone());
        }
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        debug!(host = %host, "Host reported up, starting connect loop");
        let host = host.clone();
        tokio::spawn(async move {
            let _ = inner.connect_to_host(&host, distance).await;
        });
    }

    fn host_down(&self, host: &Host) -> BoxedFuture<'static, ()> {
        let removed = {
            let mut tables = self.tables.lock().unwrap();
            tables.connecting.remove(host);
            tables.hosts.remove(host)
        };
        match removed {
            None => future::ready(()).boxed(),
            Some(host_tables) => {
                debug!(host = %host, "Host reported down, closing its connections");
                let connections = host_tables.pool.snapshot();
                async move {
                    join_all(connections.iter().map(|connection| connection.close())).await;
                }
                .boxed()
            }
        }
    }
}

fn build_result(
    outcome: DispatchOutcome,
    keyspace: Option<String>,
    statement: Option<String>,
    options: ExecutionOptions,
    prepared_metadata: Option<&ResultMetadata>,
) -> QueryResult {
    let info = ExecutionInfo {
        keyspace,
        statement,
        options,
        hosts_tried: outcome.hosts_tried,
        consistency: outcome.consistency,
        retry_count: outcome.retries,
        trace_id: outcome.response.trace_id,
    };
    match outcome.response.body {
        ResponseBody::Rows(rows) => QueryResult {
            rows: Some(Rows {
                metadata: rows.metadata,
                raw_rows: rows.raw_rows,
            }),
            paging_state: rows.paging_state,
            info,
        },
        ResponseBody::RawRows(raw) => QueryResult {
            rows: Some(Rows {
                metadata: prepared_metadata.cloned().unwrap_or_default(),
                raw_rows: raw.raw_rows,
            }),
            paging_state: raw.paging_state,
            info,
        },
        _ => QueryResult {
            rows: None,
            paging_state: None,
            info,
        },
    }
}
