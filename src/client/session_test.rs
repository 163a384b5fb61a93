use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::Semaphore;

use crate::client::{ClusterClient, ClusterClientBuilder};
use crate::cluster::{Connector, Host};
use crate::errors::{
    CloseError, ConnectError, ConnectionError, DbError, ExecutionError, RequestAttemptError,
    WriteType,
};
use crate::frame::request::{BatchEntry, Request};
use crate::frame::response::ResultMetadata;
use crate::frame::types::Consistency;
use crate::network::Connection;
use crate::policies::reconnection::ConstantReconnectionPolicy;
use crate::policies::retry::{RetryDecision, RetryPolicy};
use crate::statement::batch::{Batch, BatchType};
use crate::statement::prepared::PreparedStatement;
use crate::statement::{ExecutionOptions, Statement};
use crate::utils::test_utils::{
    error_response, no_reconnection, prepared_id, rows_response, setup_tracing, test_host,
    MockConnection, MockConnector, MockRegistry, RetryCall, ScriptedRetryPolicy, SequencePolicy,
};

fn builder(registry: Arc<MockRegistry>, connector: Arc<MockConnector>) -> ClusterClientBuilder {
    ClusterClientBuilder::new(registry, connector)
        .reconnection_policy(Arc::new(no_reconnection()))
}

struct SingleHost {
    host: Host,
    connection: Arc<MockConnection>,
    registry: Arc<MockRegistry>,
    connector: Arc<MockConnector>,
}

fn single_host(connection: MockConnection) -> SingleHost {
    let host = test_host(1);
    let connection = Arc::new(connection);
    let registry = MockRegistry::with_hosts(vec![host.clone()]);
    let connector = Arc::new(MockConnector::serving(HashMap::from([(
        host.clone(),
        vec![Arc::clone(&connection)],
    )])));
    SingleHost {
        host,
        connection,
        registry,
        connector,
    }
}

async fn connected_client(fixture: &SingleHost) -> ClusterClient {
    let client = builder(fixture.registry.clone(), fixture.connector.clone()).build();
    client.connect().await.unwrap();
    client
}

// ---------------------------------------------------------------- lifecycle

#[tokio::test]
async fn connect_brings_known_hosts_online_and_is_idempotent() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = builder(fixture.registry.clone(), fixture.connector.clone()).build();

    client.connect().await.unwrap();
    // A repeated connect joins the already-settled transition.
    client.connect().await.unwrap();

    assert_eq!(fixture.connector.attempts(&fixture.host), 1);
    assert_eq!(fixture.registry.listener_count(), 1);
}

#[tokio::test]
async fn connect_with_no_known_hosts_fails_and_defuncts_the_client() {
    setup_tracing();
    let registry = MockRegistry::with_hosts(vec![]);
    let connector = Arc::new(MockConnector::failing());
    let client = builder(registry, connector).build();

    let error = client.connect().await.unwrap_err();
    match error {
        ConnectError::NoHostsAvailable { errors } => assert!(errors.is_empty()),
        other => panic!("unexpected error: {:?}", other),
    }

    // The failed connect tears the client down; it never becomes usable.
    assert_matches!(client.connect().await, Err(ConnectError::ClientClosed));
    client.close().await.unwrap();
}

#[tokio::test]
async fn connect_reports_the_error_of_every_failed_host() {
    setup_tracing();
    let first = test_host(1);
    let second = test_host(2);
    let registry = MockRegistry::with_hosts(vec![first.clone(), second.clone()]);
    let connector = Arc::new(MockConnector::failing());
    let client = builder(registry, connector).build();

    let error = client.connect().await.unwrap_err();
    match error {
        ConnectError::NoHostsAvailable { errors } => {
            assert_eq!(errors.len(), 2);
            assert!(errors.contains_key(&first));
            assert!(errors.contains_key(&second));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn close_before_connect_is_a_lifecycle_error() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = builder(fixture.registry.clone(), fixture.connector.clone()).build();

    assert_matches!(client.close().await, Err(CloseError::ClientNotConnected));
}

#[tokio::test]
async fn close_tears_down_connections_and_is_idempotent() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = connected_client(&fixture).await;

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert!(fixture.connection.is_closed());
    assert_eq!(fixture.registry.listener_count(), 0);
    // Dispatch after close finds no live hosts.
    let error = client
        .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_matches!(error, ExecutionError::NoHostsAvailable { .. });
    // And the lifecycle never reverses.
    assert_matches!(client.connect().await, Err(ConnectError::ClientClosed));
}

#[tokio::test]
async fn close_during_connect_waits_for_the_connect_to_settle() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let gate = Arc::new(Semaphore::new(0));
    let connector = Arc::new(
        MockConnector::serving(HashMap::from([(
            fixture.host.clone(),
            vec![Arc::clone(&fixture.connection)],
        )]))
        .with_gate(Arc::clone(&gate)),
    );
    let client = builder(fixture.registry.clone(), connector).build();

    let (connect_result, close_result, _) = tokio::join!(
        client.connect(),
        async {
            tokio::task::yield_now().await;
            client.close().await
        },
        async {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            gate.add_permits(16);
        },
    );

    connect_result.unwrap();
    close_result.unwrap();
    assert!(fixture.connection.is_closed());
}

#[tokio::test(start_paused = true)]
async fn connect_walks_the_reconnection_schedule() {
    setup_tracing();
    let host = test_host(1);
    let registry = MockRegistry::with_hosts(vec![host.clone()]);
    let connector = Arc::new(MockConnector::with(|_, attempt| {
        if attempt < 3 {
            Err(ConnectionError::Broken("refused".to_string()))
        } else {
            Ok(vec![Arc::new(MockConnection::new()) as Arc<dyn Connection>])
        }
    }));
    let client = ClusterClientBuilder::new(registry, Arc::clone(&connector) as Arc<dyn Connector>)
        .reconnection_policy(Arc::new(ConstantReconnectionPolicy::with_max_retries(
            Duration::from_millis(10),
            5,
        )))
        .build();

    client.connect().await.unwrap();
    assert_eq!(connector.attempts(&host), 3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_loop_abandons_a_withdrawn_host() {
    setup_tracing();
    let good = test_host(1);
    let flaky = test_host(2);
    let registry = MockRegistry::with_hosts(vec![good.clone()]);
    let good_id = good.host_id();
    let connector = Arc::new(MockConnector::with(move |host, _| {
        if host.host_id() == good_id {
            Ok(vec![Arc::new(MockConnection::new()) as Arc<dyn Connection>])
        } else {
            Err(ConnectionError::Broken("refused".to_string()))
        }
    }));
    let client = ClusterClientBuilder::new(registry.clone(), Arc::clone(&connector) as Arc<dyn Connector>)
        .reconnection_policy(Arc::new(ConstantReconnectionPolicy::with_max_retries(
            Duration::from_secs(1),
            10,
        )))
        .build();
    client.connect().await.unwrap();

    registry.add_host(flaky.clone());
    registry.fire_host_up(&flaky);
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    // Withdraw the host while its connect loop waits out the backoff.
    registry.fire_host_down(&flaky).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(connector.attempts(&flaky), 1);
}

// --------------------------------------------------------------- dispatcher

#[tokio::test]
async fn query_returns_rows_with_execution_info() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = connected_client(&fixture).await;

    let result = client
        .query(&Statement::new("SELECT a FROM t"), &ExecutionOptions::default())
        .await
        .unwrap();

    assert!(result.rows().is_some());
    let info = result.execution_info();
    assert_eq!(info.hosts_tried(), std::slice::from_ref(&fixture.host));
    assert_eq!(info.retry_count(), 0);
    assert_eq!(info.consistency(), Consistency::LocalQuorum);
    assert_eq!(info.statement(), Some("SELECT a FROM t"));
}

#[tokio::test]
async fn query_fails_over_to_the_next_host_on_connection_error() {
    setup_tracing();
    let first = test_host(1);
    let second = test_host(2);
    let broken = Arc::new(MockConnection::failing());
    let healthy = Arc::new(MockConnection::new());
    let registry = MockRegistry::with_hosts(vec![first.clone(), second.clone()]);
    let connector = Arc::new(MockConnector::serving(HashMap::from([
        (first.clone(), vec![Arc::clone(&broken)]),
        (second.clone(), vec![Arc::clone(&healthy)]),
    ])));
    let client = builder(registry, connector)
        .load_balancing_policy(Arc::new(SequencePolicy::new(vec![
            first.clone(),
            second.clone(),
        ])))
        .build();
    client.connect().await.unwrap();

    let result = client
        .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
        .await
        .unwrap();

    assert!(result.rows().is_some());
    assert_eq!(
        result.execution_info().hosts_tried(),
        &[first.clone(), second.clone()]
    );
    assert_eq!(broken.request_count("QUERY"), 1);
    assert_eq!(healthy.request_count("QUERY"), 1);
}

#[tokio::test]
async fn exhausted_plan_fails_with_the_error_of_every_host() {
    setup_tracing();
    let first = test_host(1);
    let second = test_host(2);
    let c1 = Arc::new(MockConnection::failing());
    let c2 = Arc::new(MockConnection::failing());
    let registry = MockRegistry::with_hosts(vec![first.clone(), second.clone()]);
    let connector = Arc::new(MockConnector::serving(HashMap::from([
        (first.clone(), vec![Arc::clone(&c1)]),
        (second.clone(), vec![Arc::clone(&c2)]),
    ])));
    let client = builder(registry, connector)
        .load_balancing_policy(Arc::new(SequencePolicy::new(vec![
            first.clone(),
            second.clone(),
        ])))
        .build();
    client.connect().await.unwrap();

    let error = client
        .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
        .await
        .unwrap_err();

    match error {
        ExecutionError::NoHostsAvailable { errors } => {
            assert_eq!(errors.len(), 2);
            assert_matches!(errors[&first], RequestAttemptError::Connection(_));
            assert_matches!(errors[&second], RequestAttemptError::Connection(_));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // Exactly one attempt per host in the plan.
    assert_eq!(c1.request_count("QUERY"), 1);
    assert_eq!(c2.request_count("QUERY"), 1);
}

#[tokio::test]
async fn unavailable_retries_on_the_same_host_at_the_policy_consistency() {
    setup_tracing();
    let mut first_attempt = true;
    let fixture = single_host(MockConnection::with_responder(move |request| {
        if matches!(request, Request::Query(_)) && first_attempt {
            first_attempt = false;
            Ok(error_response(
                DbError::Unavailable {
                    consistency: Consistency::Quorum,
                    required: 2,
                    alive: 1,
                },
                "not enough replicas",
            ))
        } else {
            Ok(rows_response())
        }
    }));
    let retry = Arc::new(ScriptedRetryPolicy::with_decisions(vec![
        RetryDecision::Retry(Consistency::One),
    ]));
    let client = builder(fixture.registry.clone(), fixture.connector.clone())
        .retry_policy(Arc::clone(&retry) as Arc<dyn RetryPolicy>)
        .build();
    client.connect().await.unwrap();

    let options = ExecutionOptions {
        consistency: Some(Consistency::Quorum),
        ..ExecutionOptions::default()
    };
    let result = client
        .query(&Statement::new("SELECT 1"), &options)
        .await
        .unwrap();

    // The policy saw the detail fields and the pre-retry counter.
    assert_eq!(
        retry.calls(),
        vec![RetryCall::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
            retries: 0,
        }]
    );
    // The second frame went to the same connection with rewritten
    // consistency and retry counter.
    let queries: Vec<_> = fixture
        .connection
        .sent_requests()
        .into_iter()
        .filter_map(|request| match request {
            Request::Query(query) => Some(query),
            _ => None,
        })
        .collect();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].parameters.consistency, Consistency::Quorum);
    assert_eq!(queries[0].parameters.retries, 0);
    assert_eq!(queries[1].parameters.consistency, Consistency::One);
    assert_eq!(queries[1].parameters.retries, 1);

    let info = result.execution_info();
    assert_eq!(info.retry_count(), 1);
    assert_eq!(info.consistency(), Consistency::One);
    assert_eq!(info.hosts_tried(), std::slice::from_ref(&fixture.host));
}

#[tokio::test]
async fn reraise_decision_surfaces_the_server_error() {
    setup_tracing();
    let fixture = single_host(MockConnection::erroring(
        DbError::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 0,
        },
        "cluster mostly dead",
    ));
    let retry = Arc::new(ScriptedRetryPolicy::with_decisions(vec![
        RetryDecision::Reraise,
    ]));
    let client = builder(fixture.registry.clone(), fixture.connector.clone())
        .retry_policy(Arc::clone(&retry) as Arc<dyn RetryPolicy>)
        .build();
    client.connect().await.unwrap();

    let error = client
        .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_matches!(
        error,
        ExecutionError::DbError(DbError::Unavailable { .. }, _)
    );
}

#[tokio::test]
async fn ignore_decision_resolves_with_an_empty_result() {
    setup_tracing();
    let fixture = single_host(MockConnection::erroring(
        DbError::WriteTimeout {
            consistency: Consistency::Two,
            received: 1,
            required: 2,
            write_type: WriteType::Simple,
        },
        "write timed out",
    ));
    let retry = Arc::new(ScriptedRetryPolicy::with_decisions(vec![
        RetryDecision::Ignore,
    ]));
    let client = builder(fixture.registry.clone(), fixture.connector.clone())
        .retry_policy(Arc::clone(&retry) as Arc<dyn RetryPolicy>)
        .build();
    client.connect().await.unwrap();

    let result = client
        .query(&Statement::new("INSERT"), &ExecutionOptions::default())
        .await
        .unwrap();
    assert!(result.rows().is_none());
    assert_eq!(result.execution_info().retry_count(), 0);
}

#[tokio::test]
async fn non_recoverable_server_errors_bypass_the_retry_policy() {
    setup_tracing();
    let fixture = single_host(MockConnection::erroring(DbError::SyntaxError, "bad cql"));
    let retry = Arc::new(ScriptedRetryPolicy::with_decisions(vec![
        RetryDecision::Retry(Consistency::One),
    ]));
    let client = builder(fixture.registry.clone(), fixture.connector.clone())
        .retry_policy(Arc::clone(&retry) as Arc<dyn RetryPolicy>)
        .build();
    client.connect().await.unwrap();

    let error = client
        .query(&Statement::new("SELEC"), &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_matches!(error, ExecutionError::DbError(DbError::SyntaxError, _));
    assert!(retry.calls().is_empty());
}

// ------------------------------------------------- prepared statements

#[tokio::test]
async fn prepare_caches_the_id_for_the_chosen_host() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = connected_client(&fixture).await;

    let prepared = client
        .prepare("SELECT a FROM t", &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(prepared.cql(), "SELECT a FROM t");

    client
        .execute(&prepared, &ExecutionOptions::default(), None)
        .await
        .unwrap();

    // The execute reused the cached id instead of re-preparing.
    assert_eq!(fixture.connection.request_count("PREPARE"), 1);
    let execute_ids: Vec<_> = fixture
        .connection
        .sent_requests()
        .into_iter()
        .filter_map(|request| match request {
            Request::Execute(execute) => Some(execute.id),
            _ => None,
        })
        .collect();
    assert_eq!(execute_ids, vec![prepared_id("SELECT a FROM t")]);
}

#[tokio::test]
async fn concurrent_executes_share_a_single_prepare() {
    setup_tracing();
    let fixture = single_host(MockConnection::gated());
    let client = Arc::new(connected_client(&fixture).await);
    let prepared = PreparedStatement::new(
        "SELECT a FROM t WHERE k = ?".to_string(),
        ResultMetadata { column_count: 1 },
    );

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let client = Arc::clone(&client);
            let prepared = prepared.clone();
            tokio::spawn(async move {
                client
                    .execute(&prepared, &ExecutionOptions::default(), None)
                    .await
            })
        })
        .collect();
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    fixture.connection.release();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(fixture.connection.request_count("PREPARE"), 1);
    assert_eq!(fixture.connection.request_count("EXECUTE"), 10);
    // Every execute saw the one id the shared prepare produced.
    let expected = prepared_id("SELECT a FROM t WHERE k = ?");
    for request in fixture.connection.sent_requests() {
        if let Request::Execute(execute) = request {
            assert_eq!(execute.id, expected);
        }
    }
}

#[tokio::test]
async fn prepare_failure_fails_the_execute_without_advancing_the_plan() {
    setup_tracing();
    let first = test_host(1);
    let second = test_host(2);
    let failing_prepare = Arc::new(MockConnection::with_responder(|request| {
        Ok(match request {
            Request::Prepare(_) => error_response(DbError::SyntaxError, "bad cql"),
            _ => rows_response(),
        })
    }));
    let bystander = Arc::new(MockConnection::new());
    let registry = MockRegistry::with_hosts(vec![first.clone(), second.clone()]);
    let connector = Arc::new(MockConnector::serving(HashMap::from([
        (first.clone(), vec![Arc::clone(&failing_prepare)]),
        (second.clone(), vec![Arc::clone(&bystander)]),
    ])));
    let client = builder(registry, connector)
        .load_balancing_policy(Arc::new(SequencePolicy::new(vec![
            first.clone(),
            second.clone(),
        ])))
        .build();
    client.connect().await.unwrap();
    let prepared = PreparedStatement::new("SELEC".to_string(), ResultMetadata::default());

    let error = client
        .execute(&prepared, &ExecutionOptions::default(), None)
        .await
        .unwrap_err();
    assert_matches!(
        error,
        ExecutionError::Prepare(RequestAttemptError::Db(DbError::SyntaxError, _))
    );
    assert!(bystander.sent_requests().is_empty());

    // The failed prepare was not cached; the next execute prepares again.
    let _ = client
        .execute(&prepared, &ExecutionOptions::default(), None)
        .await
        .unwrap_err();
    assert_eq!(failing_prepare.request_count("PREPARE"), 2);
}

#[tokio::test]
async fn batch_prepares_missing_ids_and_splices_them_in_order() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = connected_client(&fixture).await;
    let known = PreparedStatement::new("UPDATE t SET b = ?".to_string(), ResultMetadata::default());
    let unknown =
        PreparedStatement::new("UPDATE t SET a = ?".to_string(), ResultMetadata::default());

    // Warm the id of one statement on the host.
    client
        .execute(&known, &ExecutionOptions::default(), None)
        .await
        .unwrap();
    assert_eq!(fixture.connection.request_count("PREPARE"), 1);

    let mut batch = Batch::new(BatchType::Logged);
    batch.append_statement(Statement::new("INSERT INTO t (a) VALUES (1)"));
    batch.append_statement(unknown.clone());
    batch.append_statement(Statement::new("INSERT INTO t (b) VALUES (2)"));
    batch.append_statement(known.clone());
    let result = client.batch(&batch, &ExecutionOptions::default()).await.unwrap();
    assert!(result.rows().is_none());

    // Only the unknown statement was prepared for the batch.
    assert_eq!(fixture.connection.request_count("PREPARE"), 2);
    let batch_frame = fixture
        .connection
        .sent_requests()
        .into_iter()
        .find_map(|request| match request {
            Request::Batch(batch) => Some(batch),
            _ => None,
        })
        .unwrap();
    assert_eq!(batch_frame.entries.len(), 4);
    assert_matches!(
        &batch_frame.entries[0],
        BatchEntry::Query { cql, .. } if cql == "INSERT INTO t (a) VALUES (1)"
    );
    assert_matches!(
        &batch_frame.entries[1],
        BatchEntry::Prepared { id, .. } if *id == prepared_id("UPDATE t SET a = ?")
    );
    assert_matches!(
        &batch_frame.entries[2],
        BatchEntry::Query { cql, .. } if cql == "INSERT INTO t (b) VALUES (2)"
    );
    assert_matches!(
        &batch_frame.entries[3],
        BatchEntry::Prepared { id, .. } if *id == prepared_id("UPDATE t SET b = ?")
    );
}

#[tokio::test]
async fn execute_materializes_raw_rows_with_the_prepared_metadata() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = connected_client(&fixture).await;
    let prepared = PreparedStatement::new(
        "SELECT a FROM t".to_string(),
        ResultMetadata { column_count: 7 },
    );

    let result = client
        .execute(&prepared, &ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(result.rows().unwrap().metadata().column_count, 7);
    assert_eq!(result.execution_info().statement(), Some("SELECT a FROM t"));
}

// ------------------------------------------------------- keyspace handling

#[tokio::test]
async fn concurrent_queries_coalesce_onto_one_keyspace_switch() {
    setup_tracing();
    let fixture = single_host(MockConnection::gated());
    let client = Arc::new(connected_client(&fixture).await);
    let options = ExecutionOptions {
        keyspace: Some("app".to_string()),
        ..ExecutionOptions::default()
    };

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let client = Arc::clone(&client);
            let options = options.clone();
            tokio::spawn(
                async move { client.query(&Statement::new("SELECT 1"), &options).await },
            )
        })
        .collect();
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    fixture.connection.release();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let use_count = fixture
        .connection
        .sent_requests()
        .iter()
        .filter(|request| matches!(request, Request::Query(query) if query.cql == "USE app"))
        .count();
    assert_eq!(use_count, 1);
    // The SET_KEYSPACE response became the session keyspace.
    assert_eq!(client.keyspace(), Some("app".to_string()));
}

#[tokio::test]
async fn keyspace_switch_failure_fails_without_advancing_the_plan() {
    setup_tracing();
    let first = test_host(1);
    let second = test_host(2);
    let refusing = Arc::new(MockConnection::with_responder(|request| {
        Ok(match request {
            Request::Query(query) if query.cql.starts_with("USE ") => {
                error_response(DbError::Invalid, "unknown keyspace")
            }
            _ => rows_response(),
        })
    }));
    let bystander = Arc::new(MockConnection::new());
    let registry = MockRegistry::with_hosts(vec![first.clone(), second.clone()]);
    let connector = Arc::new(MockConnector::serving(HashMap::from([
        (first.clone(), vec![Arc::clone(&refusing)]),
        (second.clone(), vec![Arc::clone(&bystander)]),
    ])));
    let client = builder(registry, connector)
        .load_balancing_policy(Arc::new(SequencePolicy::new(vec![
            first.clone(),
            second.clone(),
        ])))
        .build();
    client.connect().await.unwrap();

    let options = ExecutionOptions {
        keyspace: Some("nope".to_string()),
        ..ExecutionOptions::default()
    };
    let error = client
        .query(&Statement::new("SELECT 1"), &options)
        .await
        .unwrap_err();

    match error {
        ExecutionError::UseKeyspace { keyspace, error } => {
            assert_eq!(keyspace, "nope");
            assert_matches!(error, RequestAttemptError::Db(DbError::Invalid, _));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(bystander.sent_requests().is_empty());
}

#[tokio::test]
async fn set_keyspace_response_becomes_the_default_for_later_requests() {
    setup_tracing();
    let fixture = single_host(MockConnection::new());
    let client = connected_client(&fixture).await;

    let result = client
        .query(&Statement::new("USE app"), &ExecutionOptions::default())
        .await
        .unwrap();
    assert!(result.rows().is_none());
    assert_eq!(client.keyspace(), Some("app".to_string()));

    // The follow-up targets the session keyspace; the connection is already
    // there, so no extra USE frame goes out.
    let result = client
        .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.execution_info().keyspace(), Some("app"));
    let use_count = fixture
        .connection
        .sent_requests()
        .iter()
        .filter(|request| matches!(request, Request::Query(query) if query.cql == "USE app"))
        .count();
    assert_eq!(use_count, 1);
}

// ----------------------------------------------------------- topology churn

#[tokio::test]
async fn host_down_stops_dispatch_until_the_next_host_up() {
    setup_tracing();
    let host = test_host(1);
    let registry = MockRegistry::with_hosts(vec![host.clone()]);
    let created: Arc<Mutex<Vec<Arc<MockConnection>>>> = Arc::new(Mutex::new(Vec::new()));
    let connector = Arc::new(MockConnector::with({
        let created = Arc::clone(&created);
        move |_, _| {
            let connection = Arc::new(MockConnection::new());
            created.lock().unwrap().push(Arc::clone(&connection));
            Ok(vec![connection as Arc<dyn Connection>])
        }
    }));
    let client = builder(registry.clone(), Arc::clone(&connector)).build();
    client.connect().await.unwrap();
    client
        .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
        .await
        .unwrap();

    registry.fire_host_down(&host).await;
    assert!(created.lock().unwrap()[0].is_closed());
    let error = client
        .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_matches!(error, ExecutionError::NoHostsAvailable { .. });

    registry.fire_host_up(&host);
    let mut revived = false;
    for _ in 0..200 {
        tokio::task::yield_now().await;
        if client
            .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
            .await
            .is_ok()
        {
            revived = true;
            break;
        }
    }
    assert!(revived);
    assert_eq!(connector.attempts(&host), 2);
}

#[tokio::test]
async fn host_down_mid_flight_surfaces_as_connection_error_and_fails_over() {
    setup_tracing();
    let first = test_host(1);
    let second = test_host(2);
    let dying = Arc::new(MockConnection::gated());
    let healthy = Arc::new(MockConnection::new());
    let registry = MockRegistry::with_hosts(vec![first.clone(), second.clone()]);
    let connector = Arc::new(MockConnector::serving(HashMap::from([
        (first.clone(), vec![Arc::clone(&dying)]),
        (second.clone(), vec![Arc::clone(&healthy)]),
    ])));
    let client = Arc::new(
        builder(registry.clone(), connector)
            .load_balancing_policy(Arc::new(SequencePolicy::new(vec![
                first.clone(),
                second.clone(),
            ])))
            .build(),
    );
    client.connect().await.unwrap();

    let request = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .query(&Statement::new("SELECT 1"), &ExecutionOptions::default())
                .await
        })
    };
    // Let the request go in flight on the first host.
    for _ in 0..50 {
        if dying.request_count("QUERY") > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(dying.request_count("QUERY"), 1);

    registry.fire_host_down(&first).await;
    dying.release();

    let result = request.await.unwrap().unwrap();
    assert!(result.rows().is_some());
    assert_eq!(
        result.execution_info().hosts_tried(),
        &[first.clone(), second.clone()]
    );
}
