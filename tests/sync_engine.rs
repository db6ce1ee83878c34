//! End-to-end scenarios against the in-process wire server.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_until, WireServer};
use firebase_admin_database::{
    Database, DatabaseConfig, DatabaseErrorCode, DatabaseResult, TransactionUpdate,
};
use serde_json::{json, Map, Value};

fn client(server: &WireServer) -> Database {
    Database::new(DatabaseConfig::new(server.url())).expect("build database")
}

type ValueLog = Arc<Mutex<Vec<DatabaseResult<Value>>>>;

fn value_listener(
    reference: &firebase_admin_database::DatabaseReference,
) -> (ValueLog, firebase_admin_database::ListenerRegistration) {
    let log: ValueLog = Arc::new(Mutex::new(Vec::new()));
    let captured = log.clone();
    let registration = reference
        .on_value(move |snapshot| {
            captured
                .lock()
                .unwrap()
                .push(snapshot.map(|snapshot| snapshot.value()));
        })
        .expect("register listener");
    (log, registration)
}

fn ok_values(log: &ValueLog) -> Vec<Value> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|entry| entry.as_ref().ok().cloned())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_set_and_listen() {
    let server = WireServer::start().await;
    let database = client(&server);
    let alice = database.reference("users/alice").unwrap();

    let (log, _registration) = value_listener(&alice);
    assert!(
        wait_until(Duration::from_secs(5), || !ok_values(&log).is_empty()).await,
        "initial value event never arrived"
    );
    assert_eq!(ok_values(&log), vec![json!(null)]);

    alice
        .set(json!({ "name": "Alice", "age": 30 }))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || ok_values(&log).len() >= 2).await,
        "updated value event never arrived"
    );
    assert_eq!(
        ok_values(&log),
        vec![json!(null), json!({ "name": "Alice", "age": 30 })]
    );
    assert_eq!(server.data("/users/alice"), json!({ "name": "Alice", "age": 30 }));
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_under_limit_query() {
    let server = WireServer::start().await;
    server.set_data(
        "/room",
        json!({ "a": { "score": 1 }, "b": { "score": 2 }, "c": { "score": 3 } }),
    );
    let database = client(&server);
    let room = database.reference("room").unwrap();

    let query = room
        .query()
        .order_by_child("score")
        .unwrap()
        .limit_to_last(2)
        .unwrap();

    let log: ValueLog = Arc::new(Mutex::new(Vec::new()));
    let captured = log.clone();
    let _registration = query
        .on_value(move |snapshot| {
            captured
                .lock()
                .unwrap()
                .push(snapshot.map(|snapshot| snapshot.value()));
        })
        .unwrap();

    let removed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let captured_removed = removed.clone();
    let _removed_registration = query
        .on_child_removed(move |event| {
            if let Ok(event) = event {
                if let Some(key) = event.snapshot.key() {
                    captured_removed.lock().unwrap().push(key.to_string());
                }
            }
        })
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !ok_values(&log).is_empty()).await,
        "window never loaded"
    );
    assert_eq!(
        ok_values(&log)[0],
        json!({ "b": { "score": 2 }, "c": { "score": 3 } })
    );

    let mut updates = Map::new();
    updates.insert("a/score".to_string(), json!(5));
    updates.insert("b/score".to_string(), json!(6));
    room.update(updates).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            ok_values(&log)
                .last()
                .map(|value| *value == json!({ "a": { "score": 5 }, "b": { "score": 6 } }))
                .unwrap_or(false)
        })
        .await,
        "window never converged to the merged state: {:?}",
        ok_values(&log)
    );
    assert!(
        removed.lock().unwrap().contains(&"c".to_string()),
        "c was displaced from the window and must raise child_removed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_writes_replay_in_order_on_reconnect() {
    let server = WireServer::start().await;
    let database = client(&server);
    database.go_offline().unwrap();

    let x = database.reference("x").unwrap();
    let (log, _registration) = value_listener(&x);

    let first = x.set(json!(1));
    let second = x.set(json!(2));
    let writes = tokio::spawn(async move {
        let first = first.await;
        let second = second.await;
        (first, second)
    });

    assert!(
        wait_until(Duration::from_secs(5), || ok_values(&log) == vec![json!(1), json!(2)]).await,
        "local events out of order: {:?}",
        ok_values(&log)
    );

    database.go_online().unwrap();
    let (first, second) = writes.await.unwrap();
    first.unwrap();
    second.unwrap();

    let puts: Vec<Value> = server
        .put_log()
        .into_iter()
        .filter(|(path, _)| path == "/x")
        .map(|(_, value)| value)
        .collect();
    assert_eq!(puts, vec![json!(1), json!(2)]);
    assert_eq!(server.data("/x"), json!(2));

    // Acks must not re-raise events for unchanged values.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ok_values(&log), vec![json!(1), json!(2)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn purge_outstanding_writes_cancels_and_reverts() {
    let server = WireServer::start().await;
    let database = client(&server);
    database.go_offline().unwrap();

    let x = database.reference("x").unwrap();
    let y = database.reference("y").unwrap();
    let (log, _registration) = value_listener(&x);

    let outcomes: Arc<Mutex<Vec<DatabaseResult<()>>>> = Arc::new(Mutex::new(Vec::new()));
    // The writes enqueue at call time, in this order.
    for write in [x.set(json!(1)), y.set(json!(2))] {
        let captured = outcomes.clone();
        tokio::spawn(async move {
            let result = write.await;
            captured.lock().unwrap().push(result);
        });
    }

    assert!(
        wait_until(Duration::from_secs(5), || ok_values(&log) == vec![json!(1)]).await,
        "optimistic write never surfaced"
    );

    database.purge_outstanding_writes().unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || outcomes.lock().unwrap().len() == 2).await,
        "write completions never fired"
    );
    for outcome in outcomes.lock().unwrap().iter() {
        let err = outcome.as_ref().expect_err("purged writes must cancel");
        assert_eq!(err.code, DatabaseErrorCode::WriteCanceled);
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            ok_values(&log) == vec![json!(1), json!(null)]
        })
        .await,
        "purge must revert the visible value: {:?}",
        ok_values(&log)
    );
    // Nothing ever reached the server.
    assert!(server.put_log().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn competing_transactions_serialize_through_datastale() {
    let server = WireServer::start().await;
    server.set_data("/n", json!(10));

    let database_a = client(&server);
    let database_b = client(&server);
    let n_a = database_a.reference("n").unwrap();
    let n_b = database_b.reference("n").unwrap();

    // Warm both caches so the first updater run sees 10.
    let (log_a, _reg_a) = value_listener(&n_a);
    let (log_b, _reg_b) = value_listener(&n_b);
    assert!(wait_until(Duration::from_secs(5), || ok_values(&log_a) == vec![json!(10)]).await);
    assert!(wait_until(Duration::from_secs(5), || ok_values(&log_b) == vec![json!(10)]).await);

    let increment = |current: Value| {
        let base = current.as_i64().unwrap_or(0);
        TransactionUpdate::Set(json!(base + 1))
    };

    let task_a = tokio::spawn(async move { n_a.run_transaction(increment).await });
    let task_b = tokio::spawn(async move { n_b.run_transaction(increment).await });

    let result_a = task_a.await.unwrap().expect("transaction a");
    let result_b = task_b.await.unwrap().expect("transaction b");

    assert!(result_a.committed);
    assert!(result_b.committed);
    let mut snapshots = vec![result_a.snapshot, result_b.snapshot];
    snapshots.sort_by_key(|value| value.as_i64());
    assert_eq!(snapshots, vec![json!(11), json!(12)]);
    assert_eq!(server.data("/n"), json!(12));
}

#[tokio::test(flavor = "multi_thread")]
async fn aborted_transaction_leaves_state_unchanged() {
    let server = WireServer::start().await;
    server.set_data("/guarded", json!("keep"));
    let database = client(&server);
    let guarded = database.reference("guarded").unwrap();

    let (log, _registration) = value_listener(&guarded);
    assert!(wait_until(Duration::from_secs(5), || !ok_values(&log).is_empty()).await);

    let result = guarded
        .run_transaction(|_current| TransactionUpdate::Abort)
        .await
        .unwrap();
    assert!(!result.committed);
    assert_eq!(result.snapshot, json!("keep"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ok_values(&log), vec![json!("keep")]);
    assert_eq!(server.data("/guarded"), json!("keep"));
}

#[tokio::test(flavor = "multi_thread")]
async fn revoked_listen_cancels_exactly_once() {
    let server = WireServer::start().await;
    server.set_data("/private", json!({ "secret": 1 }));
    let database = client(&server);
    let private = database.reference("private").unwrap();

    let (log, _registration) = value_listener(&private);
    assert!(
        wait_until(Duration::from_secs(5), || !log.lock().unwrap().is_empty()).await,
        "initial value never arrived"
    );

    server.revoke_listen("/private");

    assert!(
        wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().iter().any(|entry| entry.is_err())
        })
        .await,
        "cancellation never arrived"
    );
    // Further server-side changes must not reach the cancelled listener.
    server.write("/private", json!({ "secret": 2 }));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let entries = log.lock().unwrap();
    let errors: Vec<_> = entries.iter().filter(|entry| entry.is_err()).collect();
    assert_eq!(errors.len(), 1, "exactly one cancel: {entries:?}");
    assert_eq!(
        errors[0].as_ref().unwrap_err().code,
        DatabaseErrorCode::PermissionDenied
    );
    assert!(!entries
        .iter()
        .any(|entry| matches!(entry, Ok(value) if *value == json!({ "secret": 2 }))));
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_listen_cancels_at_registration() {
    let server = WireServer::start().await;
    server.deny_listen("/secrets");
    let database = client(&server);
    let secrets = database.reference("secrets").unwrap();

    let (log, _registration) = value_listener(&secrets);

    assert!(
        wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().iter().any(|entry| entry.is_err())
        })
        .await,
        "denied listen never cancelled"
    );
    let entries = log.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].as_ref().unwrap_err().code,
        DatabaseErrorCode::PermissionDenied
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn listens_replay_after_reconnect() {
    let server = WireServer::start().await;
    server.set_data("/stable", json!("value"));
    let database = client(&server);
    let stable = database.reference("stable").unwrap();

    let (log, _registration) = value_listener(&stable);
    assert!(wait_until(Duration::from_secs(5), || !ok_values(&log).is_empty()).await);
    assert_eq!(server.listen_log(), vec!["/stable".to_string()]);

    server.drop_connections();

    assert!(
        wait_until(Duration::from_secs(10), || server.listen_log().len() >= 2).await,
        "listen was not replayed after reconnect"
    );
    assert_eq!(server.listen_log(), vec!["/stable".to_string(); 2]);

    // Same value re-delivered by the server must not re-fire the listener.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ok_values(&log), vec![json!("value")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_reverts_and_reports() {
    let server = WireServer::start().await;
    let database = client(&server);
    let guarded = database.reference("guarded").unwrap();

    let (log, _registration) = value_listener(&guarded);
    assert!(wait_until(Duration::from_secs(5), || !ok_values(&log).is_empty()).await);

    server.fail_next_put("permission_denied");
    let err = guarded.set(json!("nope")).await.expect_err("must reject");
    assert_eq!(err.code, DatabaseErrorCode::PermissionDenied);

    assert!(
        wait_until(Duration::from_secs(5), || {
            ok_values(&log) == vec![json!(null), json!("nope"), json!(null)]
        })
        .await,
        "revert events wrong: {:?}",
        ok_values(&log)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn one_shot_get_reads_through_and_falls_back() {
    let server = WireServer::start().await;
    server.set_data("/answer", json!(42));
    let database = client(&server);
    let answer = database.reference("answer").unwrap();

    // Online: read-through.
    assert_eq!(answer.get().await.unwrap(), json!(42));

    // Offline with a warm cache: served locally.
    let (log, _registration) = value_listener(&answer);
    assert!(wait_until(Duration::from_secs(5), || !ok_values(&log).is_empty()).await);
    database.go_offline().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(answer.get().await.unwrap(), json!(42));

    // Offline with no cache at all: a typed error.
    let cold = client(&server);
    cold.go_offline().unwrap();
    let err = cold
        .reference("nowhere")
        .unwrap()
        .get()
        .await
        .expect_err("cold offline get must fail");
    assert_eq!(err.code, DatabaseErrorCode::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn on_disconnect_writes_commit_on_socket_loss() {
    let server = WireServer::start().await;
    let database = client(&server);
    let status = database.reference("presence/worker-1").unwrap();

    status.set(json!("online")).await.unwrap();
    status.on_disconnect().set(json!("offline")).await.unwrap();

    // A second client watches the same path through its own connection.
    let watcher = client(&server);
    let watched = watcher.reference("presence/worker-1").unwrap();
    let (log, _registration) = value_listener(&watched);
    assert!(
        wait_until(Duration::from_secs(5), || {
            ok_values(&log).last() == Some(&json!("online"))
        })
        .await
    );

    database.go_offline().unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            ok_values(&log).last() == Some(&json!("offline"))
        })
        .await,
        "onDisconnect write never committed: {:?}",
        ok_values(&log)
    );
    assert_eq!(server.data("/presence/worker-1"), json!("offline"));
}

#[tokio::test(flavor = "multi_thread")]
async fn info_connected_tracks_connection_state() {
    let server = WireServer::start().await;
    let database = client(&server);

    let (info_log, _info_registration) = value_listener(&database.connected_ref());
    assert!(
        wait_until(Duration::from_secs(5), || !ok_values(&info_log).is_empty()).await,
        ".info/connected never fired"
    );
    assert_eq!(ok_values(&info_log)[0], json!(false));

    // Create interest so the connection opens.
    let any = database.reference("anything").unwrap();
    let (_log, _registration) = value_listener(&any);

    assert!(
        wait_until(Duration::from_secs(5), || {
            ok_values(&info_log).last() == Some(&json!(true))
        })
        .await,
        ".info/connected never went true: {:?}",
        ok_values(&info_log)
    );

    database.go_offline().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            ok_values(&info_log).last() == Some(&json!(false))
        })
        .await,
        ".info/connected never went false after goOffline"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn push_ids_are_ordered_and_land_under_parent() {
    let server = WireServer::start().await;
    let database = client(&server);
    let messages = database.reference("messages").unwrap();

    let first = messages.push_with_value(json!("one")).await.unwrap();
    let second = messages.push_with_value(json!("two")).await.unwrap();

    let first_key = first.key().unwrap().to_string();
    let second_key = second.key().unwrap().to_string();
    assert_eq!(first_key.len(), 20);
    assert!(first_key < second_key);

    assert_eq!(server.data(&format!("/messages/{first_key}")), json!("one"));
    assert_eq!(server.data(&format!("/messages/{second_key}")), json!("two"));
}
