//! Restart behavior with on-disk persistence: the write log replays before
//! the connection opens, and complete cached queries serve offline reads.

mod common;

use std::time::Duration;

use common::{wait_until, WireServer};
use firebase_admin_database::{Database, DatabaseConfig, PersistenceConfig};
use serde_json::json;

fn persistent_client(server: &WireServer, dir: &std::path::Path) -> Database {
    Database::new(
        DatabaseConfig::new(server.url()).with_persistence(PersistenceConfig {
            root_dir: Some(dir.to_path_buf()),
            cache_size_bytes: 10 * 1024 * 1024,
        }),
    )
    .expect("build database")
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_writes_survive_restart_and_replay() {
    let server = WireServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    {
        let database = persistent_client(&server, dir.path());
        database.go_offline().unwrap();

        // Enqueued and persisted, but never acknowledged.
        let _pending = database.reference("x").unwrap().set(json!(42));
        tokio::time::sleep(Duration::from_millis(200)).await;
        database.shutdown().await.unwrap();
    }
    assert_eq!(server.data("/x"), json!(null));

    // A fresh process replays the write log before anything else.
    let _database = persistent_client(&server, dir.path());
    assert!(
        wait_until(Duration::from_secs(5), || server.data("/x") == json!(42)).await,
        "persisted write was not replayed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn complete_cached_queries_serve_offline_listeners() {
    let server = WireServer::start().await;
    server.set_data("/warm", json!("toasty"));
    let dir = tempfile::tempdir().unwrap();

    {
        let database = persistent_client(&server, dir.path());
        let warm = database.reference("warm").unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = seen.clone();
        let _registration = warm
            .on_value(move |snapshot| {
                if let Ok(snapshot) = snapshot {
                    captured.lock().unwrap().push(snapshot.value());
                }
            })
            .unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                seen.lock().unwrap().contains(&json!("toasty"))
            })
            .await,
            "cache was never warmed"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        database.shutdown().await.unwrap();
    }

    let database = persistent_client(&server, dir.path());
    database.go_offline().unwrap();
    let warm = database.reference("warm").unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let captured = seen.clone();
    let _registration = warm
        .on_value(move |snapshot| {
            if let Ok(snapshot) = snapshot {
                captured.lock().unwrap().push(snapshot.value());
            }
        })
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            seen.lock().unwrap().contains(&json!("toasty"))
        })
        .await,
        "offline listener was not served from the persisted cache: {:?}",
        seen.lock().unwrap()
    );
    assert_eq!(warm.get().await.unwrap(), json!("toasty"));
}
