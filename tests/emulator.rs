//! Emulator-mode behavior: `FIREBASE_DATABASE_EMULATOR_HOST` overrides the
//! configured host, disables TLS, and the mock `owner` token authenticates.
//!
//! This suite is its own binary because the environment variable is
//! process-global.

mod common;

use std::time::Duration;

use common::{wait_until, WireServer};
use firebase_admin_database::{Database, DatabaseConfig};
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn emulator_env_redirects_and_authenticates_as_owner() {
    let server = WireServer::start().await;
    let emulator_host = server
        .url()
        .trim_start_matches("http://")
        .split('?')
        .next()
        .unwrap()
        .to_string();
    std::env::set_var("FIREBASE_DATABASE_EMULATOR_HOST", &emulator_host);

    // The configured production URL is ignored in favor of the emulator.
    let database =
        Database::new(DatabaseConfig::new("https://demo-ns.firebaseio.com")).unwrap();
    let reference = database.reference("greetings").unwrap();
    reference.set(json!("hello emulator")).await.unwrap();

    assert_eq!(server.data("/greetings"), json!("hello emulator"));
    assert!(
        wait_until(Duration::from_secs(5), || {
            server.tokens() == vec!["owner".to_string()]
        })
        .await,
        "emulator connections must authenticate with the owner token: {:?}",
        server.tokens()
    );

    std::env::remove_var("FIREBASE_DATABASE_EMULATOR_HOST");
}
