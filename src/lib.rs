//! Realtime Database sync engine for server-side (admin) processes.
//!
//! A client that observes and mutates a hierarchical JSON tree hosted by a
//! Firebase Realtime Database, with live change notifications, local write
//! consistency, optional on-disk persistence, and authenticated connections.
//!
//! The heart of the crate is the sync engine: a persistent WebSocket channel
//! ([`realtime`]), an in-memory sync tree merging server snapshots with
//! pending local writes ([`core`]), an ordered write queue with revert
//! semantics, an optimistic transaction runner, and a run-loop/event-target
//! pair that keeps all engine state single-writer.
//!
//! ```no_run
//! use firebase_admin_database::{Database, DatabaseConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> firebase_admin_database::DatabaseResult<()> {
//! let database = Database::new(DatabaseConfig::new(
//!     "https://demo-project.firebaseio.com",
//! ))?;
//!
//! let users = database.reference("users")?;
//! let _watch = users.on_value(|snapshot| {
//!     if let Ok(snapshot) = snapshot {
//!         println!("users = {}", snapshot.value());
//!     }
//! })?;
//!
//! users.child("alice")?.set(json!({ "name": "Alice" })).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod core;
pub mod error;
pub mod logger;
pub mod persistence;
pub mod realtime;
pub(crate) mod runtime;

#[doc(inline)]
pub use api::{
    end_at, end_at_with_key, end_before, end_before_with_key, equal_to, equal_to_with_key,
    increment, limit_to_first, limit_to_last, order_by_child, order_by_key, order_by_priority,
    order_by_value, query, server_timestamp, start_after, start_after_with_key, start_at,
    start_at_with_key, ChildEvent, ChildEventType, Database, DatabaseConfig, DatabaseQuery,
    DataSnapshot, DatabaseReference, ListenerRegistration, OnDisconnect, PersistenceConfig,
    QueryConstraint,
};

#[doc(inline)]
pub use auth::{EmulatorTokenProvider, NoopTokenProvider, StaticTokenProvider, TokenProvider};

#[doc(inline)]
pub use crate::core::transaction::{TransactionResult, TransactionUpdate};

#[doc(inline)]
pub use error::{DatabaseError, DatabaseErrorCode, DatabaseResult};

#[doc(inline)]
pub use logger::{set_global_log_level, LogLevel, Logger};

#[doc(inline)]
pub use realtime::{ConnectionTunables, RetryConfig};
