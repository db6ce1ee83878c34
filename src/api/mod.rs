//! Public surface of the realtime database client.

pub mod database;
pub mod listener;
pub mod on_disconnect;
mod push_id;
pub mod query;
pub mod reference;
pub mod server_value;
pub mod snapshot;

pub use database::{Database, DatabaseConfig, PersistenceConfig, FIREBASE_CONFIG_ENV};
pub use listener::{ChildEvent, ChildEventType, ListenerRegistration};
pub use on_disconnect::OnDisconnect;
pub use query::{
    end_at, end_at_with_key, end_before, end_before_with_key, equal_to, equal_to_with_key,
    limit_to_first, limit_to_last, order_by_child, order_by_key, order_by_priority,
    order_by_value, query, start_after, start_after_with_key, start_at, start_at_with_key,
    DatabaseQuery, QueryConstraint,
};
pub use reference::DatabaseReference;
pub use server_value::{increment, server_timestamp};
pub use snapshot::DataSnapshot;
