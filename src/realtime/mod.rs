//! The realtime wire layer: framing, sessions, and the persistent
//! connection the sync engine drives.

pub(crate) mod connection;
pub mod frame;
pub mod host_info;
pub mod persistent_connection;
pub mod protocol;
pub mod retry;
pub(crate) mod websocket;

pub use host_info::{HostInfo, EMULATOR_HOST_ENV};
pub use persistent_connection::{
    ConnectionDelegate, ConnectionTunables, PersistentConnection, PersistentConnectionHandle,
    RangeMerge,
};
pub use retry::RetryConfig;
