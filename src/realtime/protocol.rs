//! Wire protocol constants for the realtime channel (protocol version 5).

pub const PROTOCOL_VERSION: &str = "5";

// Envelope types.
pub const ENVELOPE_DATA: &str = "d";
pub const ENVELOPE_CONTROL: &str = "c";

// Client → server request actions.
pub const ACTION_LISTEN: &str = "q";
pub const ACTION_UNLISTEN: &str = "n";
pub const ACTION_PUT: &str = "p";
pub const ACTION_MERGE: &str = "m";
pub const ACTION_ON_DISCONNECT_PUT: &str = "o";
pub const ACTION_ON_DISCONNECT_MERGE: &str = "om";
pub const ACTION_ON_DISCONNECT_CANCEL: &str = "oc";
pub const ACTION_AUTH: &str = "auth";
pub const ACTION_UNAUTH: &str = "unauth";
pub const ACTION_STATS: &str = "s";
pub const ACTION_GET: &str = "g";

// Server → client push actions.
pub const PUSH_DATA_UPDATE: &str = "d";
pub const PUSH_DATA_MERGE: &str = "m";
pub const PUSH_RANGE_MERGE: &str = "rm";
pub const PUSH_LISTEN_REVOKED: &str = "c";
pub const PUSH_AUTH_REVOKED: &str = "ac";
pub const PUSH_AUTH_PROVIDER_REVOKED: &str = "ap";
pub const PUSH_SECURITY_DEBUG: &str = "sd";

// Control frame types.
pub const CONTROL_HANDSHAKE: &str = "h";
pub const CONTROL_RESET: &str = "n";
pub const CONTROL_REDIRECT: &str = "r";
pub const CONTROL_SHUTDOWN: &str = "s";
pub const CONTROL_PING: &str = "o";

// Response statuses.
pub const STATUS_OK: &str = "ok";
pub const STATUS_PERMISSION_DENIED: &str = "permission_denied";
pub const STATUS_DATASTALE: &str = "datastale";
pub const STATUS_EXPIRED_TOKEN: &str = "expired_token";
pub const STATUS_INVALID_TOKEN: &str = "invalid_token";
