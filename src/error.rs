use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Machine-readable error kinds surfaced by the Realtime Database client.
///
/// Mirrors the error code strings of the JS SDK's `packages/database` module
/// so downstream matching stays stable across ports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatabaseErrorCode {
    InvalidArgument,
    Internal,
    PermissionDenied,
    Network,
    Disconnected,
    ExpiredToken,
    InvalidToken,
    DataStale,
    WriteCanceled,
    OverriddenBySet,
    MaxRetries,
    Unavailable,
}

impl DatabaseErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseErrorCode::InvalidArgument => "database/invalid-argument",
            DatabaseErrorCode::Internal => "database/internal",
            DatabaseErrorCode::PermissionDenied => "database/permission-denied",
            DatabaseErrorCode::Network => "database/network-error",
            DatabaseErrorCode::Disconnected => "database/disconnected",
            DatabaseErrorCode::ExpiredToken => "database/expired-token",
            DatabaseErrorCode::InvalidToken => "database/invalid-token",
            DatabaseErrorCode::DataStale => "database/data-stale",
            DatabaseErrorCode::WriteCanceled => "database/write-canceled",
            DatabaseErrorCode::OverriddenBySet => "database/overridden-by-set",
            DatabaseErrorCode::MaxRetries => "database/max-retries",
            DatabaseErrorCode::Unavailable => "database/unavailable",
        }
    }

    /// Maps a wire status string (the `"s"` field of a response) to a code.
    /// Unrecognized statuses are internal errors carrying the raw status.
    pub(crate) fn from_wire_status(status: &str) -> Self {
        match status {
            "permission_denied" => DatabaseErrorCode::PermissionDenied,
            "expired_token" => DatabaseErrorCode::ExpiredToken,
            "invalid_token" => DatabaseErrorCode::InvalidToken,
            "datastale" => DatabaseErrorCode::DataStale,
            "disconnect" => DatabaseErrorCode::Disconnected,
            "unavailable" => DatabaseErrorCode::Unavailable,
            _ => DatabaseErrorCode::Internal,
        }
    }

    /// Whether an auth failure with this code is worth retrying with a fresh
    /// token, as opposed to tearing the listen down.
    pub(crate) fn is_retriable_auth_failure(&self) -> bool {
        matches!(
            self,
            DatabaseErrorCode::ExpiredToken | DatabaseErrorCode::Network
        )
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseError {
    pub code: DatabaseErrorCode,
    message: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl DatabaseError {
    pub fn new(code: DatabaseErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_wire_status(status: &str, context: &str) -> Self {
        let code = DatabaseErrorCode::from_wire_status(status);
        DatabaseError::new(code, format!("{context}: {status}"))
    }
}

impl Display for DatabaseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub fn invalid_argument(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Internal, message)
}

pub fn permission_denied(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::PermissionDenied, message)
}

pub fn network_error(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Network, message)
}

pub fn disconnected(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Disconnected, message)
}

pub fn write_canceled(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::WriteCanceled, message)
}

pub fn overridden_by_set(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::OverriddenBySet, message)
}

pub fn max_retries(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::MaxRetries, message)
}

pub fn unavailable(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Unavailable, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_maps_to_typed_codes() {
        assert_eq!(
            DatabaseErrorCode::from_wire_status("permission_denied"),
            DatabaseErrorCode::PermissionDenied
        );
        assert_eq!(
            DatabaseErrorCode::from_wire_status("datastale"),
            DatabaseErrorCode::DataStale
        );
        assert_eq!(
            DatabaseErrorCode::from_wire_status("everything-is-fine-probably"),
            DatabaseErrorCode::Internal
        );
    }

    #[test]
    fn display_includes_code_string() {
        let err = permission_denied("listen at /secrets denied");
        assert_eq!(
            err.to_string(),
            "listen at /secrets denied (database/permission-denied)"
        );
    }
}
