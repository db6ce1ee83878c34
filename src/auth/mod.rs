//! Credential boundary of the sync engine.
//!
//! The engine never loads service accounts or mints OAuth tokens itself; the
//! embedding process hands it a [`TokenProvider`] and the connection asks for
//! a token right before the auth handshake and again whenever the server
//! reports the current one expired.

use std::fmt;
use std::sync::Mutex;

use crate::error::{internal_error, DatabaseResult};

/// Async source of bearer tokens for the realtime connection.
///
/// Implementations must be cheap to call repeatedly; the connection caches
/// nothing and re-fetches on every (re)connect and on `expired_token`.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the current token, or `None` for unauthenticated access.
    ///
    /// `force_refresh` is set when the server rejected the previous token, so
    /// providers backed by cached credentials should mint a fresh one.
    async fn access_token(&self, force_refresh: bool) -> DatabaseResult<Option<String>>;
}

/// Provider for databases with open rules or local testing: never authenticates.
#[derive(Debug, Default)]
pub struct NoopTokenProvider;

#[async_trait::async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn access_token(&self, _force_refresh: bool) -> DatabaseResult<Option<String>> {
        Ok(None)
    }
}

/// Provider wrapping a pre-issued token (tests, short-lived tools).
pub struct StaticTokenProvider {
    token: Mutex<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(token.into()),
        }
    }

    /// Replaces the stored token; picked up on the next connection handshake.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock().unwrap() = token.into();
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token material stays out of debug output.
        f.debug_struct("StaticTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self, _force_refresh: bool) -> DatabaseResult<Option<String>> {
        let token = self.token.lock().unwrap().clone();
        if token.is_empty() {
            return Err(internal_error("static token provider holds an empty token"));
        }
        Ok(Some(token))
    }
}

/// The mock bearer token the emulator accepts as full-access credentials.
pub const EMULATOR_OWNER_TOKEN: &str = "owner";

/// Provider used automatically when `FIREBASE_DATABASE_EMULATOR_HOST` is set
/// and no explicit credential was configured.
#[derive(Debug, Default)]
pub struct EmulatorTokenProvider;

#[async_trait::async_trait]
impl TokenProvider for EmulatorTokenProvider {
    async fn access_token(&self, _force_refresh: bool) -> DatabaseResult<Option<String>> {
        Ok(Some(EMULATOR_OWNER_TOKEN.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_returns_latest_token() {
        let provider = StaticTokenProvider::new("token-1");
        assert_eq!(
            provider.access_token(false).await.unwrap(),
            Some("token-1".to_string())
        );

        provider.set_token("token-2");
        assert_eq!(
            provider.access_token(true).await.unwrap(),
            Some("token-2".to_string())
        );
    }

    #[tokio::test]
    async fn emulator_provider_uses_owner_token() {
        let provider = EmulatorTokenProvider;
        assert_eq!(
            provider.access_token(false).await.unwrap(),
            Some("owner".to_string())
        );
    }
}
