//! Client entry point: explicit configuration, no process-wide registries.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::api::push_id::PushIdGenerator;
use crate::api::reference::DatabaseReference;
use crate::auth::{EmulatorTokenProvider, NoopTokenProvider, TokenProvider};
use crate::core::path::Path;
use crate::core::repo::{Repo, RepoConfig, RepoHandle};
use crate::error::{invalid_argument, unavailable, DatabaseResult};
use crate::logger::Logger;
use crate::persistence::{
    FileStorageEngine, InMemoryStorageEngine, LruCachePolicy, PersistenceManager, StorageEngine,
    DEFAULT_CACHE_SIZE_BYTES,
};
use crate::realtime::{ConnectionTunables, HostInfo};

/// The environment variable carrying app configuration (a JSON blob or the
/// path of a JSON file with a `databaseURL` field).
pub const FIREBASE_CONFIG_ENV: &str = "FIREBASE_CONFIG";

#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    /// Directory for the on-disk cache; `None` keeps the persisted state in
    /// memory only (useful for tests).
    pub root_dir: Option<PathBuf>,
    pub cache_size_bytes: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
        }
    }
}

/// Explicit client configuration, passed to [`Database::new`].
pub struct DatabaseConfig {
    database_url: String,
    token_provider: Option<Arc<dyn TokenProvider>>,
    tunables: ConnectionTunables,
    persistence: Option<PersistenceConfig>,
}

impl DatabaseConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            token_provider: None,
            tunables: ConnectionTunables::default(),
            persistence: None,
        }
    }

    /// Reads the database URL from `FIREBASE_CONFIG`.
    pub fn from_env() -> DatabaseResult<Self> {
        let raw = std::env::var(FIREBASE_CONFIG_ENV).map_err(|_| {
            invalid_argument(format!("{FIREBASE_CONFIG_ENV} is not set"))
        })?;
        let text = if raw.trim_start().starts_with('{') {
            raw
        } else {
            std::fs::read_to_string(&raw).map_err(|err| {
                invalid_argument(format!("cannot read {FIREBASE_CONFIG_ENV} file '{raw}': {err}"))
            })?
        };
        let config: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
            invalid_argument(format!("malformed {FIREBASE_CONFIG_ENV}: {err}"))
        })?;
        let url = config
            .get("databaseURL")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                invalid_argument(format!("{FIREBASE_CONFIG_ENV} has no databaseURL"))
            })?;
        Ok(Self::new(url))
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn with_tunables(mut self, tunables: ConnectionTunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Enables persistence. May be set at most once, before first use.
    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = Some(persistence);
        self
    }
}

struct DatabaseInner {
    repo: RepoHandle,
    registration_ids: Arc<AtomicU64>,
    push_ids: Mutex<PushIdGenerator>,
}

/// A handle to one realtime database instance. Cloning is cheap; all clones
/// share one sync engine and one connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Builds the client. Misconfiguration (bad URL, missing namespace,
    /// unusable persistence directory) fails here, synchronously; the
    /// network connection is only opened on first use.
    pub fn new(config: DatabaseConfig) -> DatabaseResult<Self> {
        let host_info = HostInfo::from_url(&config.database_url)?;
        let token_provider = config.token_provider.unwrap_or_else(|| {
            if host_info.is_emulator {
                Arc::new(EmulatorTokenProvider)
            } else {
                Arc::new(NoopTokenProvider)
            }
        });

        let persistence = match config.persistence {
            None => None,
            Some(persistence_config) => {
                let engine: Box<dyn StorageEngine> = match &persistence_config.root_dir {
                    Some(root_dir) => Box::new(FileStorageEngine::new(root_dir)?),
                    None => Box::new(InMemoryStorageEngine::new()),
                };
                Some(Arc::new(PersistenceManager::new(
                    engine,
                    LruCachePolicy::new(persistence_config.cache_size_bytes),
                    Logger::new("firebase-database/persistence"),
                )))
            }
        };

        let registration_ids = Arc::new(AtomicU64::new(1));
        let repo = Repo::spawn(
            RepoConfig {
                host_info,
                token_provider,
                tunables: config.tunables,
                persistence,
                registration_ids: registration_ids.clone(),
            },
            Logger::new("firebase-database"),
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                repo,
                registration_ids,
                push_ids: Mutex::new(PushIdGenerator::default()),
            }),
        })
    }

    pub(crate) fn repo(&self) -> &RepoHandle {
        &self.inner.repo
    }

    pub(crate) fn mint_registration_id(&self) -> u64 {
        self.inner.registration_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_push_id(&self) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);
        self.inner.push_ids.lock().unwrap().next_push_id(now)
    }

    pub fn root(&self) -> DatabaseReference {
        DatabaseReference::new(self.clone(), Path::root())
    }

    pub fn reference(&self, path: &str) -> DatabaseResult<DatabaseReference> {
        let parsed = Path::parse(path)?;
        Ok(DatabaseReference::new(self.clone(), parsed))
    }

    pub(crate) fn reference_at(&self, path: &Path) -> DatabaseResult<DatabaseReference> {
        Ok(DatabaseReference::new(self.clone(), path.clone()))
    }

    /// `.info/connected`: `true` while the realtime connection is up.
    pub fn connected_ref(&self) -> DatabaseReference {
        DatabaseReference::new(self.clone(), Path::from_trusted(".info/connected"))
    }

    /// `.info/authenticated`: emits `false` at registration time and `true`
    /// once the auth handshake succeeds. The initial `false` is expected,
    /// not an error.
    pub fn authenticated_ref(&self) -> DatabaseReference {
        DatabaseReference::new(self.clone(), Path::from_trusted(".info/authenticated"))
    }

    /// `.info/serverTimeOffset`: estimated millis between the local clock
    /// and the server's.
    pub fn server_time_offset_ref(&self) -> DatabaseReference {
        DatabaseReference::new(self.clone(), Path::from_trusted(".info/serverTimeOffset"))
    }

    /// Pauses the realtime connection; no automatic reconnects happen until
    /// [`go_online`]. Local reads and writes keep working.
    ///
    /// [`go_online`]: Database::go_online
    pub fn go_offline(&self) -> DatabaseResult<()> {
        self.inner.repo.post(Repo::interrupt)
    }

    pub fn go_online(&self) -> DatabaseResult<()> {
        self.inner.repo.post(Repo::resume)
    }

    /// Cancels every write not yet acknowledged by the server. Each pending
    /// write's completion resolves with `write-canceled`; listeners see the
    /// reverted state.
    pub fn purge_outstanding_writes(&self) -> DatabaseResult<()> {
        self.inner.repo.post(Repo::purge_outstanding_writes)
    }

    /// Stops the engine after draining queued work. Every call after this
    /// fails with `unavailable`.
    pub async fn shutdown(&self) -> DatabaseResult<()> {
        self.inner
            .repo
            .call(Repo::shutdown)
            .await
            .map_err(|_| unavailable("database already shut down"))
    }
}
