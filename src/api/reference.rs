//! A location in the database, with its write surface.
//!
//! Write methods enqueue onto the engine at call time, so calling order is
//! write order even when the returned futures are awaited later (or not at
//! all). Awaiting resolves with the server's acknowledgment.

use std::future::Future;

use serde_json::{Map, Value};

use crate::api::database::Database;
use crate::api::listener::{ChildEvent, ListenerRegistration};
use crate::api::on_disconnect::OnDisconnect;
use crate::api::query::DatabaseQuery;
use crate::api::snapshot::DataSnapshot;
use crate::core::path::Path;
use crate::core::repo::Repo;
use crate::core::transaction::{TransactionResult, TransactionUpdate};
use crate::error::{invalid_argument, unavailable, DatabaseResult};

#[derive(Clone, Debug)]
pub struct DatabaseReference {
    database: Database,
    path: Path,
}

/// Posts `operation` onto the run loop now; the returned future resolves
/// with the completion the engine eventually reports.
fn enqueue<T: Send + 'static>(
    database: &Database,
    operation: impl FnOnce(&mut Repo, Box<dyn FnOnce(DatabaseResult<T>) + Send>) + Send + 'static,
) -> impl Future<Output = DatabaseResult<T>> + Send + 'static {
    let (sender, receiver) = futures::channel::oneshot::channel();
    let posted = database.repo().post(move |repo| {
        operation(
            repo,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );
    });
    async move {
        posted?;
        receiver
            .await
            .map_err(|_| unavailable("database has been shut down"))?
    }
}

impl DatabaseReference {
    pub(crate) fn new(database: Database, path: Path) -> Self {
        Self { database, path }
    }

    pub(crate) fn database(&self) -> &Database {
        &self.database
    }

    pub(crate) fn path_internal(&self) -> &Path {
        &self.path
    }

    /// The last path segment, or `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.path.back().map(|key| key.as_str())
    }

    /// Slash-separated path (`/` for the root).
    pub fn path(&self) -> String {
        self.path.to_wire()
    }

    pub fn root(&self) -> DatabaseReference {
        DatabaseReference::new(self.database.clone(), Path::root())
    }

    pub fn parent(&self) -> Option<DatabaseReference> {
        self.path
            .parent()
            .map(|parent| DatabaseReference::new(self.database.clone(), parent))
    }

    pub fn child(&self, relative_path: &str) -> DatabaseResult<DatabaseReference> {
        let relative = Path::parse(relative_path)?;
        if relative.is_empty() {
            return Err(invalid_argument("child path cannot be empty"));
        }
        Ok(DatabaseReference::new(
            self.database.clone(),
            self.path.join(&relative),
        ))
    }

    pub fn query(&self) -> DatabaseQuery {
        DatabaseQuery::new(self.clone())
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Writes `value` here, replacing whatever exists. Local listeners see
    /// the new value immediately; the future resolves on the server's
    /// acknowledgment (or rejection).
    pub fn set(&self, value: Value) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let path = self.path.clone();
        enqueue(&self.database, move |repo, complete| {
            repo.set_value(path, value, None, complete);
        })
    }

    pub fn set_with_priority(
        &self,
        value: Value,
        priority: Value,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let path = self.path.clone();
        enqueue(&self.database, move |repo, complete| {
            repo.set_value(path, value, Some(priority), complete);
        })
    }

    pub fn set_priority(
        &self,
        priority: Value,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let path = self.path.clone();
        enqueue(&self.database, move |repo, complete| {
            repo.set_priority(path, priority, complete);
        })
    }

    /// Applies a multi-location update. Keys are paths relative to this
    /// location and may be deep (`"a/b/c"`).
    pub fn update(
        &self,
        updates: Map<String, Value>,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let path = self.path.clone();
        enqueue(&self.database, move |repo, complete| {
            repo.update_children(path, updates, complete);
        })
    }

    pub fn remove(&self) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        self.set(Value::Null)
    }

    /// A new child with a chronologically ordered unique key.
    pub fn push(&self) -> DatabaseResult<DatabaseReference> {
        let id = self.database.next_push_id();
        self.child(&id)
    }

    pub async fn push_with_value(&self, value: Value) -> DatabaseResult<DatabaseReference> {
        let child = self.push()?;
        child.set(value).await?;
        Ok(child)
    }

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    /// Runs an optimistic transaction at this location. The updater sees the
    /// current value (possibly `null`) and returns [`TransactionUpdate::Set`]
    /// to stage a new one or [`TransactionUpdate::Abort`] to give up. On a
    /// conflicting server change the updater re-runs against fresh data.
    pub fn run_transaction<F>(
        &self,
        updater: F,
    ) -> impl Future<Output = DatabaseResult<TransactionResult>> + Send + 'static
    where
        F: FnMut(Value) -> TransactionUpdate + Send + 'static,
    {
        self.run_transaction_with_options(updater, true)
    }

    /// As [`run_transaction`], with control over whether intermediate states
    /// are visible to local listeners before the server commits.
    ///
    /// [`run_transaction`]: DatabaseReference::run_transaction
    pub fn run_transaction_with_options<F>(
        &self,
        updater: F,
        apply_locally: bool,
    ) -> impl Future<Output = DatabaseResult<TransactionResult>> + Send + 'static
    where
        F: FnMut(Value) -> TransactionUpdate + Send + 'static,
    {
        let path = self.path.clone();
        enqueue(&self.database, move |repo, complete| {
            repo.start_transaction(path, Box::new(updater), apply_locally, complete);
        })
    }

    // -----------------------------------------------------------------
    // Listeners / reads (delegating to the default query)
    // -----------------------------------------------------------------

    pub fn on_value<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static,
    {
        self.query().on_value(callback)
    }

    pub fn on_child_added<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.query().on_child_added(callback)
    }

    pub fn on_child_changed<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.query().on_child_changed(callback)
    }

    pub fn on_child_removed<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.query().on_child_removed(callback)
    }

    pub fn on_child_moved<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.query().on_child_moved(callback)
    }

    pub async fn get(&self) -> DatabaseResult<Value> {
        self.query().get().await
    }

    pub fn keep_synced(&self, enabled: bool) -> DatabaseResult<()> {
        self.query().keep_synced(enabled)
    }

    pub fn on_disconnect(&self) -> OnDisconnect {
        OnDisconnect::new(self.clone())
    }
}
