//! Writes the server commits on ungraceful disconnect.
//!
//! Each operation is acknowledged by the server while the connection is
//! healthy; the engine mirrors acknowledged operations locally so listeners
//! converge the moment the socket drops, without waiting for the server's
//! fan-out. Like plain writes, operations enqueue at call time.

use std::future::Future;

use serde_json::{Map, Value};

use crate::api::reference::DatabaseReference;
use crate::error::{unavailable, DatabaseResult};

#[derive(Clone, Debug)]
pub struct OnDisconnect {
    reference: DatabaseReference,
}

impl OnDisconnect {
    pub(crate) fn new(reference: DatabaseReference) -> Self {
        Self { reference }
    }

    fn enqueue(
        &self,
        operation: impl FnOnce(
                &mut crate::core::repo::Repo,
                crate::realtime::persistent_connection::StatusCallback,
            ) + Send
            + 'static,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let (sender, receiver) = futures::channel::oneshot::channel();
        let posted = self.reference.database().repo().post(move |repo| {
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

    /// Stages `value` to be written here when the connection is lost.
    pub fn set(&self, value: Value) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let path = self.reference.path_internal().clone();
        self.enqueue(move |repo, complete| repo.on_disconnect_set(path, value, complete))
    }

    pub fn set_with_priority(
        &self,
        value: Value,
        priority: Value,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let mut wrapped = Map::with_capacity(2);
        wrapped.insert(".value".to_string(), value);
        wrapped.insert(".priority".to_string(), priority);
        self.set(Value::Object(wrapped))
    }

    /// Stages a merge to apply here when the connection is lost.
    pub fn update(
        &self,
        updates: Map<String, Value>,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let path = self.reference.path_internal().clone();
        self.enqueue(move |repo, complete| repo.on_disconnect_merge(path, updates, complete))
    }

    /// Stages a delete of this location on disconnect.
    pub fn remove(&self) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        self.set(Value::Null)
    }

    /// Cancels everything staged at or below this location.
    pub fn cancel(&self) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let path = self.reference.path_internal().clone();
        self.enqueue(move |repo, complete| repo.on_disconnect_cancel(path, complete))
    }
}
