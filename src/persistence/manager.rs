//! Engine-facing persistence facade.
//!
//! Owns the storage engine behind one lock; every call is a single storage
//! transaction (mutate, then flush). The run loop is the only caller.

use std::sync::Mutex;

use serde_json::Value;

use crate::core::compound_write::CompoundWrite;
use crate::core::node::serializer::json_to_node;
use crate::core::node::Node;
use crate::core::path::Path;
use crate::core::query::QuerySpec;
use crate::error::DatabaseResult;
use crate::logger::Logger;
use crate::persistence::cache_policy::LruCachePolicy;
use crate::persistence::storage_engine::{
    PersistedWrite, PersistedWriteKind, StorageEngine, TrackedQueryRecord,
};
use crate::persistence::tracked_query::TrackedQueryManager;

/// A user write recovered from disk, ready to re-enter the sync tree.
pub struct RecoveredWrite {
    pub write_id: u64,
    pub path: Path,
    pub overwrite: Option<Node>,
    pub merge: Option<CompoundWrite>,
}

struct Inner {
    engine: Box<dyn StorageEngine>,
    tracked: TrackedQueryManager,
}

pub struct PersistenceManager {
    inner: Mutex<Inner>,
    policy: LruCachePolicy,
    logger: Logger,
}

impl PersistenceManager {
    pub fn new(mut engine: Box<dyn StorageEngine>, policy: LruCachePolicy, logger: Logger) -> Self {
        let tracked = TrackedQueryManager::load(engine.as_mut());
        Self {
            inner: Mutex::new(Inner { engine, tracked }),
            policy,
            logger,
        }
    }

    pub fn last_write_id(&self) -> u64 {
        self.inner.lock().unwrap().engine.last_write_id()
    }

    /// The write log, in write-id order, decoded. Corrupt records are
    /// dropped with a warning rather than poisoning startup.
    pub fn load_user_writes(&self) -> Vec<RecoveredWrite> {
        let inner = self.inner.lock().unwrap();
        let mut recovered = Vec::new();
        for write in inner.engine.load_user_writes() {
            let path = Path::from_trusted(&write.path);
            let decoded = match write.kind {
                PersistedWriteKind::Overwrite => {
                    json_to_node(&write.data).map(|node| RecoveredWrite {
                        write_id: write.write_id,
                        path,
                        overwrite: Some(node),
                        merge: None,
                    })
                }
                PersistedWriteKind::Merge => decode_merge(&write.data).map(|merge| {
                    RecoveredWrite {
                        write_id: write.write_id,
                        path,
                        overwrite: None,
                        merge: Some(merge),
                    }
                }),
            };
            match decoded {
                Ok(write) => recovered.push(write),
                Err(err) => self
                    .logger
                    .warn(format!("dropping corrupt persisted write: {err}")),
            }
        }
        recovered.sort_by_key(|write| write.write_id);
        recovered
    }

    pub fn save_user_overwrite(&self, path: &Path, node: &Node, write_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.engine.save_user_write(PersistedWrite {
            write_id,
            path: path.to_wire(),
            kind: PersistedWriteKind::Overwrite,
            data: node.export_value(),
        });
        inner.engine.set_last_write_id(write_id);
        self.flush(&mut inner);
    }

    pub fn save_user_merge(&self, path: &Path, children: &CompoundWrite, write_id: u64) {
        let mut data = serde_json::Map::new();
        for (child_path, node) in children.entries() {
            data.insert(
                child_path
                    .segments()
                    .iter()
                    .map(|key| key.as_str())
                    .collect::<Vec<_>>()
                    .join("/"),
                node.export_value(),
            );
        }
        let mut inner = self.inner.lock().unwrap();
        inner.engine.save_user_write(PersistedWrite {
            write_id,
            path: path.to_wire(),
            kind: PersistedWriteKind::Merge,
            data: Value::Object(data),
        });
        inner.engine.set_last_write_id(write_id);
        self.flush(&mut inner);
    }

    pub fn remove_user_write(&self, write_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.engine.remove_user_write(write_id);
        self.flush(&mut inner);
    }

    pub fn remove_all_user_writes(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.engine.remove_all_user_writes();
        self.flush(&mut inner);
    }

    /// Persists a server update when some tracked query covers it, then
    /// evicts if the cache outgrew its budget.
    pub fn on_server_update(&self, path: &Path, data: &Node, merge: bool) {
        let mut inner = self.inner.lock().unwrap();
        let wire_path = path.to_wire();
        if !inner.tracked.covers_path(&wire_path) {
            return;
        }
        inner
            .engine
            .update_server_cache(&wire_path, data.export_value(), merge);
        self.evict_if_needed(&mut inner);
        self.flush(&mut inner);
    }

    /// The cached server value for a complete tracked query.
    pub fn server_cache(&self, spec: &QuerySpec) -> Option<Node> {
        let inner = self.inner.lock().unwrap();
        if !inner.tracked.is_complete(spec) {
            return None;
        }
        let mut cache = inner.engine.server_cache().clone();
        for key in spec.path.segments() {
            cache = cache.get(key.as_str()).cloned().unwrap_or(Value::Null);
        }
        json_to_node(&cache).ok()
    }

    pub fn set_query_active(&self, spec: &QuerySpec) {
        let mut inner = self.inner.lock().unwrap();
        let now = now_millis();
        let Inner { engine, tracked } = &mut *inner;
        tracked.track(engine.as_mut(), spec, true, now);
        self.flush(&mut inner);
    }

    pub fn set_query_inactive(&self, spec: &QuerySpec) {
        let mut inner = self.inner.lock().unwrap();
        let now = now_millis();
        let Inner { engine, tracked } = &mut *inner;
        tracked.set_inactive(engine.as_mut(), spec, now);
        self.flush(&mut inner);
    }

    pub fn set_query_complete(&self, spec: &QuerySpec) {
        let mut inner = self.inner.lock().unwrap();
        let Inner { engine, tracked } = &mut *inner;
        tracked.set_complete(engine.as_mut(), spec);
        self.flush(&mut inner);
    }

    fn evict_if_needed(&self, inner: &mut Inner) {
        if !self
            .policy
            .should_prune(inner.engine.estimate_server_cache_bytes())
        {
            return;
        }
        let candidates: Vec<TrackedQueryRecord> = inner.tracked.inactive_oldest_first();
        if candidates.is_empty() {
            self.logger.warn(
                "server cache exceeds its budget but every tracked query is active; skipping eviction",
            );
            return;
        }
        for record in candidates {
            if inner.engine.estimate_server_cache_bytes() <= self.policy.target_bytes() {
                break;
            }
            self.logger.debug(format!(
                "evicting cached query {} (last used {})",
                record.storage_key(),
                record.last_use_millis
            ));
            inner.engine.remove_server_cache(&record.path);
            let Inner { engine, tracked } = inner;
            tracked.remove(engine.as_mut(), &record);
        }
    }

    fn flush(&self, inner: &mut Inner) {
        if let Err(err) = inner.engine.flush() {
            self.logger.error(format!("persistence flush failed: {err}"));
        }
    }
}

fn decode_merge(data: &Value) -> DatabaseResult<CompoundWrite> {
    let mut merge = CompoundWrite::empty();
    if let Some(map) = data.as_object() {
        for (raw_path, value) in map {
            let child_path = Path::parse(raw_path)?;
            merge = merge.add_write(&child_path, json_to_node(value)?);
        }
    }
    Ok(merge)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::storage_engine::InMemoryStorageEngine;
    use serde_json::json;

    fn manager() -> PersistenceManager {
        PersistenceManager::new(
            Box::new(InMemoryStorageEngine::new()),
            LruCachePolicy::default(),
            Logger::new("firebase-database/persistence-test"),
        )
    }

    fn spec(raw: &str) -> QuerySpec {
        QuerySpec::default_at(Path::parse(raw).unwrap())
    }

    fn node(value: serde_json::Value) -> Node {
        json_to_node(&value).unwrap()
    }

    #[test]
    fn write_log_round_trips() {
        let manager = manager();
        manager.save_user_overwrite(&Path::parse("x").unwrap(), &node(json!(1)), 1);

        let merge = CompoundWrite::empty()
            .add_write(&Path::parse("a").unwrap(), node(json!(2)));
        manager.save_user_merge(&Path::parse("room").unwrap(), &merge, 2);

        let recovered = manager.load_user_writes();
        assert_eq!(recovered.len(), 2);
        assert!(recovered[0].overwrite.is_some());
        assert!(recovered[1].merge.is_some());
        assert_eq!(manager.last_write_id(), 2);

        manager.remove_user_write(1);
        assert_eq!(manager.load_user_writes().len(), 1);
    }

    #[test]
    fn server_cache_served_only_when_complete() {
        let manager = manager();
        let query = spec("rooms/a");
        manager.set_query_active(&query);
        manager.on_server_update(
            &Path::parse("rooms/a").unwrap(),
            &node(json!({ "x": 1 })),
            false,
        );

        assert!(manager.server_cache(&query).is_none());
        manager.set_query_complete(&query);
        assert_eq!(
            manager.server_cache(&query).unwrap().value(),
            json!({ "x": 1 })
        );
    }

    #[test]
    fn untracked_paths_are_not_persisted() {
        let manager = manager();
        manager.on_server_update(&Path::parse("stray").unwrap(), &node(json!(1)), false);
        manager.set_query_active(&spec("stray"));
        manager.set_query_complete(&spec("stray"));
        // Nothing was cached before tracking began.
        assert_eq!(manager.server_cache(&spec("stray")).unwrap().value(), json!(null));
    }
}
