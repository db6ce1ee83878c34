//! Bookkeeping for queries whose server cache is persisted and LRU-managed.

use std::collections::HashMap;

use crate::core::query::QuerySpec;
use crate::persistence::storage_engine::{StorageEngine, TrackedQueryRecord};

#[derive(Default, Debug)]
pub struct TrackedQueryManager {
    by_key: HashMap<String, TrackedQueryRecord>,
    next_id: u64,
}

impl TrackedQueryManager {
    /// Loads existing records. Queries marked active by a previous process
    /// are demoted; whoever re-attaches will re-activate them.
    pub fn load(engine: &mut dyn StorageEngine) -> Self {
        let mut by_key = HashMap::new();
        let mut next_id = 1;
        for mut record in engine.load_tracked_queries() {
            next_id = next_id.max(record.id + 1);
            if record.active {
                record.active = false;
                engine.save_tracked_query(record.clone());
            }
            by_key.insert(record.storage_key(), record);
        }
        Self { by_key, next_id }
    }

    pub fn find(&self, spec: &QuerySpec) -> Option<&TrackedQueryRecord> {
        self.by_key.get(&spec.storage_key())
    }

    pub fn is_complete(&self, spec: &QuerySpec) -> bool {
        self.find(spec).map(|record| record.complete).unwrap_or(false)
    }

    /// Creates or refreshes the record for `spec`, stamping last-use.
    pub fn track(
        &mut self,
        engine: &mut dyn StorageEngine,
        spec: &QuerySpec,
        active: bool,
        now_millis: i64,
    ) {
        let key = spec.storage_key();
        let record = match self.by_key.get_mut(&key) {
            Some(record) => {
                record.active = active;
                record.last_use_millis = now_millis;
                record.clone()
            }
            None => {
                let record = TrackedQueryRecord {
                    id: self.next_id,
                    path: spec.path.to_wire(),
                    query_id: spec.query_id(),
                    params: spec.params.to_wire(),
                    last_use_millis: now_millis,
                    active,
                    complete: false,
                };
                self.next_id += 1;
                self.by_key.insert(key, record.clone());
                record
            }
        };
        engine.save_tracked_query(record);
    }

    pub fn set_inactive(
        &mut self,
        engine: &mut dyn StorageEngine,
        spec: &QuerySpec,
        now_millis: i64,
    ) {
        if let Some(record) = self.by_key.get_mut(&spec.storage_key()) {
            record.active = false;
            record.last_use_millis = now_millis;
            engine.save_tracked_query(record.clone());
        }
    }

    pub fn set_complete(&mut self, engine: &mut dyn StorageEngine, spec: &QuerySpec) {
        if let Some(record) = self.by_key.get_mut(&spec.storage_key()) {
            if !record.complete {
                record.complete = true;
                engine.save_tracked_query(record.clone());
            }
        }
    }

    /// Whether any tracked query covers `wire_path` (so its cache fragment is
    /// worth persisting).
    pub fn covers_path(&self, wire_path: &str) -> bool {
        self.by_key.values().any(|record| {
            is_path_prefix(&record.path, wire_path) || is_path_prefix(wire_path, &record.path)
        })
    }

    /// Eviction candidates: inactive queries, least recently used first.
    pub fn inactive_oldest_first(&self) -> Vec<TrackedQueryRecord> {
        let mut candidates: Vec<TrackedQueryRecord> = self
            .by_key
            .values()
            .filter(|record| !record.active)
            .cloned()
            .collect();
        candidates.sort_by_key(|record| record.last_use_millis);
        candidates
    }

    pub fn remove(&mut self, engine: &mut dyn StorageEngine, record: &TrackedQueryRecord) {
        self.by_key.remove(&record.storage_key());
        engine.remove_tracked_query(record.id);
    }
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::path::Path;
    use crate::persistence::storage_engine::InMemoryStorageEngine;

    fn spec(raw: &str) -> QuerySpec {
        QuerySpec::default_at(Path::parse(raw).unwrap())
    }

    #[test]
    fn restart_demotes_active_queries() {
        let mut engine = InMemoryStorageEngine::new();
        let mut manager = TrackedQueryManager::default();
        manager.next_id = 1;
        manager.track(&mut engine, &spec("a"), true, 10);

        let reloaded = TrackedQueryManager::load(&mut engine);
        assert!(!reloaded.find(&spec("a")).unwrap().active);
        assert_eq!(reloaded.next_id, 2);
    }

    #[test]
    fn eviction_order_is_least_recently_used() {
        let mut engine = InMemoryStorageEngine::new();
        let mut manager = TrackedQueryManager::default();
        manager.next_id = 1;
        manager.track(&mut engine, &spec("old"), false, 1);
        manager.track(&mut engine, &spec("new"), false, 5);
        manager.track(&mut engine, &spec("pinned"), true, 0);

        let order: Vec<String> = manager
            .inactive_oldest_first()
            .iter()
            .map(|record| record.path.clone())
            .collect();
        assert_eq!(order, vec!["/old".to_string(), "/new".to_string()]);
    }

    #[test]
    fn coverage_walks_both_directions() {
        let mut engine = InMemoryStorageEngine::new();
        let mut manager = TrackedQueryManager::default();
        manager.next_id = 1;
        manager.track(&mut engine, &spec("rooms/a"), true, 1);

        assert!(manager.covers_path("/rooms/a/deep"));
        assert!(manager.covers_path("/rooms"));
        assert!(!manager.covers_path("/users"));
    }
}
