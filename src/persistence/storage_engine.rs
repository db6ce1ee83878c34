//! Storage backends for the optional on-disk cache.
//!
//! Three logical tables: the server cache (one JSON tree), the user write
//! log, and tracked-query metadata, plus a small meta record keeping write-id
//! monotonicity across restarts. The in-memory engine backs tests and
//! persistence-disabled clients; the file engine keeps one JSON document per
//! table and writes atomically (temp file + rename).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{internal_error, DatabaseResult};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PersistedWriteKind {
    Overwrite,
    Merge,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedWrite {
    pub write_id: u64,
    pub path: String,
    pub kind: PersistedWriteKind,
    /// Export-format JSON: the node for overwrites, the child map for merges.
    pub data: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedQueryRecord {
    pub id: u64,
    pub path: String,
    pub query_id: String,
    pub params: Value,
    pub last_use_millis: i64,
    pub active: bool,
    pub complete: bool,
}

impl TrackedQueryRecord {
    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.path, self.query_id)
    }
}

pub trait StorageEngine: Send {
    fn server_cache(&self) -> &Value;
    fn update_server_cache(&mut self, path: &str, data: Value, merge: bool);
    fn remove_server_cache(&mut self, path: &str);
    /// Rough byte size of the serialized server cache.
    fn estimate_server_cache_bytes(&self) -> u64;

    fn load_user_writes(&self) -> Vec<PersistedWrite>;
    fn save_user_write(&mut self, write: PersistedWrite);
    fn remove_user_write(&mut self, write_id: u64);
    fn remove_all_user_writes(&mut self);

    fn load_tracked_queries(&self) -> Vec<TrackedQueryRecord>;
    fn save_tracked_query(&mut self, record: TrackedQueryRecord);
    fn remove_tracked_query(&mut self, id: u64);

    fn last_write_id(&self) -> u64;
    fn set_last_write_id(&mut self, write_id: u64);

    /// Makes everything mutated since the last flush durable, atomically per
    /// table. The in-memory engine treats this as a no-op.
    fn flush(&mut self) -> DatabaseResult<()>;
}

// ---------------------------------------------------------------------
// Shared table state
// ---------------------------------------------------------------------

#[derive(Default, Debug, Serialize, Deserialize)]
struct Tables {
    server_cache: Value,
    writes: BTreeMap<u64, PersistedWrite>,
    tracked_queries: BTreeMap<u64, TrackedQueryRecord>,
    last_write_id: u64,
}

impl Tables {
    fn update_server_cache(&mut self, path: &str, data: Value, merge: bool) {
        if self.server_cache.is_null() {
            self.server_cache = Value::Object(Default::default());
        }
        if merge {
            if let Value::Object(children) = data {
                for (key, child) in children {
                    let child_path = format!("{}/{}", path.trim_end_matches('/'), key);
                    set_json_at_path(&mut self.server_cache, &child_path, child);
                }
                return;
            }
        }
        set_json_at_path(&mut self.server_cache, path, data);
    }

    fn remove_server_cache(&mut self, path: &str) {
        set_json_at_path(&mut self.server_cache, path, Value::Null);
    }
}

fn set_json_at_path(root: &mut Value, path: &str, data: Value) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        *root = data;
        return;
    }
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current = current
            .as_object_mut()
            .expect("object ensured")
            .entry(segment.to_string())
            .or_insert(Value::Object(Default::default()));
    }
    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    let map = current.as_object_mut().expect("object ensured");
    let last = segments[segments.len() - 1];
    if data.is_null() {
        map.remove(last);
    } else {
        map.insert(last.to_string(), data);
    }
}

// ---------------------------------------------------------------------
// In-memory engine
// ---------------------------------------------------------------------

#[derive(Default, Debug)]
pub struct InMemoryStorageEngine {
    tables: Tables,
}

impl InMemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for InMemoryStorageEngine {
    fn server_cache(&self) -> &Value {
        &self.tables.server_cache
    }

    fn update_server_cache(&mut self, path: &str, data: Value, merge: bool) {
        self.tables.update_server_cache(path, data, merge);
    }

    fn remove_server_cache(&mut self, path: &str) {
        self.tables.remove_server_cache(path);
    }

    fn estimate_server_cache_bytes(&self) -> u64 {
        serde_json::to_string(&self.tables.server_cache)
            .map(|text| text.len() as u64)
            .unwrap_or(0)
    }

    fn load_user_writes(&self) -> Vec<PersistedWrite> {
        self.tables.writes.values().cloned().collect()
    }

    fn save_user_write(&mut self, write: PersistedWrite) {
        self.tables.writes.insert(write.write_id, write);
    }

    fn remove_user_write(&mut self, write_id: u64) {
        self.tables.writes.remove(&write_id);
    }

    fn remove_all_user_writes(&mut self) {
        self.tables.writes.clear();
    }

    fn load_tracked_queries(&self) -> Vec<TrackedQueryRecord> {
        self.tables.tracked_queries.values().cloned().collect()
    }

    fn save_tracked_query(&mut self, record: TrackedQueryRecord) {
        self.tables.tracked_queries.insert(record.id, record);
    }

    fn remove_tracked_query(&mut self, id: u64) {
        self.tables.tracked_queries.remove(&id);
    }

    fn last_write_id(&self) -> u64 {
        self.tables.last_write_id
    }

    fn set_last_write_id(&mut self, write_id: u64) {
        self.tables.last_write_id = write_id;
    }

    fn flush(&mut self) -> DatabaseResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// File-backed engine
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct FileStorageEngine {
    root_dir: PathBuf,
    tables: Tables,
    dirty: bool,
}

const SERVER_CACHE_FILE: &str = "server_cache.json";
const WRITES_FILE: &str = "writes.json";
const TRACKED_QUERIES_FILE: &str = "tracked_queries.json";
const META_FILE: &str = "meta.json";

#[derive(Default, Serialize, Deserialize)]
struct MetaRecord {
    last_write_id: u64,
}

impl FileStorageEngine {
    pub fn new(root_dir: impl Into<PathBuf>) -> DatabaseResult<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).map_err(|err| {
            internal_error(format!(
                "cannot create persistence directory {}: {err}",
                root_dir.display()
            ))
        })?;

        let server_cache = Self::read_table(&root_dir.join(SERVER_CACHE_FILE))?
            .unwrap_or(Value::Null);
        let writes: BTreeMap<u64, PersistedWrite> =
            Self::read_parsed(&root_dir.join(WRITES_FILE))?.unwrap_or_default();
        let tracked_queries: BTreeMap<u64, TrackedQueryRecord> =
            Self::read_parsed(&root_dir.join(TRACKED_QUERIES_FILE))?.unwrap_or_default();
        let meta: MetaRecord =
            Self::read_parsed(&root_dir.join(META_FILE))?.unwrap_or_default();

        Ok(Self {
            root_dir,
            tables: Tables {
                server_cache,
                writes,
                tracked_queries,
                last_write_id: meta.last_write_id,
            },
            dirty: false,
        })
    }

    fn read_table(path: &PathBuf) -> DatabaseResult<Option<Value>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| {
                    internal_error(format!("corrupt persistence file {}: {err}", path.display()))
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(internal_error(format!(
                "cannot read persistence file {}: {err}",
                path.display()
            ))),
        }
    }

    fn read_parsed<T: serde::de::DeserializeOwned>(path: &PathBuf) -> DatabaseResult<Option<T>> {
        match Self::read_table(path)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
                internal_error(format!("corrupt persistence file {}: {err}", path.display()))
            }),
        }
    }

    fn write_atomic<T: Serialize>(&self, file: &str, data: &T) -> DatabaseResult<()> {
        let serialized = serde_json::to_vec(data)
            .map_err(|err| internal_error(format!("cannot serialize {file}: {err}")))?;
        let target = self.root_dir.join(file);
        let temp = self.root_dir.join(format!("{file}.tmp"));
        fs::write(&temp, serialized).map_err(|err| {
            internal_error(format!("cannot write {}: {err}", temp.display()))
        })?;
        fs::rename(&temp, &target).map_err(|err| {
            internal_error(format!("cannot commit {}: {err}", target.display()))
        })
    }
}

impl StorageEngine for FileStorageEngine {
    fn server_cache(&self) -> &Value {
        &self.tables.server_cache
    }

    fn update_server_cache(&mut self, path: &str, data: Value, merge: bool) {
        self.tables.update_server_cache(path, data, merge);
        self.dirty = true;
    }

    fn remove_server_cache(&mut self, path: &str) {
        self.tables.remove_server_cache(path);
        self.dirty = true;
    }

    fn estimate_server_cache_bytes(&self) -> u64 {
        serde_json::to_string(&self.tables.server_cache)
            .map(|text| text.len() as u64)
            .unwrap_or(0)
    }

    fn load_user_writes(&self) -> Vec<PersistedWrite> {
        self.tables.writes.values().cloned().collect()
    }

    fn save_user_write(&mut self, write: PersistedWrite) {
        self.tables.writes.insert(write.write_id, write);
        self.dirty = true;
    }

    fn remove_user_write(&mut self, write_id: u64) {
        self.tables.writes.remove(&write_id);
        self.dirty = true;
    }

    fn remove_all_user_writes(&mut self) {
        self.tables.writes.clear();
        self.dirty = true;
    }

    fn load_tracked_queries(&self) -> Vec<TrackedQueryRecord> {
        self.tables.tracked_queries.values().cloned().collect()
    }

    fn save_tracked_query(&mut self, record: TrackedQueryRecord) {
        self.tables.tracked_queries.insert(record.id, record);
        self.dirty = true;
    }

    fn remove_tracked_query(&mut self, id: u64) {
        self.tables.tracked_queries.remove(&id);
        self.dirty = true;
    }

    fn last_write_id(&self) -> u64 {
        self.tables.last_write_id
    }

    fn set_last_write_id(&mut self, write_id: u64) {
        self.tables.last_write_id = write_id;
        self.dirty = true;
    }

    fn flush(&mut self) -> DatabaseResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.write_atomic(SERVER_CACHE_FILE, &self.tables.server_cache)?;
        self.write_atomic(WRITES_FILE, &self.tables.writes)?;
        self.write_atomic(TRACKED_QUERIES_FILE, &self.tables.tracked_queries)?;
        self.write_atomic(
            META_FILE,
            &MetaRecord {
                last_write_id: self.tables.last_write_id,
            },
        )?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_cache_updates_and_merges() {
        let mut engine = InMemoryStorageEngine::new();
        engine.update_server_cache("/users/alice", json!({ "age": 30 }), false);
        engine.update_server_cache("/users/alice", json!({ "city": "Rome" }), true);

        assert_eq!(
            engine.server_cache(),
            &json!({ "users": { "alice": { "age": 30, "city": "Rome" } } })
        );

        engine.remove_server_cache("/users/alice/age");
        assert_eq!(
            engine.server_cache(),
            &json!({ "users": { "alice": { "city": "Rome" } } })
        );
    }

    #[test]
    fn file_engine_round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut engine = FileStorageEngine::new(dir.path()).unwrap();
            engine.update_server_cache("/x", json!(1), false);
            engine.save_user_write(PersistedWrite {
                write_id: 7,
                path: "/x".to_string(),
                kind: PersistedWriteKind::Overwrite,
                data: json!(1),
            });
            engine.save_tracked_query(TrackedQueryRecord {
                id: 1,
                path: "/x".to_string(),
                query_id: "default".to_string(),
                params: json!({}),
                last_use_millis: 100,
                active: true,
                complete: false,
            });
            engine.set_last_write_id(7);
            engine.flush().unwrap();
        }

        let engine = FileStorageEngine::new(dir.path()).unwrap();
        assert_eq!(engine.server_cache(), &json!({ "x": 1 }));
        assert_eq!(engine.load_user_writes().len(), 1);
        assert_eq!(engine.load_tracked_queries().len(), 1);
        assert_eq!(engine.last_write_id(), 7);
    }

    #[test]
    fn flush_skips_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FileStorageEngine::new(dir.path()).unwrap();
        engine.flush().unwrap();
        assert!(!dir.path().join(SERVER_CACHE_FILE).exists());

        engine.update_server_cache("/a", json!(true), false);
        engine.flush().unwrap();
        assert!(dir.path().join(SERVER_CACHE_FILE).exists());
    }
}
