//! Durable-object storage: contract, in-memory backend, and a redb-backed
//! file store for persistence.
//!
//! A durable store holds many objects, each addressed by an opaque object id
//! and owning an isolated key space. `delete_all` and `list` operate within
//! one object only.

use crate::error::{BindingError, BindingResult};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Contract a durable-object storage backend must satisfy.
pub trait DurableStore: Send + Sync {
    fn get(&self, object_id: &str, key: &str) -> BindingResult<Option<JsonValue>>;
    fn put(&self, object_id: &str, key: &str, value: JsonValue) -> BindingResult<()>;
    fn delete(&self, object_id: &str, key: &str) -> BindingResult<bool>;
    fn delete_all(&self, object_id: &str) -> BindingResult<()>;
    fn list(
        &self,
        object_id: &str,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> BindingResult<Vec<(String, JsonValue)>>;
}

const DEFAULT_LIST_LIMIT: usize = 1000;

/// In-memory durable store for development and tests.
pub struct MemoryDurableStore {
    objects: RwLock<HashMap<String, BTreeMap<String, JsonValue>>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for MemoryDurableStore {
    fn get(&self, object_id: &str, key: &str) -> BindingResult<Option<JsonValue>> {
        Ok(self
            .objects
            .read()
            .get(object_id)
            .and_then(|space| space.get(key).cloned()))
    }

    fn put(&self, object_id: &str, key: &str, value: JsonValue) -> BindingResult<()> {
        self.objects
            .write()
            .entry(object_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, object_id: &str, key: &str) -> BindingResult<bool> {
        Ok(self
            .objects
            .write()
            .get_mut(object_id)
            .is_some_and(|space| space.remove(key).is_some()))
    }

    fn delete_all(&self, object_id: &str) -> BindingResult<()> {
        self.objects.write().remove(object_id);
        Ok(())
    }

    fn list(
        &self,
        object_id: &str,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> BindingResult<Vec<(String, JsonValue)>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
        let prefix = prefix.unwrap_or("");
        let objects = self.objects.read();
        let Some(space) = objects.get(object_id) else {
            return Ok(Vec::new());
        };
        Ok(space
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// Composite key: "<object_id>\x1f<key>". The unit separator cannot appear in
// object ids (they are hex-derived) so ranges stay unambiguous.
const SEP: char = '\u{1f}';
const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("durable");

fn composite(object_id: &str, key: &str) -> String {
    format!("{object_id}{SEP}{key}")
}

/// Durable store backed by a redb file.
pub struct RedbDurableStore {
    db: Arc<Database>,
}

impl RedbDurableStore {
    /// Open or create the store at `path`. Parent directories are created.
    pub fn open(path: &Path) -> BindingResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(|e| BindingError::Database(e.to_string()))?;
        {
            let write_txn = db
                .begin_write()
                .map_err(|e| BindingError::Database(e.to_string()))?;
            {
                let _ = write_txn.open_table(TABLE);
            }
            write_txn
                .commit()
                .map_err(|e| BindingError::Database(e.to_string()))?;
        }
        Ok(Self { db: Arc::new(db) })
    }
}

impl DurableStore for RedbDurableStore {
    fn get(&self, object_id: &str, key: &str) -> BindingResult<Option<JsonValue>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        let table = read_txn
            .open_table(TABLE)
            .map_err(|e| BindingError::Database(e.to_string()))?;
        match table.get(composite(object_id, key).as_str()) {
            Ok(Some(guard)) => {
                let value = serde_json::from_slice(guard.value())?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(BindingError::Database(e.to_string())),
        }
    }

    fn put(&self, object_id: &str, key: &str, value: JsonValue) -> BindingResult<()> {
        let encoded = serde_json::to_vec(&value)?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(TABLE)
                .map_err(|e| BindingError::Database(e.to_string()))?;
            table
                .insert(composite(object_id, key).as_str(), encoded.as_slice())
                .map_err(|e| BindingError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, object_id: &str, key: &str) -> BindingResult<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        let existed;
        {
            let mut table = write_txn
                .open_table(TABLE)
                .map_err(|e| BindingError::Database(e.to_string()))?;
            existed = table
                .remove(composite(object_id, key).as_str())
                .map_err(|e| BindingError::Database(e.to_string()))?
                .is_some();
        }
        write_txn
            .commit()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        Ok(existed)
    }

    fn delete_all(&self, object_id: &str) -> BindingResult<()> {
        let keys = self
            .list(object_id, None, Some(usize::MAX))?
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>();

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(TABLE)
                .map_err(|e| BindingError::Database(e.to_string()))?;
            for key in keys {
                table
                    .remove(composite(object_id, &key).as_str())
                    .map_err(|e| BindingError::Database(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        Ok(())
    }

    fn list(
        &self,
        object_id: &str,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> BindingResult<Vec<(String, JsonValue)>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
        let scope = composite(object_id, prefix.unwrap_or(""));

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| BindingError::Database(e.to_string()))?;
        let table = read_txn
            .open_table(TABLE)
            .map_err(|e| BindingError::Database(e.to_string()))?;

        let mut out = Vec::new();
        let iter = table
            .range(scope.as_str()..)
            .map_err(|e| BindingError::Database(e.to_string()))?;
        for item in iter {
            let (key_guard, value_guard) = item.map_err(|e| BindingError::Database(e.to_string()))?;
            let full = key_guard.value();
            if !full.starts_with(scope.as_str()) {
                break;
            }
            let key = full
                .split_once(SEP)
                .map(|(_, k)| k.to_string())
                .unwrap_or_else(|| full.to_string());
            out.push((key, serde_json::from_slice(value_guard.value())?));
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_objects_are_isolated() {
        let store = MemoryDurableStore::new();
        store.put("obj-a", "k", json!("a")).unwrap();
        store.put("obj-b", "k", json!("b")).unwrap();
        assert_eq!(store.get("obj-a", "k").unwrap(), Some(json!("a")));
        assert_eq!(store.get("obj-b", "k").unwrap(), Some(json!("b")));

        store.delete_all("obj-a").unwrap();
        assert_eq!(store.get("obj-a", "k").unwrap(), None);
        assert_eq!(store.get("obj-b", "k").unwrap(), Some(json!("b")));
    }

    #[test]
    fn memory_list_prefix() {
        let store = MemoryDurableStore::new();
        store.put("o", "a:1", json!(1)).unwrap();
        store.put("o", "a:2", json!(2)).unwrap();
        store.put("o", "b:1", json!(3)).unwrap();
        let listed = store.list("o", Some("a:"), None).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn redb_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbDurableStore::open(&dir.path().join("durable.redb")).unwrap();

        store.put("obj", "count", json!(41)).unwrap();
        store.put("obj", "name", json!("warren")).unwrap();
        assert_eq!(store.get("obj", "count").unwrap(), Some(json!(41)));

        assert!(store.delete("obj", "count").unwrap());
        assert!(!store.delete("obj", "count").unwrap());

        store.put("other", "name", json!("x")).unwrap();
        store.delete_all("obj").unwrap();
        assert_eq!(store.get("obj", "name").unwrap(), None);
        assert_eq!(store.get("other", "name").unwrap(), Some(json!("x")));
    }
}
