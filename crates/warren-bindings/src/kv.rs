//! Key/value binding contract and the in-memory development backend.

use crate::error::BindingResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Options accepted by `put`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KvPutOptions {
    /// Seconds until the key expires. `None` means no expiry.
    pub expiration_ttl: Option<u64>,
    /// Arbitrary JSON metadata stored next to the value.
    pub metadata: Option<JsonValue>,
}

/// Options accepted by `list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KvListOptions {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// A value with its stored metadata.
#[derive(Debug, Clone, Serialize)]
pub struct KvEntry {
    pub value: String,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KvKeyInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KvListResult {
    pub keys: Vec<KvKeyInfo>,
    pub list_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Contract a KV backend must satisfy. Values are strings; callers encode
/// anything richer themselves.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> BindingResult<Option<String>>;
    fn get_with_metadata(&self, key: &str) -> BindingResult<Option<KvEntry>>;
    fn put(&self, key: &str, value: String, options: KvPutOptions) -> BindingResult<()>;
    fn delete(&self, key: &str) -> BindingResult<()>;
    fn list(&self, options: KvListOptions) -> BindingResult<KvListResult>;
}

const DEFAULT_LIST_LIMIT: usize = 1000;

struct StoredValue {
    value: String,
    metadata: Option<JsonValue>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory KV backend for development and tests.
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, StoredValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|v| !v.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> BindingResult<Option<String>> {
        Ok(self.get_with_metadata(key)?.map(|e| e.value))
    }

    fn get_with_metadata(&self, key: &str) -> BindingResult<Option<KvEntry>> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(stored) if !stored.is_expired(Instant::now()) => Ok(Some(KvEntry {
                value: stored.value.clone(),
                metadata: stored.metadata.clone(),
            })),
            _ => Ok(None),
        }
    }

    fn put(&self, key: &str, value: String, options: KvPutOptions) -> BindingResult<()> {
        let expires_at = options
            .expiration_ttl
            .map(|ttl| Instant::now() + Duration::from_secs(ttl));
        self.entries.write().insert(
            key.to_string(),
            StoredValue {
                value,
                metadata: options.metadata,
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> BindingResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, options: KvListOptions) -> BindingResult<KvListResult> {
        let limit = options.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
        let prefix = options.prefix.unwrap_or_default();
        let now = Instant::now();

        let entries = self.entries.read();
        let mut keys = Vec::new();
        let mut cursor = None;
        let mut complete = true;

        for (name, stored) in entries.iter() {
            if let Some(after) = options.cursor.as_deref() {
                if name.as_str() <= after {
                    continue;
                }
            }
            if !name.starts_with(&prefix) || stored.is_expired(now) {
                continue;
            }
            if keys.len() == limit {
                complete = false;
                cursor = keys.last().map(|k: &KvKeyInfo| k.name.clone());
                break;
            }
            keys.push(KvKeyInfo {
                name: name.clone(),
                metadata: stored.metadata.clone(),
            });
        }

        Ok(KvListResult {
            keys,
            list_complete: complete,
            cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip() {
        let store = MemoryKvStore::new();
        store
            .put("user:1", "alice".into(), KvPutOptions::default())
            .unwrap();
        assert_eq!(store.get("user:1").unwrap().as_deref(), Some("alice"));
        store.delete("user:1").unwrap();
        assert_eq!(store.get("user:1").unwrap(), None);
    }

    #[test]
    fn metadata_survives() {
        let store = MemoryKvStore::new();
        store
            .put(
                "k",
                "v".into(),
                KvPutOptions {
                    metadata: Some(json!({"kind": "test"})),
                    ..Default::default()
                },
            )
            .unwrap();
        let entry = store.get_with_metadata("k").unwrap().unwrap();
        assert_eq!(entry.value, "v");
        assert_eq!(entry.metadata, Some(json!({"kind": "test"})));
    }

    #[test]
    fn expired_keys_vanish() {
        let store = MemoryKvStore::new();
        store
            .put(
                "gone",
                "x".into(),
                KvPutOptions {
                    expiration_ttl: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.get("gone").unwrap(), None);
    }

    #[test]
    fn list_prefix_and_cursor() {
        let store = MemoryKvStore::new();
        for i in 0..5 {
            store
                .put(&format!("a:{i}"), format!("{i}"), KvPutOptions::default())
                .unwrap();
        }
        store.put("b:0", "x".into(), KvPutOptions::default()).unwrap();

        let page = store
            .list(KvListOptions {
                prefix: Some("a:".into()),
                limit: Some(3),
                cursor: None,
            })
            .unwrap();
        assert_eq!(page.keys.len(), 3);
        assert!(!page.list_complete);

        let rest = store
            .list(KvListOptions {
                prefix: Some("a:".into()),
                limit: Some(10),
                cursor: page.cursor,
            })
            .unwrap();
        assert_eq!(rest.keys.len(), 2);
        assert!(rest.list_complete);
    }
}
