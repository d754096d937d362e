//! Object storage binding contract and the in-memory development backend.

use crate::error::{BindingError, BindingResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub uploaded: u64,
}

/// A stored object: bytes plus metadata.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub meta: ObjectMeta,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectListOptions {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectList {
    pub objects: Vec<ObjectMeta>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Contract an object-storage backend must satisfy.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> BindingResult<Option<StoredObject>>;
    fn put(&self, key: &str, body: Vec<u8>, content_type: Option<String>)
        -> BindingResult<ObjectMeta>;
    fn delete(&self, key: &str) -> BindingResult<()>;
    fn head(&self, key: &str) -> BindingResult<Option<ObjectMeta>>;
    fn list(&self, options: ObjectListOptions) -> BindingResult<ObjectList>;
    fn create_signed_url(&self, key: &str, expires_secs: u64) -> BindingResult<String>;
    fn public_url(&self, key: &str) -> BindingResult<String>;
}

const DEFAULT_LIST_LIMIT: usize = 1000;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// FNV-1a; enough for an etag over test data.
fn etag_of(data: &[u8]) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// In-memory object store for development and tests. URLs are synthesized
/// under a configurable base so `createSignedUrl` / `publicUrl` stay
/// deterministic.
pub struct MemoryObjectStore {
    base_url: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            base_url: format!("https://storage.local/{bucket}"),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> BindingResult<Option<StoredObject>> {
        Ok(self.objects.read().get(key).cloned())
    }

    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<String>,
    ) -> BindingResult<ObjectMeta> {
        let meta = ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            etag: etag_of(&body),
            content_type,
            uploaded: now_millis(),
        };
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                meta: meta.clone(),
                body,
            },
        );
        Ok(meta)
    }

    fn delete(&self, key: &str) -> BindingResult<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    fn head(&self, key: &str) -> BindingResult<Option<ObjectMeta>> {
        Ok(self.objects.read().get(key).map(|o| o.meta.clone()))
    }

    fn list(&self, options: ObjectListOptions) -> BindingResult<ObjectList> {
        let limit = options.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
        let prefix = options.prefix.unwrap_or_default();

        let objects = self.objects.read();
        let mut listed = Vec::new();
        let mut truncated = false;
        let mut cursor = None;

        for (key, object) in objects.iter() {
            if let Some(after) = options.cursor.as_deref() {
                if key.as_str() <= after {
                    continue;
                }
            }
            if !key.starts_with(&prefix) {
                continue;
            }
            if listed.len() == limit {
                truncated = true;
                cursor = listed.last().map(|m: &ObjectMeta| m.key.clone());
                break;
            }
            listed.push(object.meta.clone());
        }

        Ok(ObjectList {
            objects: listed,
            truncated,
            cursor,
        })
    }

    fn create_signed_url(&self, key: &str, expires_secs: u64) -> BindingResult<String> {
        if !self.objects.read().contains_key(key) {
            return Err(BindingError::NotFound(key.to_string()));
        }
        let expires = now_millis() / 1000 + expires_secs;
        Ok(format!(
            "{}/{}?signature={}&expires={}",
            self.base_url,
            key,
            etag_of(format!("{key}:{expires}").as_bytes()),
            expires
        ))
    }

    fn public_url(&self, key: &str) -> BindingResult<String> {
        Ok(format!("{}/{}", self.base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_head_delete() {
        let store = MemoryObjectStore::new("test");
        let meta = store
            .put("docs/a.txt", b"hello".to_vec(), Some("text/plain".into()))
            .unwrap();
        assert_eq!(meta.size, 5);

        let object = store.get("docs/a.txt").unwrap().unwrap();
        assert_eq!(object.body, b"hello");
        assert_eq!(object.meta.etag, meta.etag);

        assert!(store.head("docs/a.txt").unwrap().is_some());
        store.delete("docs/a.txt").unwrap();
        assert!(store.get("docs/a.txt").unwrap().is_none());
    }

    #[test]
    fn list_respects_prefix() {
        let store = MemoryObjectStore::new("test");
        store.put("a/1", vec![1], None).unwrap();
        store.put("a/2", vec![2], None).unwrap();
        store.put("b/1", vec![3], None).unwrap();

        let page = store
            .list(ObjectListOptions {
                prefix: Some("a/".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(!page.truncated);
    }

    #[test]
    fn signed_url_requires_object() {
        let store = MemoryObjectStore::new("test");
        assert!(store.create_signed_url("missing", 60).is_err());
        store.put("k", vec![0], None).unwrap();
        let url = store.create_signed_url("k", 60).unwrap();
        assert!(url.contains("signature="));
        assert!(url.contains("expires="));
    }
}
