//! Object-storage binding ops.

use super::{op_err, to_payload};
use crate::base64;
use crate::registry::{self, RequestState};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use warren_bindings::{ObjectListOptions, ObjectStore};
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![
        op_sync("__r2_get", 3, r2_get),
        op_sync("__r2_put", 5, r2_put),
        op_sync("__r2_delete", 3, r2_delete),
        op_sync("__r2_head", 3, r2_head),
        op_sync("__r2_list", 3, r2_list),
        op_sync("__r2_signedUrl", 4, r2_signed_url),
        op_sync("__r2_publicUrl", 3, r2_public_url),
    ]
}

fn store_for(state: &RequestState, name: &str) -> Result<Arc<dyn ObjectStore>, OpError> {
    state
        .env
        .storage
        .get(name)
        .cloned()
        .ok_or_else(|| OpError::new(format!("unknown storage binding '{name}'")))
}

fn r2_get(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    match store.get(&args[2]).map_err(op_err)? {
        Some(object) => to_payload(&json!({
            "meta": object.meta,
            "body": base64::encode(&object.body),
        })),
        None => Ok("null".to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PutOptions {
    content_type: Option<String>,
}

fn r2_put(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let body = base64::decode(&args[3]).map_err(OpError::new)?;
    let options: PutOptions = serde_json::from_str(&args[4]).map_err(op_err)?;
    let meta = store
        .put(&args[2], body, options.content_type)
        .map_err(op_err)?;
    to_payload(&meta)
}

fn r2_delete(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    store.delete(&args[2]).map_err(op_err)?;
    Ok("null".to_string())
}

fn r2_head(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    to_payload(&store.head(&args[2]).map_err(op_err)?)
}

fn r2_list(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let options: ObjectListOptions = serde_json::from_str(&args[2]).map_err(op_err)?;
    to_payload(&store.list(options).map_err(op_err)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SignOptions {
    expires_in: u64,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self { expires_in: 3600 }
    }
}

fn r2_signed_url(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let options: SignOptions = serde_json::from_str(&args[3]).map_err(op_err)?;
    let url = store
        .create_signed_url(&args[2], options.expires_in)
        .map_err(op_err)?;
    to_payload(&url)
}

fn r2_public_url(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    to_payload(&store.public_url(&args[2]).map_err(op_err)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use warren_bindings::MemoryObjectStore;

    fn request_with_storage() -> u64 {
        let mut env = Env::new();
        env.storage
            .insert("BUCKET".into(), Arc::new(MemoryObjectStore::new("test")));
        registry::new_state(Arc::new(env))
    }

    #[test]
    fn put_get_head_round_trip() {
        let id = request_with_storage();
        let rid = id.to_string();

        let meta = r2_put(vec![
            rid.clone(),
            "BUCKET".into(),
            "a.txt".into(),
            base64::encode(b"hello"),
            "{\"contentType\":\"text/plain\"}".into(),
        ])
        .unwrap();
        let meta: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(meta["size"], 5);

        let got = r2_get(vec![rid.clone(), "BUCKET".into(), "a.txt".into()]).unwrap();
        let got: serde_json::Value = serde_json::from_str(&got).unwrap();
        assert_eq!(got["body"], base64::encode(b"hello"));

        let head = r2_head(vec![rid, "BUCKET".into(), "a.txt".into()]).unwrap();
        assert!(head.contains("etag"));
        registry::clear(id);
    }
}
