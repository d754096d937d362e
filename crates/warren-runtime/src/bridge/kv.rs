//! KV binding ops.

use super::{op_err, to_payload};
use crate::registry::{self, RequestState};
use std::sync::Arc;
use warren_bindings::{KvListOptions, KvPutOptions, KvStore};
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![
        op_sync("__kv_get", 3, kv_get),
        op_sync("__kv_getWithMetadata", 3, kv_get_with_metadata),
        op_sync("__kv_put", 5, kv_put),
        op_sync("__kv_delete", 3, kv_delete),
        op_sync("__kv_list", 3, kv_list),
    ]
}

fn store_for(state: &RequestState, name: &str) -> Result<Arc<dyn KvStore>, OpError> {
    state
        .env
        .kv
        .get(name)
        .cloned()
        .ok_or_else(|| OpError::new(format!("unknown KV binding '{name}'")))
}

fn kv_get(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let value = store.get(&args[2]).map_err(op_err)?;
    to_payload(&value)
}

fn kv_get_with_metadata(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let entry = store.get_with_metadata(&args[2]).map_err(op_err)?;
    to_payload(&entry)
}

fn kv_put(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let options: KvPutOptions = serde_json::from_str(&args[4]).map_err(op_err)?;
    store
        .put(&args[2], args[3].clone(), options)
        .map_err(op_err)?;
    Ok("null".to_string())
}

fn kv_delete(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    store.delete(&args[2]).map_err(op_err)?;
    Ok("null".to_string())
}

fn kv_list(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let options: KvListOptions = serde_json::from_str(&args[2]).map_err(op_err)?;
    let listed = store.list(options).map_err(op_err)?;
    to_payload(&listed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use warren_bindings::MemoryKvStore;

    fn request_with_kv() -> u64 {
        let mut env = Env::new();
        env.kv.insert("KV".into(), Arc::new(MemoryKvStore::new()));
        registry::new_state(Arc::new(env))
    }

    #[test]
    fn put_then_get() {
        let id = request_with_kv();
        let rid = id.to_string();
        kv_put(vec![
            rid.clone(),
            "KV".into(),
            "a".into(),
            "1".into(),
            "{}".into(),
        ])
        .unwrap();
        let got = kv_get(vec![rid.clone(), "KV".into(), "a".into()]).unwrap();
        assert_eq!(got, "\"1\"");
        let missing = kv_get(vec![rid, "KV".into(), "zzz".into()]).unwrap();
        assert_eq!(missing, "null");
        registry::clear(id);
    }

    #[test]
    fn unknown_binding_errors() {
        let id = request_with_kv();
        let err = kv_get(vec![id.to_string(), "NOPE".into(), "a".into()]).unwrap_err();
        assert!(err.to_string().contains("unknown KV binding"));
        registry::clear(id);
    }
}
