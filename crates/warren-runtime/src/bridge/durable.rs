//! Durable-object binding ops.

use super::{op_err, to_payload};
use crate::registry::{self, RequestState};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warren_bindings::DurableStore;
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![
        op_sync("__do_newUniqueId", 2, do_new_unique_id),
        op_sync("__do_fetch", 3, do_fetch),
        op_sync("__do_storage_get", 4, do_storage_get),
        op_sync("__do_storage_put", 5, do_storage_put),
        op_sync("__do_storage_delete", 4, do_storage_delete),
        op_sync("__do_storage_deleteAll", 3, do_storage_delete_all),
        op_sync("__do_storage_list", 4, do_storage_list),
    ]
}

fn store_for(state: &RequestState, name: &str) -> Result<Arc<dyn DurableStore>, OpError> {
    state
        .env
        .durable_objects
        .get(name)
        .cloned()
        .ok_or_else(|| OpError::new(format!("unknown durable object binding '{name}'")))
}

fn do_new_unique_id(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    // Uniqueness within the process: request id + per-request counter +
    // wall clock. 32 lowercase hex chars, matching derived ids.
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let counter = state.next_resource_id();
    let id = format!("{nanos:016x}{:016x}", (state.id << 16) ^ counter);
    to_payload(&id)
}

fn do_fetch(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    store_for(&state, &args[1])?;
    // The configured stores expose storage only; there is no object script
    // to route a request to.
    Err(OpError::new(format!(
        "durable object '{}' does not accept fetch; use its storage API",
        args[2]
    )))
}

fn do_storage_get(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    match store.get(&args[2], &args[3]).map_err(op_err)? {
        Some(value) => to_payload(&json!({ "found": true, "value": value })),
        None => to_payload(&json!({ "found": false, "value": null })),
    }
}

fn do_storage_put(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let value: JsonValue = serde_json::from_str(&args[4]).map_err(op_err)?;
    store.put(&args[2], &args[3], value).map_err(op_err)?;
    Ok("null".to_string())
}

fn do_storage_delete(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let deleted = store.delete(&args[2], &args[3]).map_err(op_err)?;
    to_payload(&deleted)
}

fn do_storage_delete_all(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    store.delete_all(&args[2]).map_err(op_err)?;
    Ok("null".to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListOptions {
    prefix: Option<String>,
    limit: Option<usize>,
}

fn do_storage_list(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let store = store_for(&state, &args[1])?;
    let options: ListOptions = serde_json::from_str(&args[3]).map_err(op_err)?;
    let entries = store
        .list(&args[2], options.prefix.as_deref(), options.limit)
        .map_err(op_err)?;
    to_payload(&entries)
}
