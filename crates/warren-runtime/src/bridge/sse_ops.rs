//! EventSource ops: connect, poll, close.

use super::{op_err, to_payload, BridgeConfig};
use crate::registry;
use crate::sse;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops(config: &Arc<BridgeConfig>) -> Vec<OpDecl> {
    let connect_config = config.clone();
    vec![
        op_sync("__eventSourceConnect", 2, move |args| {
            es_connect(&connect_config, args)
        }),
        op_sync("__eventSourcePoll", 2, es_poll),
        op_sync("__eventSourceClose", 2, es_close),
    ]
}

#[derive(Debug, Deserialize)]
struct ConnectPayload {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

fn es_connect(config: &Arc<BridgeConfig>, args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let payload: ConnectPayload = serde_json::from_str(&args[1]).map_err(op_err)?;

    let id = sse::connect(
        &state,
        &payload.url,
        payload.headers.into_iter().collect(),
        config.allow_private_network,
        &config.tokio,
    )
    .map_err(OpError::new)?;

    to_payload(&json!({ "id": id }))
}

fn es_poll(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let id: u64 = args[1]
        .parse()
        .map_err(|_| OpError::new("bad connection id"))?;
    let connection = state
        .sse(id)
        .ok_or_else(|| OpError::new(format!("no EventSource connection {id}")))?;

    to_payload(&json!({
        "state": connection.state_str(),
        "events": connection.poll(),
    }))
}

fn es_close(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let id: u64 = args[1]
        .parse()
        .map_err(|_| OpError::new("bad connection id"))?;
    if let Some(connection) = state.remove_sse(id) {
        connection.close();
    }
    Ok("null".to_string())
}
