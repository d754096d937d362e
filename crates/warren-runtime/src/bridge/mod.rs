//! The binding bridge: host ops + per-request env installation.
//!
//! A binding is installed in two halves. The host half (this module tree)
//! registers stable `__kv_*` / `__r2_*` / `__d1_*` / ... ops once per
//! isolate at pool warm-up; each op takes a stringified request id first,
//! resolves per-request state through the registry, finds the backend handle
//! on the request's `Env` and performs the operation. The JS half
//! (`js/bindings.js`) defines factories that the per-request installer calls
//! to place binding objects on `globalThis.__env`.
//!
//! Host-registered functions survive pool recycling; only the per-request
//! globals installed here are swept by the cleanup script.

pub mod assets;
pub mod console;
pub mod d1;
pub mod durable;
pub mod encoding;
pub mod fetch;
pub mod kv;
pub mod queue;
pub mod service;
pub mod sse_ops;
pub mod storage;

use crate::base64;
use crate::env::Env;
use crate::error::{RuntimeError, RuntimeResult};
use crate::result::HostResponse;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use warren_engine::{Isolate, OpError};

const WEBAPI_JS: &str = include_str!("../js/webapi.js");
const BINDINGS_JS: &str = include_str!("../js/bindings.js");

/// Engine-wide settings the bridge ops need.
pub struct BridgeConfig {
    pub allow_private_network: bool,
    pub fetch_timeout: Duration,
    pub max_fetch_response_bytes: usize,
    pub fetch_semaphore: Arc<tokio::sync::Semaphore>,
    pub tokio: tokio::runtime::Handle,
}

/// Convert any displayable backend error into an op error.
pub(crate) fn op_err(e: impl std::fmt::Display) -> OpError {
    OpError::new(e.to_string())
}

/// JSON-encode a value into the string payload an op returns.
pub(crate) fn to_payload<T: serde::Serialize>(value: &T) -> Result<String, OpError> {
    serde_json::to_string(value).map_err(op_err)
}

/// Shape a host response as the JSON envelope the JS side turns back into a
/// `Response`. Text bodies stay text; anything else rides base64.
pub(crate) fn response_envelope(response: &HostResponse) -> serde_json::Value {
    match std::str::from_utf8(&response.body) {
        Ok(text) => json!({
            "status": response.status,
            "statusText": "",
            "headers": response.headers,
            "body": text,
            "bodyIsBase64": false,
        }),
        Err(_) => json!({
            "status": response.status,
            "statusText": "",
            "headers": response.headers,
            "body": base64::encode(&response.body),
            "bodyIsBase64": true,
        }),
    }
}

/// Register every host op and evaluate the warm-up JS (web APIs + binding
/// factories). Run once per isolate, before the user module compiles.
pub fn setup_isolate(isolate: &Isolate, config: &Arc<BridgeConfig>) -> RuntimeResult<()> {
    for op in console::ops() {
        isolate.register_op(op)?;
    }
    for op in encoding::ops() {
        isolate.register_op(op)?;
    }
    for op in kv::ops() {
        isolate.register_op(op)?;
    }
    for op in storage::ops() {
        isolate.register_op(op)?;
    }
    for op in queue::ops() {
        isolate.register_op(op)?;
    }
    for op in d1::ops() {
        isolate.register_op(op)?;
    }
    for op in durable::ops() {
        isolate.register_op(op)?;
    }
    for op in service::ops() {
        isolate.register_op(op)?;
    }
    for op in assets::ops() {
        isolate.register_op(op)?;
    }
    for op in sse_ops::ops(config) {
        isolate.register_op(op)?;
    }
    isolate.register_op(fetch::op(config.clone()))?;

    isolate.eval_discard(WEBAPI_JS)?;
    isolate.eval_discard(BINDINGS_JS)?;
    Ok(())
}

fn js_string(value: &str) -> RuntimeResult<String> {
    serde_json::to_string(value)
        .map_err(|e| RuntimeError::internal(format!("string encoding failed: {e}")))
}

/// Install the configured bindings onto `globalThis.__env` for one request.
/// Assumes `__env` already exists and the factories from `bindings.js` are
/// in scope.
pub fn install_env(isolate: &Isolate, request_id: u64, env: &Env) -> RuntimeResult<()> {
    let mut script = String::new();

    for (name, value) in env.vars.iter().chain(env.secrets.iter()) {
        script.push_str(&format!(
            "globalThis.__env[{}] = {};\n",
            js_string(name)?,
            js_string(value)?
        ));
    }

    for name in env.kv.keys() {
        let n = js_string(name)?;
        script.push_str(&format!("globalThis.__env[{n}] = __makeKvBinding({n});\n"));
    }
    for name in env.storage.keys() {
        let n = js_string(name)?;
        script.push_str(&format!("globalThis.__env[{n}] = __makeStorageBinding({n});\n"));
    }
    for name in env.queues.keys() {
        let n = js_string(name)?;
        script.push_str(&format!("globalThis.__env[{n}] = __makeQueueBinding({n});\n"));
    }
    for name in env.d1_bindings.keys() {
        let n = js_string(name)?;
        script.push_str(&format!("globalThis.__env[{n}] = __makeD1Binding({n});\n"));
    }
    for name in env.durable_objects.keys() {
        let n = js_string(name)?;
        script.push_str(&format!("globalThis.__env[{n}] = __makeDurableBinding({n});\n"));
    }
    for name in env.service_bindings.keys() {
        let n = js_string(name)?;
        script.push_str(&format!("globalThis.__env[{n}] = __makeServiceBinding({n});\n"));
    }
    if env.assets.is_some() {
        script.push_str("globalThis.__env[\"ASSETS\"] = __makeAssetsBinding();\n");
    }
    for (name, builder) in env.custom_bindings.iter() {
        let expression = builder(request_id)?;
        script.push_str(&format!(
            "globalThis.__env[{}] = ({});\n",
            js_string(name)?,
            expression
        ));
    }

    if script.is_empty() {
        return Ok(());
    }
    isolate.eval_discard(&script)?;
    Ok(())
}
