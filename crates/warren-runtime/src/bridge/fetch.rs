//! Outbound `fetch()` op.
//!
//! The only async op in the bridge: the request runs on the engine's tokio
//! handle while the isolate keeps pumping its event loop, and the JS-side
//! Promise settles through the completion queue. In-flight calls are capped
//! engine-wide by a semaphore; response bodies are capped by size.

use super::{op_err, BridgeConfig};
use crate::base64;
use crate::net::ensure_public_target;
use crate::registry;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use warren_engine::{op_async, OpDecl, OpError, OpResult};

pub fn op(config: Arc<BridgeConfig>) -> OpDecl {
    op_async("__fetch", 2, move |args| {
        let config = config.clone();
        async move { fetch_impl(config, args).await }
    })
}

#[derive(Debug, Deserialize)]
struct FetchPayload {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

async fn fetch_impl(config: Arc<BridgeConfig>, args: Vec<String>) -> OpResult {
    // The request must still be live when the fetch starts.
    registry::resolve(&args[0])?;

    let payload: FetchPayload = serde_json::from_str(&args[1]).map_err(op_err)?;
    let url = ensure_public_target(&payload.url, config.allow_private_network)
        .map_err(OpError::new)?;

    let _permit = config
        .fetch_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| OpError::new("engine shutting down"))?;

    let method = payload.method.as_deref().unwrap_or("GET").to_uppercase();
    debug!(target: "warren::fetch", url = %url, method = %method, "outbound fetch");

    let client = reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .build()
        .map_err(|e| OpError::new(format!("client setup failed: {e}")))?;

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| OpError::new(format!("unsupported HTTP method '{method}'")))?;

    let mut request = client.request(method, url);
    for (name, value) in payload.headers {
        request = request.header(name, value);
    }
    if let Some(body) = payload.body {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| OpError::new(format!("fetch failed: {e}")))?;

    let status = response.status().as_u16();
    let status_text = response
        .status()
        .canonical_reason()
        .unwrap_or("")
        .to_string();

    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), v.to_string());
        }
    }

    let mut body = Vec::new();
    let mut response = response;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| OpError::new(format!("body read failed: {e}")))?
    {
        if body.len() + chunk.len() > config.max_fetch_response_bytes {
            return Err(OpError::new(format!(
                "response exceeds {} byte limit",
                config.max_fetch_response_bytes
            )));
        }
        body.extend_from_slice(&chunk);
    }

    let envelope = match String::from_utf8(body) {
        Ok(text) => json!({
            "status": status,
            "statusText": status_text,
            "headers": headers,
            "body": text,
            "bodyIsBase64": false,
        }),
        Err(raw) => json!({
            "status": status,
            "statusText": status_text,
            "headers": headers,
            "body": base64::encode(raw.as_bytes()),
            "bodyIsBase64": true,
        }),
    };

    serde_json::to_string(&envelope).map_err(op_err)
}
