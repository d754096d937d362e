//! Host request injection and JS response extraction.

use crate::base64;
use crate::error::{RuntimeError, RuntimeResult};
use crate::result::{HostRequest, HostResponse};
use serde::Deserialize;
use std::collections::HashMap;
use warren_engine::Isolate;

/// Marshal the host request into `globalThis.__req` as a JS `Request`.
pub fn inject_request(isolate: &Isolate, request: &HostRequest) -> RuntimeResult<()> {
    let normalized = request.normalized();
    let data = serde_json::to_value(&normalized)
        .map_err(|e| RuntimeError::internal(format!("request encode failed: {e}")))?;
    isolate.set_global_json("__req_data", &data)?;
    isolate.eval_discard(
        "globalThis.__req = __requestFromData(globalThis.__req_data);\n\
         globalThis.__req_data = undefined;",
    )?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseEnvelope {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_is_base64: bool,
    #[serde(default)]
    has_web_socket: bool,
}

fn default_status() -> u16 {
    200
}

/// Read `globalThis.__result` back as a [`HostResponse`]. Must run after the
/// result global has been awaited to its settled value.
pub fn extract_response(isolate: &Isolate) -> RuntimeResult<HostResponse> {
    let raw = isolate
        .eval_json("__extractResponse(globalThis.__result)")
        .map_err(|e| match e {
            // Timeouts and OOM stay fatal; anything else is an extraction
            // failure surfaced in the result.
            e if e.is_fatal() => RuntimeError::Engine(e),
            other => RuntimeError::internal(format!("response extraction failed: {other}")),
        })?;

    let envelope: ResponseEnvelope = serde_json::from_value(raw)
        .map_err(|e| RuntimeError::internal(format!("response envelope corrupt: {e}")))?;

    let body = match envelope.body {
        None => Vec::new(),
        Some(text) if envelope.body_is_base64 => base64::decode(&text)
            .map_err(|e| RuntimeError::internal(format!("response body decode failed: {e}")))?,
        Some(text) => text.into_bytes(),
    };

    Ok(HostResponse {
        status: if envelope.has_web_socket {
            101
        } else {
            envelope.status
        },
        headers: envelope.headers,
        body,
        has_web_socket: envelope.has_web_socket,
    })
}
