//! Service-binding fetch: synchronous re-entry into the orchestrator.

use super::{op_err, response_envelope, to_payload};
use crate::env::Env;
use crate::registry;
use crate::result::HostRequest;
use serde::Deserialize;
use std::collections::HashMap;
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![op_sync("__sb_fetch", 3, sb_fetch)]
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

fn sb_fetch(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let target = state
        .env
        .service_bindings
        .get(&args[1])
        .cloned()
        .ok_or_else(|| OpError::new(format!("unknown service binding '{}'", args[1])))?;
    let dispatcher = state
        .env
        .dispatcher
        .clone()
        .ok_or_else(|| OpError::new("service binding has no dispatcher"))?;

    let payload: FetchPayload = serde_json::from_str(&args[2]).map_err(op_err)?;
    let request = HostRequest {
        url: payload.url,
        method: payload.method.unwrap_or_else(|| "GET".to_string()),
        headers: payload.headers,
        body: payload.body,
    };

    // The callee gets a freshly allocated Env with nothing but empty
    // vars/secrets: the caller's bindings and secrets never cross the
    // service boundary.
    let callee_env = Env::new();

    let result = dispatcher
        .dispatch(&target.site, &target.deploy, callee_env, request)
        .map_err(op_err)?;

    if let Some(error) = result.error {
        return Err(OpError::new(error));
    }
    let response = result
        .response
        .ok_or_else(|| OpError::new("service binding target returned no response"))?;

    to_payload(&response_envelope(&response))
}
