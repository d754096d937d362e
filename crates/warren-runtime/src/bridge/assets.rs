//! Asset-fetcher binding op.

use super::{op_err, to_payload};
use crate::registry;
use crate::result::HostResponse;
use serde::Deserialize;
use std::collections::HashMap;
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![op_sync("__assets_fetch", 2, assets_fetch)]
}

#[derive(Debug, Deserialize)]
struct AssetPayload {
    url: String,
}

fn assets_fetch(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let fetcher = state
        .env
        .assets
        .clone()
        .ok_or_else(|| OpError::new("no assets binding configured"))?;

    let payload: AssetPayload = serde_json::from_str(&args[1]).map_err(op_err)?;
    let path = if payload.url.starts_with('/') {
        payload.url
    } else {
        url::Url::parse(&payload.url)
            .map(|u| u.path().to_string())
            .unwrap_or(payload.url)
    };

    let asset = fetcher.fetch(&path).map_err(op_err)?;
    let mut headers = HashMap::new();
    headers.insert("content-type".to_string(), asset.content_type);
    let response = HostResponse {
        status: asset.status,
        headers,
        body: asset.body,
        has_web_socket: false,
    };
    to_payload(&super::response_envelope(&response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use std::sync::Arc;
    use warren_bindings::StaticAssetFetcher;

    #[test]
    fn url_paths_are_resolved() {
        let assets = StaticAssetFetcher::new();
        assets.insert("/app.js", "text/javascript", b"1;".to_vec());
        let mut env = Env::new();
        env.assets = Some(Arc::new(assets));
        let id = registry::new_state(Arc::new(env));

        let out = assets_fetch(vec![
            id.to_string(),
            "{\"url\":\"https://h/app.js\"}".into(),
        ])
        .unwrap();
        let out: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(out["status"], 200);
        assert_eq!(out["body"], "1;");
        registry::clear(id);
    }
}
