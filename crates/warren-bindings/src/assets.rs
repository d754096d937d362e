//! Static asset fetching contract and the in-memory backend.

use crate::error::BindingResult;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Response produced by an asset fetch.
#[derive(Debug, Clone)]
pub struct AssetResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl AssetResponse {
    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: b"not found".to_vec(),
        }
    }
}

/// Contract an asset backend must satisfy. `path` is the URL path,
/// always starting with `/`.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, path: &str) -> BindingResult<AssetResponse>;
}

/// Asset fetcher over an in-memory path map.
pub struct StaticAssetFetcher {
    files: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl StaticAssetFetcher {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, path: &str, content_type: &str, body: Vec<u8>) {
        self.files
            .write()
            .insert(path.to_string(), (content_type.to_string(), body));
    }
}

impl Default for StaticAssetFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetFetcher for StaticAssetFetcher {
    fn fetch(&self, path: &str) -> BindingResult<AssetResponse> {
        match self.files.read().get(path) {
            Some((content_type, body)) => Ok(AssetResponse {
                status: 200,
                content_type: content_type.clone(),
                body: body.clone(),
            }),
            None => Ok(AssetResponse::not_found()),
        }
    }
}
