//! Per-request environment configuration and the seams it plugs into.

use crate::error::{RuntimeError, RuntimeResult};
use crate::result::{HostRequest, WorkerResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use warren_bindings::{AssetFetcher, DurableStore, KvStore, ObjectStore, QueueSender};

/// Target of a service binding: another worker invoked in-process.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub site: String,
    pub deploy: String,
}

/// Re-enters the orchestrator for service-binding fetches. Implemented by
/// [`crate::Engine`]; callers rarely implement it themselves.
pub trait Dispatcher: Send + Sync {
    fn dispatch(
        &self,
        site: &str,
        deploy: &str,
        env: Env,
        request: HostRequest,
    ) -> RuntimeResult<WorkerResult>;
}

/// Supplies worker source on cache miss.
pub trait SourceLoader: Send + Sync {
    fn load(&self, site: &str, deploy: &str) -> RuntimeResult<Option<String>>;
}

/// Builds an arbitrary per-request JS value for a custom binding. The
/// returned string is a JS expression evaluated inside the isolate; its value
/// becomes `env[name]`.
pub type CustomBinding = Arc<dyn Fn(u64) -> RuntimeResult<String> + Send + Sync>;

/// The binding bundle supplied for one request. Every field is optional;
/// absence means the binding is not present on `env`.
#[derive(Default, Clone)]
pub struct Env {
    /// Plain string properties on `env`.
    pub vars: HashMap<String, String>,
    /// Indistinguishable from vars once projected; kept separate so callers
    /// can reason about what must never leak across service boundaries.
    pub secrets: HashMap<String, String>,
    pub kv: HashMap<String, Arc<dyn KvStore>>,
    pub storage: HashMap<String, Arc<dyn ObjectStore>>,
    pub queues: HashMap<String, Arc<dyn QueueSender>>,
    /// Binding name → database id. Databases live under `d1_data_dir` when
    /// set, in memory otherwise.
    pub d1_bindings: HashMap<String, String>,
    pub durable_objects: HashMap<String, Arc<dyn DurableStore>>,
    pub service_bindings: HashMap<String, ServiceTarget>,
    /// Single asset fetcher projected as `env.ASSETS`.
    pub assets: Option<Arc<dyn AssetFetcher>>,
    pub custom_bindings: HashMap<String, CustomBinding>,
    pub d1_data_dir: Option<PathBuf>,
    /// Set by the orchestrator before execution; must be present exactly
    /// when `service_bindings` is non-empty.
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    /// Set by the orchestrator to the executing site id.
    pub site_id: String,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check internal consistency. The dispatcher requirement is the iff the
    /// service-binding re-entry machinery depends on.
    pub fn validate(&self) -> RuntimeResult<()> {
        if !self.service_bindings.is_empty() && self.dispatcher.is_none() {
            return Err(RuntimeError::InvalidEnv(
                "serviceBindings configured without a dispatcher".to_string(),
            ));
        }
        if self.service_bindings.is_empty() && self.dispatcher.is_some() {
            return Err(RuntimeError::InvalidEnv(
                "dispatcher configured without serviceBindings".to_string(),
            ));
        }
        Ok(())
    }

    /// All binding names that will appear on `env`, for collision checks.
    pub fn binding_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        names.extend(self.vars.keys().map(String::as_str));
        names.extend(self.secrets.keys().map(String::as_str));
        names.extend(self.kv.keys().map(String::as_str));
        names.extend(self.storage.keys().map(String::as_str));
        names.extend(self.queues.keys().map(String::as_str));
        names.extend(self.d1_bindings.keys().map(String::as_str));
        names.extend(self.durable_objects.keys().map(String::as_str));
        names.extend(self.service_bindings.keys().map(String::as_str));
        names.extend(self.custom_bindings.keys().map(String::as_str));
        if self.assets.is_some() {
            names.push("ASSETS");
        }
        names
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("site_id", &self.site_id)
            .field("vars", &self.vars.len())
            .field("secrets", &self.secrets.len())
            .field("kv", &self.kv.keys().collect::<Vec<_>>())
            .field("storage", &self.storage.keys().collect::<Vec<_>>())
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("d1_bindings", &self.d1_bindings)
            .field("durable_objects", &self.durable_objects.keys().collect::<Vec<_>>())
            .field(
                "service_bindings",
                &self.service_bindings.keys().collect::<Vec<_>>(),
            )
            .field("assets", &self.assets.is_some())
            .field("custom_bindings", &self.custom_bindings.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_iff_service_bindings() {
        let mut env = Env::new();
        assert!(env.validate().is_ok());

        env.service_bindings.insert(
            "TARGET".into(),
            ServiceTarget {
                site: "s".into(),
                deploy: "d".into(),
            },
        );
        assert!(env.validate().is_err());
    }
}
