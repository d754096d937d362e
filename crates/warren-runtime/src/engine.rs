//! The engine orchestrator: source cache, pool cache, and the per-request
//! execution state machine.

use crate::bridge::{self, BridgeConfig};
use crate::config::EngineConfig;
use crate::env::{Dispatcher, Env, SourceLoader};
use crate::error::{RuntimeError, RuntimeResult};
use crate::marshal;
use crate::pool::{SetupFn, WorkerPool};
use crate::registry;
use crate::result::{HostRequest, HostResponse, LogLevel, WorkerResult};
use crate::transform::transform_module;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use warren_engine::Isolate;

type PoolKey = (String, String);

/// Top-level entry point: compiles and caches worker sources per
/// (site, deploy), owns the isolate pools, and drives request execution.
///
/// Create with [`Engine::new`] inside a tokio runtime; share as `Arc`.
pub struct Engine {
    config: EngineConfig,
    setup: Arc<Vec<SetupFn>>,
    pools: DashMap<PoolKey, Arc<WorkerPool>>,
    sources: DashMap<PoolKey, Arc<str>>,
    loader: RwLock<Option<Arc<dyn SourceLoader>>>,
    validator: Mutex<Option<Isolate>>,
    self_ref: Weak<Engine>,
    tokio: tokio::runtime::Handle,
}

enum Invocation<'a> {
    Fetch(&'a HostRequest),
    Scheduled(serde_json::Value),
    Tail(serde_json::Value),
}

impl Engine {
    /// Create an engine on the current tokio runtime.
    pub fn new(config: EngineConfig) -> RuntimeResult<Arc<Self>> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            RuntimeError::internal("Engine::new must be called inside a tokio runtime")
        })?;
        Ok(Self::new_with_handle(config, handle))
    }

    /// Create an engine bound to an explicit tokio handle.
    pub fn new_with_handle(
        config: EngineConfig,
        handle: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let bridge = Arc::new(BridgeConfig {
            allow_private_network: config.allow_private_network,
            fetch_timeout: config.fetch_timeout,
            max_fetch_response_bytes: config.max_fetch_response_bytes,
            fetch_semaphore: Arc::new(tokio::sync::Semaphore::new(
                config.max_inflight_fetches.max(1),
            )),
            tokio: handle.clone(),
        });

        let setup_bridge = bridge.clone();
        let setup_fn: SetupFn = Arc::new(move |isolate: &Isolate| {
            bridge::setup_isolate(isolate, &setup_bridge)
        });
        let setup = Arc::new(vec![setup_fn]);

        Arc::new_cyclic(|weak| Engine {
            config,
            setup,
            pools: DashMap::new(),
            sources: DashMap::new(),
            loader: RwLock::new(None),
            validator: Mutex::new(None),
            self_ref: weak.clone(),
            tokio: handle,
        })
    }

    /// Install a loader consulted on source-cache misses.
    pub fn set_source_loader(&self, loader: Arc<dyn SourceLoader>) {
        *self.loader.write() = Some(loader);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and cache source for (site, deploy); any existing pool for
    /// the key is invalidated. Returns the bytes stored.
    pub fn compile_and_cache(
        &self,
        site: &str,
        deploy: &str,
        source: &str,
    ) -> RuntimeResult<Vec<u8>> {
        let transformed = transform_module(source);
        self.validate_source(&transformed)?;

        let key = (site.to_string(), deploy.to_string());
        self.sources.insert(key.clone(), Arc::from(source));
        if let Some((_, pool)) = self.pools.remove(&key) {
            pool.dispose();
        }
        debug!(target: "warren::engine", site, deploy, bytes = source.len(), "source cached");
        Ok(source.as_bytes().to_vec())
    }

    /// Ensure source for (site, deploy) is available, consulting the loader
    /// on miss.
    pub fn ensure_source(&self, site: &str, deploy: &str) -> RuntimeResult<()> {
        let key = (site.to_string(), deploy.to_string());
        if self.sources.contains_key(&key) {
            return Ok(());
        }
        let loader = self.loader.read().clone();
        if let Some(loader) = loader {
            if let Some(source) = loader.load(site, deploy)? {
                self.compile_and_cache(site, deploy, &source)?;
                return Ok(());
            }
        }
        Err(RuntimeError::NoSource {
            site: site.to_string(),
            deploy: deploy.to_string(),
        })
    }

    /// Discard the pool and cached source for (site, deploy).
    pub fn invalidate_pool(&self, site: &str, deploy: &str) {
        let key = (site.to_string(), deploy.to_string());
        if let Some((_, pool)) = self.pools.remove(&key) {
            pool.dispose();
        }
        self.sources.remove(&key);
    }

    /// Dispose every pool. Cached sources stay; pools rewarm on demand.
    pub fn shutdown(&self) {
        let keys: Vec<PoolKey> = self.pools.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.dispose();
            }
        }
    }

    /// Execute the worker's `fetch` handler against `request`. Blocking:
    /// call from a blocking-friendly thread (`spawn_blocking` under tokio).
    pub fn execute(
        &self,
        site: &str,
        deploy: &str,
        env: Env,
        request: HostRequest,
    ) -> RuntimeResult<WorkerResult> {
        self.run(site, deploy, env, Invocation::Fetch(&request))
    }

    /// Execute the worker's `scheduled` handler with a synthesized event.
    pub fn execute_scheduled(
        &self,
        site: &str,
        deploy: &str,
        env: Env,
        cron: &str,
    ) -> RuntimeResult<WorkerResult> {
        let scheduled_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let event = json!({
            "type": "scheduled",
            "cron": cron,
            "scheduledTime": scheduled_time,
        });
        self.run(site, deploy, env, Invocation::Scheduled(event))
    }

    /// Execute the worker's `tail` handler with a batch of trace events.
    pub fn execute_tail(
        &self,
        site: &str,
        deploy: &str,
        env: Env,
        events: serde_json::Value,
    ) -> RuntimeResult<WorkerResult> {
        self.run(site, deploy, env, Invocation::Tail(events))
    }

    fn run(
        &self,
        site: &str,
        deploy: &str,
        mut env: Env,
        invocation: Invocation<'_>,
    ) -> RuntimeResult<WorkerResult> {
        let started = Instant::now();

        self.ensure_source(site, deploy)?;

        env.site_id = site.to_string();
        env.dispatcher = if env.service_bindings.is_empty() {
            None
        } else {
            let dispatcher: Arc<dyn Dispatcher> = self.self_arc()?;
            Some(dispatcher)
        };
        env.validate()?;

        // Everything fallible is done; from here the isolate always goes
        // back to its pool, clean or faulted.
        let pool = self.pool_for(site, deploy)?;
        let isolate = pool.acquire()?;

        let env = Arc::new(env);
        let request_id = registry::new_state(env.clone());
        // Backstop: the registry entry dies with this scope no matter how we
        // leave it.
        let registry_guard = scopeguard::guard(request_id, |id| {
            registry::clear(id);
        });

        let deadline = Instant::now() + self.config.execution_timeout;
        let budget_ms = self.config.execution_timeout.as_millis() as u64;

        let outcome = self.run_request(&isolate, request_id, &env, &invocation, deadline, budget_ms);

        isolate.disarm_deadline();
        let logs = registry::get(request_id)
            .map(|state| state.take_logs())
            .unwrap_or_default();
        drop(registry_guard);

        let (response, error, fatal) = match outcome {
            Ok(response) => (response, None, false),
            Err(e) => {
                let fatal = is_fatal(&e);
                (None, Some(e.to_string()), fatal)
            }
        };

        if fatal {
            warn!(target: "warren::engine", site, deploy, error = ?error, "isolate faulted; replacing");
            pool.release_faulted(isolate);
        } else {
            pool.release(isolate);
        }

        Ok(WorkerResult {
            response,
            error,
            logs,
            duration: started.elapsed(),
        })
    }

    fn run_request(
        &self,
        isolate: &Isolate,
        request_id: u64,
        env: &Env,
        invocation: &Invocation<'_>,
        deadline: Instant,
        budget_ms: u64,
    ) -> RuntimeResult<Option<HostResponse>> {
        isolate.arm_deadline(deadline, budget_ms);

        isolate.eval_discard(&format!(
            "globalThis.__requestID = {request_id};\n\
             globalThis.__env = {{}};\n\
             globalThis.__ctx = __makeCtx();"
        ))?;
        bridge::install_env(isolate, request_id, env)?;

        let invoke = match invocation {
            Invocation::Fetch(request) => {
                marshal::inject_request(isolate, request)?;
                "globalThis.__result = (() => {\n\
                   const mod = globalThis.__worker_module__;\n\
                   if (!mod || typeof mod.fetch !== 'function') {\n\
                     throw new Error('worker module has no fetch handler');\n\
                   }\n\
                   return mod.fetch(globalThis.__req, globalThis.__env, globalThis.__ctx);\n\
                 })();"
            }
            Invocation::Scheduled(event) => {
                isolate.set_global_json("__event", event)?;
                "globalThis.__result = (() => {\n\
                   const mod = globalThis.__worker_module__;\n\
                   if (!mod || typeof mod.scheduled !== 'function') {\n\
                     throw new Error('worker module has no scheduled handler');\n\
                   }\n\
                   return mod.scheduled(globalThis.__event, globalThis.__env, globalThis.__ctx);\n\
                 })();"
            }
            Invocation::Tail(events) => {
                isolate.set_global_json("__event", events)?;
                "globalThis.__result = (() => {\n\
                   const mod = globalThis.__worker_module__;\n\
                   if (!mod || typeof mod.tail !== 'function') {\n\
                     throw new Error('worker module has no tail handler');\n\
                   }\n\
                   return mod.tail(globalThis.__event, globalThis.__env, globalThis.__ctx);\n\
                 })();"
            }
        };

        let handler_outcome: RuntimeResult<Option<HostResponse>> =
            match isolate.eval_discard(invoke) {
                Err(e) => Err(e.into()),
                Ok(()) => match isolate.await_global("__result", deadline) {
                    Err(e) => Err(e.into()),
                    Ok(()) => match invocation {
                        Invocation::Fetch(_) => marshal::extract_response(isolate).map(Some),
                        Invocation::Scheduled(_) | Invocation::Tail(_) => Ok(None),
                    },
                },
            };

        // waitUntil promises drain even when the handler threw; only a
        // corrupted isolate skips them.
        let skip_drain = matches!(&handler_outcome, Err(e) if is_fatal(e));
        if !skip_drain {
            match self.drain_wait_until(isolate, request_id, deadline) {
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(target: "warren::engine", error = %e, "waitUntil drain failed");
                }
                Ok(()) => {}
            }
        }

        handler_outcome
    }

    fn drain_wait_until(
        &self,
        isolate: &Isolate,
        request_id: u64,
        deadline: Instant,
    ) -> RuntimeResult<()> {
        let pending = isolate.eval_json("(globalThis.__waitUntil || []).length")?;
        if pending.as_u64().unwrap_or(0) == 0 {
            return Ok(());
        }

        isolate.eval_discard(
            "globalThis.__wu_result = Promise.allSettled(globalThis.__waitUntil || []);",
        )?;
        isolate.await_global("__wu_result", deadline)?;

        let rejections = isolate.eval_json(
            "(globalThis.__wu_result || [])\n\
               .filter((r) => r.status === 'rejected')\n\
               .map((r) => String(r.reason && r.reason.message ? r.reason.message : r.reason))",
        )?;
        if let Some(reasons) = rejections.as_array() {
            if let Some(state) = registry::get(request_id) {
                for reason in reasons {
                    state.log(
                        LogLevel::Error,
                        format!(
                            "waitUntil rejected: {}",
                            reason.as_str().unwrap_or("unknown reason")
                        ),
                    );
                }
            }
        }
        Ok(())
    }

    fn pool_for(&self, site: &str, deploy: &str) -> RuntimeResult<Arc<WorkerPool>> {
        let key = (site.to_string(), deploy.to_string());
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }

        let source = self
            .sources
            .get(&key)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| RuntimeError::NoSource {
                site: site.to_string(),
                deploy: deploy.to_string(),
            })?;
        let transformed: Arc<str> = Arc::from(transform_module(&source));
        let label = format!("{site}/{deploy}");

        let entry = self
            .pools
            .entry(key)
            .or_try_insert_with(|| {
                WorkerPool::new(
                    self.config.pool_size,
                    transformed,
                    label,
                    self.setup.clone(),
                    self.config.memory_limit_bytes(),
                    self.config.execution_timeout,
                    self.tokio.clone(),
                )
                .map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    fn self_arc(&self) -> RuntimeResult<Arc<Engine>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| RuntimeError::internal("engine dropped"))
    }

    /// Parse-check a transformed source without executing it. `new Function`
    /// compiles the text as a classic-script function body, which matches
    /// the execution model the pool uses.
    fn validate_source(&self, transformed: &str) -> RuntimeResult<()> {
        let mut guard = self.validator.lock();
        if guard.is_none() {
            *guard = Some(
                Isolate::new(0, self.tokio.clone())
                    .map_err(|e| RuntimeError::internal(format!("validator setup failed: {e}")))?,
            );
        }
        let Some(isolate) = guard.as_ref() else {
            return Err(RuntimeError::internal("validator unavailable"));
        };
        let encoded = serde_json::to_string(transformed)
            .map_err(|e| RuntimeError::internal(format!("source encoding failed: {e}")))?;
        isolate
            .eval_discard(&format!("new Function({encoded}); void 0;"))
            .map_err(|e| RuntimeError::Compile(e.to_string()))
    }
}

impl Dispatcher for Engine {
    fn dispatch(
        &self,
        site: &str,
        deploy: &str,
        env: Env,
        request: HostRequest,
    ) -> RuntimeResult<WorkerResult> {
        self.execute(site, deploy, env, request)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_fatal(error: &RuntimeError) -> bool {
    matches!(error, RuntimeError::Engine(e) if e.is_fatal())
}
