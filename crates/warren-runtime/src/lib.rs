//! warren-runtime - a multi-tenant, serverless-style JavaScript worker
//! runtime.
//!
//! User-supplied ES modules exporting `{ fetch(request, env, ctx) }` are
//! compiled and cached per (site, deploy), executed in pooled QuickJS
//! isolates, and handed an `env` of host-provided bindings: key/value
//! stores, object storage, queues, SQL, durable per-object stores,
//! service-to-service dispatch, asset fetching, plain vars and secrets.
//!
//! # Example
//!
//! ```no_run
//! use warren_runtime::{Engine, EngineConfig, Env, HostRequest};
//!
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.compile_and_cache(
//!     "site",
//!     "deploy",
//!     r#"export default { fetch(req) { return new Response("hello"); } }"#,
//! )?;
//!
//! let engine2 = engine.clone();
//! let result = tokio::task::spawn_blocking(move || {
//!     engine2.execute("site", "deploy", Env::new(), HostRequest::get("http://h/"))
//! })
//! .await??;
//! assert_eq!(result.response.unwrap().body_text(), "hello");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   source cache ── pool cache, both keyed by (site, deploy)   │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐                │
//! │  │ WorkerPool │ │ WorkerPool │ │ WorkerPool │  ...           │
//! │  │ (isolates) │ │ (isolates) │ │ (isolates) │                │
//! │  └────────────┘ └────────────┘ └────────────┘                │
//! └──────────────────────────────────────────────────────────────┘
//!                              ↓ acquire / release
//! ┌──────────────────────────────────────────────────────────────┐
//! │   per-request: registry state ── env install ── __req in     │
//! │   → fetch handler → await __result → extract Response        │
//! │   → drain waitUntil → cleanup script → back to pool          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handler errors never poison a pool; timeouts and heap exhaustion discard
//! the isolate and warm a replacement.

pub mod base64;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod marshal;
pub mod net;
pub mod pool;
pub mod registry;
pub mod result;
pub mod sse;
pub mod transform;

pub use config::EngineConfig;
pub use engine::Engine;
pub use env::{CustomBinding, Dispatcher, Env, ServiceTarget, SourceLoader};
pub use error::{RuntimeError, RuntimeResult};
pub use result::{HostRequest, HostResponse, LogEntry, LogLevel, WorkerResult};
pub use transform::transform_module;

pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::env::{Dispatcher, Env, ServiceTarget, SourceLoader};
    pub use crate::error::{RuntimeError, RuntimeResult};
    pub use crate::result::{HostRequest, HostResponse, LogEntry, LogLevel, WorkerResult};
}
