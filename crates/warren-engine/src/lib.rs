//! warren-engine - QuickJS isolate abstraction for warren.
//!
//! This crate provides the engine substrate the worker runtime is built on:
//! sandboxed, single-threaded JS isolates with heap caps, interrupt-driven
//! wall-clock deadlines, a typed host-op table, and a cooperative event loop
//! (timers + microtasks + async-op completions) pumped from the host.
//!
//! # Example
//!
//! ```no_run
//! use warren_engine::{Isolate, op_sync};
//!
//! # fn main() -> Result<(), warren_engine::EngineError> {
//! # let handle = tokio::runtime::Handle::current();
//! let isolate = Isolate::new(64 * 1024 * 1024, handle)?;
//! isolate.register_op(op_sync("__greet", 1, |args| Ok(format!("hello {}", args[0]))))?;
//! isolate.eval_discard("globalThis.out = __greet('worker');")?;
//! assert_eq!(isolate.get_global_json("out")?, serde_json::json!("hello worker"));
//! # Ok(())
//! # }
//! ```
//!
//! # Failure model
//!
//! Any operation may return a fatal error ([`EngineError::is_fatal`]) —
//! timeout, heap exhaustion, broken runtime. A fatal error means the isolate
//! is corrupt and must be discarded, never returned to a pool.

pub mod error;
pub mod event_loop;
pub mod isolate;
pub mod ops;

pub use error::{EngineError, EngineResult};
pub use event_loop::{EventLoop, MIN_INTERVAL};
pub use isolate::Isolate;
pub use ops::{op_async, op_sync, OpDecl, OpError, OpResult};
