//! Typed host-op registration.
//!
//! Host-callable functions are declared as [`OpDecl`]s: a stable global name,
//! a minimum arity, and a sync or async closure. Arguments cross the boundary
//! as UTF-8 strings (the callers JSON-encode anything structured) and results
//! come back as strings; a failed op is rethrown on the JS side as an `Error`.
//!
//! Async ops do not block the isolate: dispatch allocates an op id, spawns
//! the future on the engine's tokio handle, and hands the id back to JS,
//! where the prelude's `__awaitOp(id)` turns it into a Promise. Completed
//! futures push into a crossbeam queue that the isolate pump drains, settling
//! each Promise through `__settleOp`.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Error raised by an op handler; surfaces in JS as a thrown `Error` whose
/// message is the payload (sync ops) or a rejected Promise (async ops).
#[derive(Debug, Clone)]
pub struct OpError(pub String);

impl OpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for OpError {}

impl From<String> for OpError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for OpError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for OpError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Result of one op invocation. Async op payloads must be JSON text; the
/// prelude parses them before resolving.
pub type OpResult = Result<String, OpError>;
pub type OpFuture = Pin<Box<dyn Future<Output = OpResult> + Send + 'static>>;

#[derive(Clone)]
pub enum OpHandler {
    Sync(Arc<dyn Fn(Vec<String>) -> OpResult + Send + Sync>),
    Async(Arc<dyn Fn(Vec<String>) -> OpFuture + Send + Sync>),
}

/// A named host op: `globalThis[name]` after registration.
#[derive(Clone)]
pub struct OpDecl {
    pub(crate) name: String,
    pub(crate) arity: usize,
    pub(crate) handler: OpHandler,
}

impl OpDecl {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }
}

/// Declare a synchronous op.
pub fn op_sync<F>(name: &str, arity: usize, handler: F) -> OpDecl
where
    F: Fn(Vec<String>) -> OpResult + Send + Sync + 'static,
{
    OpDecl {
        name: name.to_string(),
        arity,
        handler: OpHandler::Sync(Arc::new(handler)),
    }
}

/// Declare an asynchronous op. The handler's future runs on the isolate's
/// tokio handle; its JSON result settles the JS-side Promise.
pub fn op_async<F, Fut>(name: &str, arity: usize, handler: F) -> OpDecl
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OpResult> + Send + 'static,
{
    OpDecl {
        name: name.to_string(),
        arity,
        handler: OpHandler::Async(Arc::new(move |args| Box::pin(handler(args)))),
    }
}

pub(crate) struct Completion {
    pub id: u64,
    pub generation: u64,
    pub result: OpResult,
}

/// Tracks async ops in flight for one isolate.
///
/// `generation` fences recycling: ops spawned before an event-loop reset may
/// still complete afterwards, and their completions must neither settle a
/// Promise of the next request nor count as pending work.
pub(crate) struct AsyncOps {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    next_id: AtomicU64,
    inflight: AtomicU64,
    generation: AtomicU64,
}

impl AsyncOps {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            next_id: AtomicU64::new(1),
            inflight: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Allocate an op id and a sender bound to the current generation.
    pub fn begin(&self) -> (u64, u64, Sender<Completion>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::Acquire);
        self.inflight.fetch_add(1, Ordering::Relaxed);
        (id, generation, self.tx.clone())
    }

    /// Drain ready completions belonging to the current generation.
    pub fn drain(&self) -> Vec<Completion> {
        let generation = self.generation.load(Ordering::Acquire);
        let mut ready = Vec::new();
        for completion in self.rx.try_iter() {
            if completion.generation == generation {
                self.inflight.fetch_sub(1, Ordering::Relaxed);
                ready.push(completion);
            }
        }
        ready
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn has_ready(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Abandon everything in flight; stale completions are dropped on the
    /// next drain because their generation no longer matches.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.inflight.store(0, Ordering::Relaxed);
        for _ in self.rx.try_iter() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_op_runs() {
        let op = op_sync("__echo", 1, |args| Ok(args[0].clone()));
        match op.handler {
            OpHandler::Sync(f) => assert_eq!(f(vec!["hi".into()]).unwrap(), "hi"),
            _ => panic!("expected sync handler"),
        }
    }

    #[test]
    fn stale_completions_are_fenced() {
        let ops = AsyncOps::new();
        let (id, generation, tx) = ops.begin();
        ops.reset();
        tx.send(Completion {
            id,
            generation,
            result: Ok("late".into()),
        })
        .unwrap();
        assert!(ops.drain().is_empty());
        assert_eq!(ops.inflight(), 0);
    }

    #[test]
    fn current_generation_completions_arrive() {
        let ops = AsyncOps::new();
        let (id, generation, tx) = ops.begin();
        tx.send(Completion {
            id,
            generation,
            result: Ok("\"ok\"".into()),
        })
        .unwrap();
        let ready = ops.drain();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, id);
        assert_eq!(ops.inflight(), 0);
    }
}
