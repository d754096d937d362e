//! One sandboxed JavaScript isolate.
//!
//! Wraps an `rquickjs` runtime + context pair and adds the pieces the worker
//! runtime needs: a heap cap, an interrupt-driven wall-clock deadline, JSON
//! global transport, the host-op table, and the cooperative pump that drains
//! microtasks, async-op completions and timers.
//!
//! All JS execution is single-threaded and cooperative: nothing here blocks
//! on concurrent mutation from another thread. An isolate may be moved
//! between threads, but only one thread drives it at a time.

use crate::error::{classify_js_message, EngineError, EngineResult};
use crate::event_loop::EventLoop;
use crate::ops::{AsyncOps, Completion, OpDecl, OpHandler};
use parking_lot::Mutex;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime, Value};
use rquickjs::function::Rest;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PRELUDE_JS: &str = include_str!("prelude.js");

/// Stack cap for user scripts. QuickJS defaults are generous; this keeps a
/// runaway recursion from exhausting the host thread stack.
const MAX_STACK_SIZE: usize = 512 * 1024;

#[derive(Debug, Deserialize)]
struct AwaitState {
    done: bool,
    error: Option<String>,
}

enum AwaitProgress {
    Pending,
    Settled,
    Rejected(String),
}

/// A sandboxed JS engine instance with its own heap and global scope.
pub struct Isolate {
    runtime: Runtime,
    context: Context,
    event_loop: Arc<EventLoop>,
    async_ops: Arc<AsyncOps>,
    deadline: Arc<Mutex<Option<Instant>>>,
    budget_ms: AtomicU64,
    registered: Mutex<HashSet<String>>,
    tokio: tokio::runtime::Handle,
}

impl Isolate {
    /// Create an isolate. A non-zero `heap_limit_bytes` arms the engine's
    /// hard heap cap, with the GC pushed to run from half the limit onwards.
    /// Heap exhaustion surfaces as a fatal error and leaves the isolate
    /// corrupt.
    pub fn new(heap_limit_bytes: usize, tokio: tokio::runtime::Handle) -> EngineResult<Self> {
        let runtime = Runtime::new()
            .map_err(|e| EngineError::fatal(format!("runtime creation failed: {e}")))?;

        if heap_limit_bytes > 0 {
            runtime.set_memory_limit(heap_limit_bytes);
            runtime.set_gc_threshold(heap_limit_bytes / 2);
        }
        runtime.set_max_stack_size(MAX_STACK_SIZE);

        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let watcher = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || match *watcher.lock() {
            Some(armed) => Instant::now() >= armed,
            None => false,
        })));

        let context = Context::full(&runtime)
            .map_err(|e| EngineError::fatal(format!("context creation failed: {e}")))?;

        let isolate = Self {
            runtime,
            context,
            event_loop: Arc::new(EventLoop::new()),
            async_ops: Arc::new(AsyncOps::new()),
            deadline,
            budget_ms: AtomicU64::new(0),
            registered: Mutex::new(HashSet::new()),
            tokio,
        };

        isolate.register_timer_ops()?;
        isolate.eval_discard(PRELUDE_JS)?;
        Ok(isolate)
    }

    /// The tokio handle async ops are spawned on.
    pub fn tokio_handle(&self) -> &tokio::runtime::Handle {
        &self.tokio
    }

    /// Arm the wall-clock guard. Any JS executing past `deadline` is
    /// interrupted; `budget_ms` is only used to label the resulting error.
    pub fn arm_deadline(&self, deadline: Instant, budget_ms: u64) {
        self.budget_ms.store(budget_ms, Ordering::Relaxed);
        *self.deadline.lock() = Some(deadline);
    }

    pub fn disarm_deadline(&self) {
        *self.deadline.lock() = None;
    }

    fn budget_ms(&self) -> u64 {
        self.budget_ms.load(Ordering::Relaxed)
    }

    /// Install a host op as `globalThis[name]`. Registered names are stable
    /// for the isolate's lifetime and survive per-request cleanup.
    pub fn register_op(&self, decl: OpDecl) -> EngineResult<()> {
        {
            let mut registered = self.registered.lock();
            if !registered.insert(decl.name().to_string()) {
                return Err(EngineError::internal(format!(
                    "op already registered: {}",
                    decl.name()
                )));
            }
        }

        let name = decl.name().to_string();
        let arity = decl.arity();
        let handler = decl.handler.clone();
        let async_ops = self.async_ops.clone();
        let tokio = self.tokio.clone();

        self.context.with(|ctx| -> EngineResult<()> {
            let op_name = name.clone();
            let func = Function::new(
                ctx.clone(),
                move |fctx: Ctx<'_>, args: Rest<String>| -> rquickjs::Result<String> {
                    let args = args.0;
                    if args.len() < arity {
                        return Err(rquickjs::Exception::throw_message(
                            &fctx,
                            &format!("{op_name} expects at least {arity} argument(s)"),
                        ));
                    }
                    match &handler {
                        OpHandler::Sync(f) => match f(args) {
                            Ok(payload) => Ok(payload),
                            Err(err) => Err(rquickjs::Exception::throw_message(&fctx, &err.0)),
                        },
                        OpHandler::Async(f) => {
                            let (id, generation, tx) = async_ops.begin();
                            let fut = f(args);
                            tokio.spawn(async move {
                                let result = fut.await;
                                let _ = tx.send(Completion {
                                    id,
                                    generation,
                                    result,
                                });
                            });
                            Ok(id.to_string())
                        }
                    }
                },
            )
            .map_err(|e| EngineError::internal(format!("op '{name}' creation failed: {e}")))?;

            let func = func
                .with_name(&name)
                .map_err(|e| EngineError::internal(format!("op '{name}' naming failed: {e}")))?;

            ctx.globals()
                .set(name.as_str(), func)
                .map_err(|e| EngineError::internal(format!("op '{name}' install failed: {e}")))?;
            Ok(())
        })
    }

    fn register_timer_ops(&self) -> EngineResult<()> {
        let timers = self.event_loop.clone();
        self.register_op(crate::ops::op_sync("__timer_register", 2, move |args| {
            let ms: u64 = args[0]
                .parse()
                .map_err(|_| crate::ops::OpError::new("invalid timer delay"))?;
            let is_interval = args[1] == "1";
            let id = timers.register(Duration::from_millis(ms), is_interval);
            Ok(id.to_string())
        }))?;

        let timers = self.event_loop.clone();
        self.register_op(crate::ops::op_sync("__timer_clear", 1, move |args| {
            if let Ok(id) = args[0].parse::<u64>() {
                timers.clear(id);
            }
            Ok("null".to_string())
        }))
    }

    /// Parse and execute a classic script's top level.
    pub fn compile_and_run(&self, source: &str, label: &str) -> EngineResult<()> {
        debug!(target: "warren::engine", label, bytes = source.len(), "compiling script");
        self.eval_discard(source)
    }

    /// Evaluate a script, discarding its completion value.
    pub fn eval_discard(&self, source: &str) -> EngineResult<()> {
        self.context.with(|ctx| {
            ctx.eval::<(), _>(source)
                .catch(&ctx)
                .map_err(|caught| self.classify(describe_caught(caught)))
        })
    }

    /// Evaluate an expression and return its value as JSON.
    /// `undefined` maps to `null`.
    pub fn eval_json(&self, source: &str) -> EngineResult<serde_json::Value> {
        let text = self.context.with(|ctx| -> EngineResult<Option<String>> {
            let value: Value = ctx
                .eval(source)
                .catch(&ctx)
                .map_err(|caught| self.classify(describe_caught(caught)))?;
            stringify_value(&ctx, value).map_err(|e| self.classify(e))
        })?;
        match text {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| EngineError::internal(format!("bad JSON from engine: {e}"))),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Set a global to a JSON value.
    pub fn set_global_json(&self, name: &str, value: &serde_json::Value) -> EngineResult<()> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| EngineError::internal(format!("encode for '{name}' failed: {e}")))?;
        self.context.with(|ctx| {
            let parsed = ctx
                .json_parse(encoded)
                .catch(&ctx)
                .map_err(|caught| self.classify(describe_caught(caught)))?;
            ctx.globals()
                .set(name, parsed)
                .map_err(|e| EngineError::internal(format!("set '{name}' failed: {e}")))
        })
    }

    /// Read a global as JSON. Missing globals and `undefined` map to `null`.
    pub fn get_global_json(&self, name: &str) -> EngineResult<serde_json::Value> {
        let text = self.context.with(|ctx| -> EngineResult<Option<String>> {
            let value: Value = ctx
                .globals()
                .get(name)
                .map_err(|e| EngineError::internal(format!("get '{name}' failed: {e}")))?;
            stringify_value(&ctx, value).map_err(|e| self.classify(e))
        })?;
        match text {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| EngineError::internal(format!("bad JSON from engine: {e}"))),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Await the value held in the named global. If it is a promise (or any
    /// thenable), pump the event loop until it settles or the deadline
    /// passes; on resolution the global is replaced with the resolved value,
    /// on rejection the reason comes back as an error. Non-thenables settle
    /// after a single microtask turn.
    pub fn await_global(&self, name: &str, deadline: Instant) -> EngineResult<()> {
        if !is_ident(name) {
            return Err(EngineError::internal(format!("bad global name: {name}")));
        }

        self.eval_discard(&format!(
            r#"(() => {{
  const value = globalThis.{name};
  globalThis.__await_state = {{ done: false, error: null }};
  Promise.resolve(value).then(
    (resolved) => {{
      globalThis.{name} = resolved;
      globalThis.__await_state.done = true;
    }},
    (err) => {{
      globalThis.__await_state.error =
        err instanceof Error ? String(err.stack || err.message || err) : String(err);
      globalThis.__await_state.done = true;
    }},
  );
}})()"#
        ))?;

        loop {
            self.pump()?;
            match self.await_progress()? {
                AwaitProgress::Settled => return Ok(()),
                AwaitProgress::Rejected(reason) => {
                    return Err(self.classify(reason));
                }
                AwaitProgress::Pending => {}
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(self.budget_ms()));
            }
            std::thread::sleep(self.wake_delay(deadline));
        }
    }

    fn await_progress(&self) -> EngineResult<AwaitProgress> {
        let state = self.eval_json("JSON.stringify(globalThis.__await_state ?? null)")?;
        let Some(text) = state.as_str() else {
            return Err(EngineError::internal("await state missing"));
        };
        let state: AwaitState = serde_json::from_str(text)
            .map_err(|e| EngineError::internal(format!("await state corrupt: {e}")))?;
        if !state.done {
            return Ok(AwaitProgress::Pending);
        }
        match state.error {
            Some(reason) => Ok(AwaitProgress::Rejected(reason)),
            None => Ok(AwaitProgress::Settled),
        }
    }

    /// One full cooperative turn: microtasks, async-op completions, due
    /// timers (with a microtask drain between fires), repeated until no
    /// progress is made.
    pub fn pump(&self) -> EngineResult<usize> {
        let mut total = 0;
        loop {
            let mut n = self.run_jobs();
            n += self.settle_completions()?;
            n += self.fire_due_timers()?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Pump until no timers, async ops or microtasks remain, or the deadline
    /// passes.
    pub fn drain_event_loop(&self, deadline: Instant) -> EngineResult<()> {
        loop {
            self.pump()?;
            if !self.has_pending_work() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(self.budget_ms()));
            }
            std::thread::sleep(self.wake_delay(deadline));
        }
    }

    pub fn has_pending_work(&self) -> bool {
        self.event_loop.has_pending()
            || self.async_ops.inflight() > 0
            || self.async_ops.has_ready()
            || self.runtime.is_job_pending()
    }

    /// Discard all timers and orphan any async ops still in flight. Stale
    /// completions are fenced off by generation and can never settle a later
    /// request's promises.
    pub fn reset_event_loop(&self) {
        self.event_loop.reset();
        self.async_ops.reset();
    }

    /// Drop the engine. Consumes the isolate; native resources go with it.
    pub fn dispose(self) {
        drop(self);
    }

    fn run_jobs(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                // A job threw; the rejection is observable through the
                // promise it belonged to, so the pump keeps going.
                Err(_) => ran += 1,
            }
        }
        ran
    }

    fn settle_completions(&self) -> EngineResult<usize> {
        let ready = self.async_ops.drain();
        if ready.is_empty() {
            return Ok(0);
        }
        let mut settled = 0;
        for completion in ready {
            let outcome = self.context.with(|ctx| -> Result<(), String> {
                let settle: Function = ctx
                    .globals()
                    .get("__settleOp")
                    .map_err(|e| format!("__settleOp missing: {e}"))?;
                let id = completion.id.to_string();
                let call = match completion.result {
                    Ok(payload) => settle.call::<_, ()>((id, false, payload)),
                    Err(err) => settle.call::<_, ()>((id, true, err.0)),
                };
                call.catch(&ctx).map_err(describe_caught)
            });
            match outcome {
                Ok(()) => settled += 1,
                Err(message) => {
                    let err = self.classify(message);
                    if err.is_fatal() {
                        return Err(err);
                    }
                    warn!(target: "warren::engine", error = %err, "async op settle threw");
                }
            }
            self.run_jobs();
        }
        Ok(settled)
    }

    fn fire_due_timers(&self) -> EngineResult<usize> {
        let due = self.event_loop.take_due(Instant::now());
        if due.is_empty() {
            return Ok(0);
        }
        let mut fired = 0;
        for id in due {
            let outcome = self.context.with(|ctx| -> Result<(), String> {
                let fire: Function = ctx
                    .globals()
                    .get("__fireTimer")
                    .map_err(|e| format!("__fireTimer missing: {e}"))?;
                fire.call::<_, ()>((id.to_string(),))
                    .catch(&ctx)
                    .map_err(describe_caught)
            });
            match outcome {
                Ok(()) => fired += 1,
                Err(message) => {
                    let err = self.classify(message);
                    if err.is_fatal() {
                        return Err(err);
                    }
                    // An uncaught throw in a timer callback does not abort
                    // the pump.
                    warn!(target: "warren::engine", timer = id, error = %err, "timer callback threw");
                }
            }
            self.run_jobs();
        }
        Ok(fired)
    }

    fn wake_delay(&self, deadline: Instant) -> Duration {
        let now = Instant::now();
        let mut wake = deadline;
        if let Some(t) = self.event_loop.next_deadline() {
            wake = wake.min(t);
        }
        if self.async_ops.inflight() > 0 || self.async_ops.has_ready() {
            return Duration::from_millis(1);
        }
        wake.saturating_duration_since(now)
            .clamp(Duration::from_millis(1), Duration::from_millis(10))
    }

    fn classify(&self, message: String) -> EngineError {
        classify_js_message(&message, self.budget_ms())
    }
}

fn stringify_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Option<String>, String> {
    match ctx.json_stringify(value) {
        Ok(Some(text)) => text
            .to_string()
            .map(Some)
            .map_err(|e| format!("stringify failed: {e}")),
        Ok(None) => Ok(None),
        Err(e) => Err(format!("stringify failed: {e}")),
    }
}

fn describe_caught(caught: CaughtError<'_>) -> String {
    match caught {
        CaughtError::Error(e) => e.to_string(),
        CaughtError::Exception(exc) => {
            let message = exc.message().unwrap_or_default();
            match exc.stack() {
                Some(stack) if !stack.is_empty() => format!("{message}\n{stack}"),
                _ => {
                    if message.is_empty() {
                        "unknown exception".to_string()
                    } else {
                        message
                    }
                }
            }
        }
        CaughtError::Value(value) => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .unwrap_or_else(|| "uncaught non-string value".to_string()),
    }
}

fn is_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !name.chars().next().unwrap().is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_validation() {
        assert!(is_ident("__result"));
        assert!(is_ident("$x"));
        assert!(!is_ident("1abc"));
        assert!(!is_ident("a.b"));
        assert!(!is_ident(""));
    }
}
