//! Bounded pool of pre-warmed isolates for one (site, deploy).
//!
//! Warm-up runs every setup fn (op registration + web API polyfills), then
//! compiles the transformed worker source and verifies the module was
//! captured. Recycling runs the cleanup script and resets the event loop;
//! faulted isolates are disposed and replaced so the pool stays at size.

use crate::error::{RuntimeError, RuntimeResult};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use warren_engine::Isolate;

const CLEANUP_JS: &str = include_str!("js/cleanup.js");

// Snapshot of the warm-up global set; cleanup sweeps anything added later.
const BASELINE_JS: &str = "globalThis.__baseline_globals = new Set(Object.getOwnPropertyNames(globalThis));\n\
     globalThis.__baseline_globals.add('__baseline_globals');";

/// Binding-independent isolate initializer run once at warm-up.
pub type SetupFn = Arc<dyn Fn(&Isolate) -> RuntimeResult<()> + Send + Sync>;

pub struct WorkerPool {
    ready_tx: Sender<Isolate>,
    ready_rx: Receiver<Isolate>,
    size: usize,
    source: Arc<str>,
    label: String,
    setup: Arc<Vec<SetupFn>>,
    memory_limit_bytes: usize,
    warm_timeout: Duration,
    tokio: tokio::runtime::Handle,
}

impl WorkerPool {
    /// Create a pool and warm `size` isolates. `source` must already be in
    /// classic-script form (the module transform has run).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        size: usize,
        source: Arc<str>,
        label: String,
        setup: Arc<Vec<SetupFn>>,
        memory_limit_bytes: usize,
        warm_timeout: Duration,
        tokio: tokio::runtime::Handle,
    ) -> RuntimeResult<Self> {
        let size = size.max(1);
        let (ready_tx, ready_rx) = bounded(size);
        let pool = Self {
            ready_tx,
            ready_rx,
            size,
            source,
            label,
            setup,
            memory_limit_bytes,
            warm_timeout,
            tokio,
        };

        for _ in 0..size {
            let isolate = pool.warm()?;
            pool.ready_tx
                .send(isolate)
                .map_err(|_| RuntimeError::internal("pool channel closed during warm-up"))?;
        }
        debug!(target: "warren::pool", label = %pool.label, size, "pool warmed");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn warm(&self) -> RuntimeResult<Isolate> {
        let isolate = Isolate::new(self.memory_limit_bytes, self.tokio.clone())
            .map_err(|e| RuntimeError::PoolWarm(e.to_string()))?;

        for setup in self.setup.iter() {
            setup(&isolate).map_err(|e| RuntimeError::PoolWarm(e.to_string()))?;
        }

        // A top-level infinite loop in user source must not hang warm-up.
        isolate.arm_deadline(
            Instant::now() + self.warm_timeout,
            self.warm_timeout.as_millis() as u64,
        );
        let compiled = isolate.compile_and_run(&self.source, &self.label);
        isolate.disarm_deadline();
        compiled.map_err(|e| RuntimeError::PoolWarm(e.to_string()))?;

        let captured = isolate
            .eval_json(
                "globalThis.__worker_module__ !== null && \
                 ['object', 'function'].includes(typeof globalThis.__worker_module__)",
            )
            .map_err(|e| RuntimeError::PoolWarm(e.to_string()))?;
        if captured != serde_json::Value::Bool(true) {
            return Err(RuntimeError::PoolWarm(
                "source did not produce a default export".to_string(),
            ));
        }

        isolate
            .eval_discard(BASELINE_JS)
            .map_err(|e| RuntimeError::PoolWarm(e.to_string()))?;

        Ok(isolate)
    }

    /// Block until an isolate is available.
    pub fn acquire(&self) -> RuntimeResult<Isolate> {
        self.ready_rx
            .recv()
            .map_err(|_| RuntimeError::internal("pool disposed"))
    }

    /// Return a healthy isolate: sweep per-request globals, reset the event
    /// loop, requeue. A cleanup failure demotes the isolate to the faulted
    /// path.
    pub fn release(&self, isolate: Isolate) {
        if let Err(e) = isolate.eval_discard(CLEANUP_JS) {
            warn!(target: "warren::pool", label = %self.label, error = %e, "cleanup failed; replacing isolate");
            self.release_faulted(isolate);
            return;
        }
        isolate.reset_event_loop();

        match self.ready_tx.try_send(isolate) {
            Ok(()) => {}
            Err(TrySendError::Full(isolate)) | Err(TrySendError::Disconnected(isolate)) => {
                // Should not happen under correct sizing; dispose rather
                // than block.
                warn!(target: "warren::pool", label = %self.label, "pool overfull on release");
                isolate.dispose();
            }
        }
    }

    /// Discard a corrupt isolate (timeout, OOM, crashed engine) and warm a
    /// replacement so the pool stays at full size.
    pub fn release_faulted(&self, isolate: Isolate) {
        isolate.dispose();
        match self.warm() {
            Ok(fresh) => {
                if self.ready_tx.try_send(fresh).is_err() {
                    warn!(target: "warren::pool", label = %self.label, "pool overfull on fault replacement");
                }
            }
            Err(e) => {
                // The pool shrinks; the next acquire on an empty pool blocks
                // until another release.
                error!(target: "warren::pool", label = %self.label, error = %e, "failed to warm replacement isolate");
            }
        }
    }

    /// Dispose every idle isolate. In-flight isolates die at their release
    /// (the channel stays open; they are dropped on overfull try_send only
    /// if warranted).
    pub fn dispose(&self) {
        for isolate in self.ready_rx.try_iter() {
            isolate.dispose();
        }
        debug!(target: "warren::pool", label = %self.label, "pool disposed");
    }
}
