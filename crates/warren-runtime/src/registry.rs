//! Process-wide per-request state registry.
//!
//! Host ops are invoked from inside JS with only a stringified request id to
//! go on; this registry maps that id back to the request's environment, logs
//! and open resources. Shared-readers / exclusive-writer: readers are host
//! ops firing during the await pump, writers are the orchestrator at state
//! creation and teardown.

use crate::env::Env;
use crate::result::{LogEntry, LogLevel};
use crate::sse::SseConnection;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// State owned by one in-flight request.
pub struct RequestState {
    pub id: u64,
    pub env: Arc<Env>,
    logs: Mutex<Vec<LogEntry>>,
    sse: Mutex<HashMap<u64, Arc<SseConnection>>>,
    next_resource_id: AtomicU64,
}

impl RequestState {
    pub fn log(&self, level: LogLevel, message: String) {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.logs.lock().push(LogEntry {
            level,
            message,
            time,
        });
    }

    pub fn take_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.logs.lock())
    }

    pub fn next_resource_id(&self) -> u64 {
        self.next_resource_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn sse_count(&self) -> usize {
        self.sse.lock().len()
    }

    pub fn insert_sse(&self, id: u64, connection: Arc<SseConnection>) {
        self.sse.lock().insert(id, connection);
    }

    pub fn sse(&self, id: u64) -> Option<Arc<SseConnection>> {
        self.sse.lock().get(&id).cloned()
    }

    pub fn remove_sse(&self, id: u64) -> Option<Arc<SseConnection>> {
        self.sse.lock().remove(&id)
    }

    fn close_all_sse(&self) {
        let connections: Vec<Arc<SseConnection>> = self.sse.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close();
        }
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

static REQUESTS: Lazy<RwLock<HashMap<u64, Arc<RequestState>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Allocate a fresh request id and register its state. Ids are never reused
/// within a process lifetime.
pub fn new_state(env: Arc<Env>) -> u64 {
    let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let state = Arc::new(RequestState {
        id,
        env,
        logs: Mutex::new(Vec::new()),
        sse: Mutex::new(HashMap::new()),
        next_resource_id: AtomicU64::new(1),
    });
    REQUESTS.write().insert(id, state);
    debug!(target: "warren::registry", request = id, "request state created");
    id
}

/// Read-only lookup used by host ops invoked from JS.
pub fn get(id: u64) -> Option<Arc<RequestState>> {
    REQUESTS.read().get(&id).cloned()
}

/// Parse the stringified id JS hands to every host op and resolve it.
pub fn resolve(id_arg: &str) -> Result<Arc<RequestState>, String> {
    let id: u64 = id_arg
        .parse()
        .map_err(|_| format!("bad request id: {id_arg}"))?;
    get(id).ok_or_else(|| format!("no active request {id}"))
}

/// Remove the state and release everything it owns. Idempotent.
pub fn clear(id: u64) -> Option<Arc<RequestState>> {
    let state = REQUESTS.write().remove(&id);
    if let Some(state) = &state {
        state.close_all_sse();
        debug!(target: "warren::registry", request = id, "request state cleared");
    }
    state
}

/// Number of live request states; test support.
pub fn active_count() -> usize {
    REQUESTS.read().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_cleared() {
        let a = new_state(Arc::new(Env::new()));
        let b = new_state(Arc::new(Env::new()));
        assert!(b > a);

        assert!(get(a).is_some());
        clear(a);
        assert!(get(a).is_none());
        // Clearing twice is fine.
        assert!(clear(a).is_none());
        clear(b);
    }

    #[test]
    fn resolve_rejects_garbage() {
        assert!(resolve("not-a-number").is_err());
        assert!(resolve("999999999999").is_err());
    }

    #[test]
    fn logs_accumulate_in_order() {
        let id = new_state(Arc::new(Env::new()));
        let state = get(id).unwrap();
        state.log(LogLevel::Log, "first".into());
        state.log(LogLevel::Error, "second".into());
        let logs = state.take_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].level, LogLevel::Error);
        clear(id);
    }
}
