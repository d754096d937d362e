//! EventSource / background SSE connection manager.
//!
//! Each request may hold a bounded number of server-sent-event connections.
//! The HTTP read runs as a background tokio task; the JS side only ever sees
//! the bounded event buffer, drained through the `__eventSourcePoll` op. On
//! request end the orchestrator closes every connection the request still
//! owns.

use crate::net::ensure_public_target;
use crate::registry::RequestState;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Most simultaneous connections one request may hold.
pub const MAX_CONNECTIONS_PER_REQUEST: usize = 10;
/// Most buffered events per connection; producers drop beyond this.
pub const MAX_BUFFERED_EVENTS: usize = 1000;
/// Connect + read budget for one connection, independent of the request
/// deadline.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One live (or finished) SSE connection.
pub struct SseConnection {
    state: AtomicU8,
    events: Mutex<VecDeque<JsonValue>>,
    dropped: AtomicU64,
    notify: Notify,
}

impl SseConnection {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CONNECTING),
            events: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn state_str(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => "connecting",
            STATE_OPEN => "open",
            _ => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Ask the background task to stop and drop the HTTP connection.
    pub fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Number of events dropped to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain all buffered events.
    pub fn poll(&self) -> Vec<JsonValue> {
        self.events.lock().drain(..).collect()
    }

    fn push(&self, event: JsonValue) {
        let mut events = self.events.lock();
        if events.len() >= MAX_BUFFERED_EVENTS {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        events.push_back(event);
    }

    fn mark_open(&self) {
        // Only CONNECTING may transition to OPEN; a close that raced the
        // handshake wins.
        let _ = self.state.compare_exchange(
            STATE_CONNECTING,
            STATE_OPEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.push(json!({ "type": "open" }));
    }

    fn mark_error(&self, message: &str) {
        self.push(json!({ "type": "error", "message": message }));
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    fn mark_finished(&self) {
        // Stream ended server-side. No auto-reconnect: surface an error
        // event and close, letting the JS side decide.
        self.push(json!({ "type": "error", "message": "stream ended" }));
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

/// A parsed SSE event, before JSON envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental text/event-stream parser. Feed it chunks; it yields complete
/// events at blank-line boundaries.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
    event: Option<String>,
    id: Option<String>,
    last_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let mut line = self.buffer[..newline].to_string();
            self.buffer.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };

            match field {
                "data" => self.data_lines.push(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                "id" => {
                    // Ids containing NUL are ignored per the SSE spec.
                    if !value.contains('\0') {
                        self.id = Some(value.to_string());
                        self.last_id = Some(value.to_string());
                    }
                }
                // "retry" and unknown fields are ignored; there is no
                // client-side reconnect here.
                _ => {}
            }
        }

        events
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
            id: self.id.clone().or_else(|| self.last_id.clone()),
        };
        self.data_lines.clear();
        Some(event)
    }
}

/// Open a new connection for `state`. Validates the target, enforces the
/// per-request cap, and spawns the background reader on `handle`. Returns
/// the connection id.
pub fn connect(
    state: &Arc<RequestState>,
    url: &str,
    headers: Vec<(String, String)>,
    allow_private: bool,
    handle: &tokio::runtime::Handle,
) -> Result<u64, String> {
    if state.sse_count() >= MAX_CONNECTIONS_PER_REQUEST {
        return Err(format!(
            "EventSource limit reached ({MAX_CONNECTIONS_PER_REQUEST} per request)"
        ));
    }

    let target = ensure_public_target(url, allow_private)?;

    let connection = Arc::new(SseConnection::new());
    let id = state.next_resource_id();
    state.insert_sse(id, connection.clone());

    let request_id = state.id;
    let url_string = target.to_string();
    handle.spawn(async move {
        run_connection(connection, url_string.clone(), headers).await;
        debug!(target: "warren::sse", request = request_id, url = %url_string, "connection finished");
    });

    Ok(id)
}

async fn run_connection(conn: Arc<SseConnection>, url: String, headers: Vec<(String, String)>) {
    let client = match reqwest::Client::builder()
        .timeout(CONNECTION_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            conn.mark_error(&format!("client setup failed: {e}"));
            return;
        }
    };

    let mut request = client.get(&url).header("accept", "text/event-stream");
    for (name, value) in headers {
        request = request.header(name, value);
    }

    let response = tokio::select! {
        _ = conn.notify.notified() => return,
        response = request.send() => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            conn.mark_error(&format!("connect failed: {e}"));
            return;
        }
    };

    if !response.status().is_success() {
        conn.mark_error(&format!("upstream status {}", response.status().as_u16()));
        return;
    }

    conn.mark_open();

    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();
    loop {
        if conn.is_closed() {
            break;
        }
        let chunk = tokio::select! {
            _ = conn.notify.notified() => break,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
                    conn.push(json!({
                        "type": "message",
                        "event": event.event,
                        "data": event.data,
                        "lastEventId": event.id,
                    }));
                }
            }
            Some(Err(e)) => {
                conn.mark_error(&format!("read failed: {e}"));
                break;
            }
            None => {
                conn.mark_finished();
                break;
            }
        }
    }

    if conn.dropped() > 0 {
        warn!(target: "warren::sse", url = %url, dropped = conn.dropped(), "events dropped to backpressure");
    }
}
