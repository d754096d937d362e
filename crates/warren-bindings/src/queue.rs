//! Queue binding contract and the in-memory recorder backend.

use crate::error::BindingResult;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

/// Contract a queue producer must satisfy. Message bodies are JSON.
pub trait QueueSender: Send + Sync {
    fn send(&self, message: JsonValue) -> BindingResult<()>;

    fn send_batch(&self, messages: Vec<JsonValue>) -> BindingResult<()> {
        for message in messages {
            self.send(message)?;
        }
        Ok(())
    }
}

/// In-memory queue that records sent messages, for development and tests.
pub struct MemoryQueue {
    messages: Mutex<Vec<JsonValue>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<JsonValue> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSender for MemoryQueue {
    fn send(&self, message: JsonValue) -> BindingResult<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_and_batch_preserve_order() {
        let queue = MemoryQueue::new();
        queue.send(json!({"n": 1})).unwrap();
        queue
            .send_batch(vec![json!({"n": 2}), json!({"n": 3})])
            .unwrap();
        assert_eq!(
            queue.sent(),
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
        );
    }
}
