//! Queue binding ops.

use super::op_err;
use crate::registry::{self, RequestState};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use warren_bindings::QueueSender;
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![
        op_sync("__queue_send", 3, queue_send),
        op_sync("__queue_sendBatch", 3, queue_send_batch),
    ]
}

fn sender_for(state: &RequestState, name: &str) -> Result<Arc<dyn QueueSender>, OpError> {
    state
        .env
        .queues
        .get(name)
        .cloned()
        .ok_or_else(|| OpError::new(format!("unknown queue binding '{name}'")))
}

fn queue_send(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let sender = sender_for(&state, &args[1])?;
    let message: JsonValue = serde_json::from_str(&args[2]).map_err(op_err)?;
    sender.send(message).map_err(op_err)?;
    Ok("null".to_string())
}

fn queue_send_batch(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let sender = sender_for(&state, &args[1])?;
    let messages: Vec<JsonValue> = serde_json::from_str(&args[2]).map_err(op_err)?;
    sender.send_batch(messages).map_err(op_err)?;
    Ok("null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use serde_json::json;
    use warren_bindings::MemoryQueue;

    #[test]
    fn messages_reach_the_backend() {
        let queue = Arc::new(MemoryQueue::new());
        let mut env = Env::new();
        env.queues.insert("Q".into(), queue.clone());
        let id = registry::new_state(Arc::new(env));
        let rid = id.to_string();

        queue_send(vec![rid.clone(), "Q".into(), "{\"n\":1}".into()]).unwrap();
        queue_send_batch(vec![rid, "Q".into(), "[2,3]".into()]).unwrap();

        assert_eq!(queue.sent(), vec![json!({"n":1}), json!(2), json!(3)]);
        registry::clear(id);
    }
}
