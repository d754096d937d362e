//! Console capture op.

use crate::registry;
use crate::result::LogLevel;
use warren_engine::{op_sync, OpDecl, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![op_sync("__console_log", 3, console_log)]
}

fn console_log(args: Vec<String>) -> OpResult {
    // Console must stay usable even between requests (e.g. a stray timer
    // callback during cleanup); entries without a live request go to tracing
    // only.
    match registry::resolve(&args[0]) {
        Ok(state) => {
            state.log(LogLevel::parse(&args[1]), args[2].clone());
        }
        Err(_) => {
            tracing::debug!(target: "warren::console", level = %args[1], "{}", args[2]);
        }
    }
    Ok("null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use std::sync::Arc;

    #[test]
    fn log_lands_in_request_state() {
        let id = registry::new_state(Arc::new(Env::new()));
        console_log(vec![id.to_string(), "warn".into(), "careful".into()]).unwrap();
        let state = registry::get(id).unwrap();
        let logs = state.take_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warn);
        assert_eq!(logs[0].message, "careful");
        registry::clear(id);
    }

    #[test]
    fn orphan_log_is_swallowed() {
        assert!(console_log(vec!["0".into(), "log".into(), "orphan".into()]).is_ok());
    }
}
