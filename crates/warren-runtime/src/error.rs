//! Error types for warren-runtime.

use thiserror::Error;
use warren_engine::EngineError;

/// Errors that can occur while orchestrating worker executions.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Engine-level failure (JS exception, timeout, OOM, broken isolate).
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// No source cached for the (site, deploy) key and no loader produced one.
    #[error("no source for site '{site}' deploy '{deploy}'")]
    NoSource { site: String, deploy: String },

    /// Source failed validation at compile time.
    #[error("source failed to compile: {0}")]
    Compile(String),

    /// Pool warm-up failed (setup fn error or top-level script error).
    #[error("pool warm-up failed: {0}")]
    PoolWarm(String),

    /// The environment configuration is inconsistent.
    #[error("invalid env: {0}")]
    InvalidEnv(String),

    /// Binding backend failure.
    #[error("binding error: {0}")]
    Binding(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<warren_bindings::BindingError> for RuntimeError {
    fn from(e: warren_bindings::BindingError) -> Self {
        Self::Binding(e.to_string())
    }
}

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
