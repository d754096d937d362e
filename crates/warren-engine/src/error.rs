//! Error types for warren-engine.

use thiserror::Error;

/// Errors produced by isolate operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A JavaScript exception escaped to the host.
    #[error("{0}")]
    Js(String),

    /// The deadline passed while script or event-loop work was pending.
    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    /// The isolate hit its heap cap. The isolate is corrupt after this.
    #[error("script exceeded memory limit")]
    MemoryLimit,

    /// The engine itself is broken (failed context creation, poisoned
    /// runtime). The isolate must be discarded.
    #[error("fatal engine error: {0}")]
    Fatal(String),

    /// The named global did not hold an awaitable value.
    #[error("global '{0}' is not awaitable")]
    NotAwaitable(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether the isolate that produced this error must be discarded
    /// rather than returned to a pool.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::MemoryLimit | Self::Fatal(_)
        )
    }
}

/// Classify a raw QuickJS exception message.
///
/// QuickJS reports an armed-deadline interrupt as `InternalError: interrupted`
/// and heap exhaustion as an out-of-memory InternalError; both leave the
/// isolate in a state we treat as corrupt.
pub(crate) fn classify_js_message(message: &str, timeout_ms: u64) -> EngineError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("interrupted") {
        EngineError::Timeout(timeout_ms)
    } else if lower.contains("out of memory") || lower.contains("allocation failed") {
        EngineError::MemoryLimit
    } else {
        EngineError::Js(message.to_string())
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
