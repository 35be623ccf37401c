//! Error types for the membox sandbox.

use thiserror::Error;

/// Errors raised by the sandbox infrastructure.
///
/// Failures that originate inside the executed snippet (denied paths, missing
/// files, size-ceiling violations, ordinary exceptions) are never represented
/// here; they come back as data in
/// [`ExecutionOutcome`](crate::request::ExecutionOutcome). This enum covers
/// the cases where the sandbox itself is unusable for a request.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code failed pre-execution validation checks.
    #[error("code validation failed: {reason}")]
    Validation {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`; the sandbox exposes only the injected capability functions and has no module, network, or process access")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The worker process could not be spawned or managed.
    #[error("sandbox worker failure: {0}")]
    Worker(#[from] anyhow::Error),

    /// The IPC channel to the worker broke.
    #[error("ipc channel failure: {0}")]
    Channel(#[source] std::io::Error),

    /// The worker's output payload was corrupt or missing.
    #[error("failed to decode sandbox output: {0}")]
    Decode(String),

    /// The marshaled locals payload exceeds the configured maximum size.
    #[error("result payload exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },
}
