//! Pre-execution code validation.
//!
//! A cheap textual screen run before anything is sent to a worker. The
//! runtime hardening in the bootstrap is the real barrier; this pass exists
//! to reject obvious escape attempts early with a legible message instead
//! of spending a process spawn on them.

use crate::error::SandboxError;

/// Default ceiling on snippet size in bytes.
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Substrings that are never legitimate in a capability-only snippet.
const BANNED_PATTERNS: &[&str] = &[
    "eval(",
    "Function(",
    "import(",
    "require(",
    "Deno.",
    "__proto__",
    "constructor[",
    "constructor.constructor",
    "Reflect.",
    "globalThis[",
    "String.fromCharCode",
    "process.env",
    "process.exit",
    "process.argv",
    "process.binding",
    "XMLHttpRequest",
    "WebAssembly",
];

/// Validate a snippet before execution.
pub fn validate_code(code: &str, max_size: usize) -> Result<(), SandboxError> {
    if code.trim().is_empty() {
        return Err(SandboxError::Validation {
            reason: "code is empty".to_string(),
        });
    }
    if code.len() > max_size {
        return Err(SandboxError::CodeTooLarge {
            max: max_size,
            actual: code.len(),
        });
    }
    for pattern in BANNED_PATTERNS {
        if code.contains(pattern) {
            return Err(SandboxError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }
    Ok(())
}
