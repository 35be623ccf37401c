//! Audit logging for sandbox executions.
//!
//! Every execution emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash of the snippet (never raw code in logs)
//! - A preview of the first 500 chars of the snippet
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any
//! `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::request::ExecutionOutcome;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single sandbox execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// ISO-8601 timestamp of when execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted snippet.
    pub code_hash: String,
    /// First N characters of the snippet (for human review).
    pub code_preview: String,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of a sandbox execution, as recorded in the audit log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The snippet ran to completion.
    Success,
    /// The snippet failed; bindings made before the failure survived.
    SnippetError {
        /// The error message.
        message: String,
    },
    /// The sandbox reported an infrastructure failure as data (timeout,
    /// install failure, worker crash).
    Infrastructure {
        /// The error message.
        message: String,
    },
    /// The sandbox raised an error to the caller.
    Raised {
        /// The error message.
        message: String,
    },
}

impl AuditOutcome {
    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SnippetError { .. } => "snippet_error",
            Self::Infrastructure { .. } => "infrastructure",
            Self::Raised { .. } => "raised",
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Discards all audit entries.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Builds an [`AuditEntry`] across the lifetime of one execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    started: Instant,
}

impl AuditEntryBuilder {
    /// Start building an entry for the given snippet.
    pub fn new(code: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: code_preview(code),
            started: Instant::now(),
        }
    }

    /// Finish the entry from the execution result.
    pub fn finish(self, result: &Result<ExecutionOutcome, SandboxError>) -> AuditEntry {
        let outcome = match result {
            Ok(o) if o.is_success() => AuditOutcome::Success,
            Ok(o) if o.is_infrastructure_failure() => AuditOutcome::Infrastructure {
                message: o.error.clone(),
            },
            Ok(o) => AuditOutcome::SnippetError {
                message: o.error.clone(),
            },
            Err(e) => AuditOutcome::Raised {
                message: e.to_string(),
            },
        };
        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            duration_ms: self.started.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let result = hasher.finalize();
    let mut s = String::with_capacity(result.len() * 2);
    for b in result {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Create a code preview (first N chars, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary to avoid panics on multibyte
/// characters.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        code.to_string()
    } else {
        let mut end = CODE_PREVIEW_MAX;
        while !code.is_char_boundary(end) {
            end -= 1;
        }
        let mut preview = code[..end].to_string();
        preview.push_str("...");
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn builder_classifies_outcomes() {
        let ok = Ok(ExecutionOutcome::success(BTreeMap::new()));
        let entry = AuditEntryBuilder::new("x = 1").finish(&ok);
        assert!(matches!(entry.outcome, AuditOutcome::Success));
        assert_eq!(entry.code_hash.len(), 64);
        assert_eq!(entry.code_preview, "x = 1");

        let snip = Ok(ExecutionOutcome::snippet_failure(
            BTreeMap::new(),
            "Exception in sandboxed code:\nboom",
        ));
        let entry = AuditEntryBuilder::new("x = 1").finish(&snip);
        assert!(matches!(entry.outcome, AuditOutcome::SnippetError { .. }));

        let infra = Ok(ExecutionOutcome::infrastructure(
            "TimeoutError: Code execution exceeded 20 seconds.",
        ));
        let entry = AuditEntryBuilder::new("x = 1").finish(&infra);
        assert!(matches!(entry.outcome, AuditOutcome::Infrastructure { .. }));

        let raised: Result<ExecutionOutcome, SandboxError> =
            Err(SandboxError::ConcurrencyLimit { max: 8 });
        let entry = AuditEntryBuilder::new("x = 1").finish(&raised);
        assert!(matches!(entry.outcome, AuditOutcome::Raised { .. }));
    }

    #[test]
    fn preview_truncates_at_char_boundary() {
        let code = "é".repeat(400); // 800 bytes
        let preview = code_preview(&code);
        assert!(preview.ends_with("..."));
        assert!(preview.len() <= CODE_PREVIEW_MAX + 3);
    }

    #[tokio::test]
    async fn json_lines_logger_writes_one_line_per_entry() {
        let buf = Vec::new();
        let logger = JsonLinesAuditLogger::new(buf);
        let entry = AuditEntryBuilder::new("x = 1")
            .finish(&Ok(ExecutionOutcome::success(BTreeMap::new())));
        logger.log(&entry).await;
        logger.log(&entry).await;

        let written = logger.writer.into_inner();
        let text = String::from_utf8(written).unwrap();
        assert_eq!(text.lines().count(), 2);
        let parsed: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["outcome"], "success");
        assert_eq!(parsed["code_preview"], "x = 1");
    }
}
