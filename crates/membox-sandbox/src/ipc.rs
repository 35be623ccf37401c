//! IPC protocol between the host and the worker process.
//!
//! Length-delimited JSON messages: a 4-byte big-endian length prefix
//! followed by the JSON payload. The host sends a single
//! [`ParentMessage::Execute`]; the worker replies with zero or more
//! [`ChildMessage::Log`] frames and exactly one [`ChildMessage::Complete`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::capabilities::SizeLimits;

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// A prelude script evaluated in the snippet's namespace before the
/// snippet itself, resolved by the host from the requirements manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prelude {
    /// Display name used in install-failure messages.
    pub name: String,
    /// Script source.
    pub source: String,
}

/// Messages sent from the host process to the worker child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// The single request: execute this snippet in the sandbox.
    Execute {
        /// The snippet to execute.
        code: String,
        /// Prelude scripts to evaluate first.
        preludes: Vec<Prelude>,
        /// Per-invocation worker configuration.
        config: WorkerConfig,
    },
}

/// Messages sent from the worker child to the host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// The execution has finished, one way or another.
    Complete {
        /// Captured top-level bindings; `None` on infrastructure failure.
        locals: Option<BTreeMap<String, Value>>,
        /// Empty on success.
        error: String,
    },
    /// A diagnostic line from the worker.
    Log {
        /// The log message text.
        message: String,
    },
}

/// Everything the worker needs to run one snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Wall-clock budget in milliseconds.
    pub timeout_ms: u64,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum size of the marshaled locals payload in bytes.
    pub max_output_size: usize,
    /// Maximum snippet size in bytes.
    pub max_code_size: usize,
    /// Maximum IPC message size in bytes. Defaults to
    /// [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
    /// Filesystem confinement root, if any.
    pub allowed_root: Option<PathBuf>,
    /// Size ceilings for mutating capability functions.
    pub size_limits: SizeLimits,
    /// Capability functions to expose, as `module.function` pairs.
    pub exposed_ops: Vec<(String, String)>,
    /// Raw blacklist entries.
    pub blacklist: Vec<String>,
    /// Caller-supplied data globals.
    pub bindings: BTreeMap<String, Value>,
    /// Verbose tracing for this invocation.
    pub log: bool,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

/// Write a length-delimited JSON message to an async writer.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` at EOF (clean shutdown). Uses
/// [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_config() -> WorkerConfig {
        WorkerConfig {
            timeout_ms: 20_000,
            max_heap_size: 64 * 1024 * 1024,
            max_output_size: 1024 * 1024,
            max_code_size: 64 * 1024,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
            allowed_root: Some(PathBuf::from("/tmp/mem")),
            size_limits: SizeLimits::default(),
            exposed_ops: vec![("memory".into(), "read_file".into())],
            blacklist: vec!["memory.delete_file".into()],
            bindings: BTreeMap::new(),
            log: false,
        }
    }

    #[tokio::test]
    async fn roundtrip_execute_message() {
        let msg = ParentMessage::Execute {
            code: "x = 1 + 1".into(),
            preludes: vec![Prelude {
                name: "helpers.js".into(),
                source: "function double(n) { return n * 2; }".into(),
            }],
            config: sample_config(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: ParentMessage = read_message(&mut cursor).await.unwrap().unwrap();
        let ParentMessage::Execute { code, preludes, config } = decoded;
        assert_eq!(code, "x = 1 + 1");
        assert_eq!(preludes.len(), 1);
        assert_eq!(preludes[0].name, "helpers.js");
        assert_eq!(config.timeout_ms, 20_000);
        assert_eq!(config.exposed_ops[0].1, "read_file");
    }

    #[tokio::test]
    async fn roundtrip_complete_with_locals() {
        let mut locals = BTreeMap::new();
        locals.insert("x".to_string(), serde_json::json!(2));
        let msg = ChildMessage::Complete {
            locals: Some(locals),
            error: String::new(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        match decoded {
            ChildMessage::Complete { locals, error } => {
                assert_eq!(locals.unwrap()["x"], 2);
                assert!(error.is_empty());
            }
            other => panic!("expected Complete, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn roundtrip_infrastructure_failure() {
        let msg = ChildMessage::Complete {
            locals: None,
            error: "TimeoutError: Code execution exceeded 20 seconds.".into(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        match decoded {
            ChildMessage::Complete { locals, error } => {
                assert!(locals.is_none());
                assert!(error.starts_with("TimeoutError"));
            }
            other => panic!("expected Complete, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn log_frames_interleave_before_complete() {
        let mut buf = Vec::new();
        write_message(&mut buf, &ChildMessage::Log { message: "step 1".into() })
            .await
            .unwrap();
        write_message(
            &mut buf,
            &ChildMessage::Complete {
                locals: Some(BTreeMap::new()),
                error: String::new(),
            },
        )
        .await
        .unwrap();

        let mut cursor = Cursor::new(buf);
        let d1: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        let d2: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        assert!(matches!(d1, ChildMessage::Log { .. }));
        assert!(matches!(d2, ChildMessage::Complete { .. }));
        let d3: Option<ChildMessage> = read_message(&mut cursor).await.unwrap();
        assert!(d3.is_none());
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result: Option<ParentMessage> = read_message(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_message_with_limit_rejects_oversized() {
        let msg = ChildMessage::Log {
            message: "x".repeat(1024),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let result: Result<Option<ChildMessage>, _> =
            read_message_with_limit(&mut cursor, 64).await;
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("too large"), "error: {err_msg}");
    }

    #[tokio::test]
    async fn worker_config_ipc_limit_serde_default() {
        let json = r#"{
            "timeout_ms": 5000,
            "max_heap_size": 67108864,
            "max_output_size": 1048576,
            "max_code_size": 65536,
            "allowed_root": null,
            "size_limits": {
                "max_file_size": 1048576,
                "max_dir_size": 10485760,
                "max_total_size": 104857600
            },
            "exposed_ops": [],
            "blacklist": [],
            "bindings": {},
            "log": false
        }"#;
        let config: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_ipc_message_size, DEFAULT_MAX_IPC_MESSAGE_SIZE);
    }
}
