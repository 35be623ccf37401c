//! Host-side management of isolated worker processes.
//!
//! Spawns `membox-worker` with a clean environment, sends one Execute
//! message over length-delimited JSON IPC (stdin/stdout), and reads log
//! frames until the Complete frame arrives. The worker's stderr is
//! collected so a crashed worker can be diagnosed from the outcome.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::error::SandboxError;
use crate::ipc::{
    read_message_with_limit, write_message, ChildMessage, ParentMessage, Prelude, WorkerConfig,
};
use crate::request::ExecutionOutcome;

/// Environment variable naming the worker binary (absolute path).
pub const WORKER_BIN_ENV: &str = "MEMBOX_WORKER_BIN";

const WORKER_BIN_NAME: &str = "membox-worker";

/// Execute one snippet in an isolated worker process.
///
/// The worker enforces the execution timeout itself so it can report a
/// clean timeout outcome; the host grants a two second grace on top and
/// kills the worker if even that elapses.
pub(crate) async fn execute_in_child(
    code: &str,
    preludes: &[Prelude],
    config: &WorkerConfig,
) -> Result<ExecutionOutcome, SandboxError> {
    let worker_bin = find_worker_binary()?;
    let timeout = Duration::from_millis(config.timeout_ms);

    let mut child = Command::new(&worker_bin)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .env_clear()
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            SandboxError::Worker(anyhow::anyhow!(
                "failed to spawn worker at {}: {}",
                worker_bin.display(),
                e
            ))
        })?;

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Worker(anyhow::anyhow!("no stdin on child")))?;
    let child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Worker(anyhow::anyhow!("no stdout on child")))?;
    let mut child_stdout = BufReader::new(child_stdout);
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Worker(anyhow::anyhow!("no stderr on child")))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = child_stderr.read_to_string(&mut buf).await;
        buf
    });

    let execute_msg = ParentMessage::Execute {
        code: code.to_string(),
        preludes: preludes.to_vec(),
        config: config.clone(),
    };
    write_message(&mut child_stdin, &execute_msg)
        .await
        .map_err(SandboxError::Channel)?;

    let max_ipc = config.max_ipc_message_size;
    let read_result = tokio::time::timeout(
        timeout + Duration::from_secs(2),
        read_until_complete(&mut child_stdout, max_ipc),
    )
    .await;

    match read_result {
        Ok(Ok(Some((locals, error)))) => {
            let _ = child.wait().await;
            Ok(ExecutionOutcome { locals, error })
        }
        Ok(Ok(None)) => {
            // EOF without a Complete frame. The exit status tells us whether
            // the worker crashed or just misbehaved.
            let status = child
                .wait()
                .await
                .map_err(|e| SandboxError::Worker(anyhow::anyhow!("wait on worker failed: {e}")))?;
            let stderr = stderr_task.await.unwrap_or_default();
            if status.success() {
                return Err(SandboxError::Decode(
                    "worker exited without a result payload".to_string(),
                ));
            }
            let detail = if stderr.trim().is_empty() {
                format!("worker exited with status {status}")
            } else {
                stderr.trim().to_string()
            };
            tracing::warn!(%status, "sandbox worker exited abnormally");
            Ok(ExecutionOutcome::infrastructure(format!(
                "Sandbox worker failed: {detail}"
            )))
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            Err(SandboxError::Channel(e))
        }
        Err(_elapsed) => {
            // The worker missed its own deadline and the grace period.
            let _ = child.kill().await;
            Ok(ExecutionOutcome::infrastructure(format!(
                "TimeoutError: Code execution exceeded {} seconds.",
                crate::executor::format_timeout(config.timeout_ms)
            )))
        }
    }
}

/// Read child frames until Complete; forward Log frames to tracing.
/// Returns `None` on EOF before a Complete frame.
async fn read_until_complete(
    child_stdout: &mut BufReader<tokio::process::ChildStdout>,
    max_ipc: usize,
) -> Result<
    Option<(Option<std::collections::BTreeMap<String, serde_json::Value>>, String)>,
    std::io::Error,
> {
    loop {
        let msg: Option<ChildMessage> = read_message_with_limit(child_stdout, max_ipc).await?;
        match msg {
            Some(ChildMessage::Complete { locals, error }) => return Ok(Some((locals, error))),
            Some(ChildMessage::Log { message }) => {
                tracing::info!(target: "membox::sandbox::worker", "{}", message);
            }
            None => return Ok(None),
        }
    }
}

/// Find the `membox-worker` binary.
///
/// Search order:
/// 1. `MEMBOX_WORKER_BIN` environment variable (must be an absolute path)
/// 2. Same directory as the current executable
/// 3. Parent of that directory (test binaries live in `target/debug/deps/`)
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Worker(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let worker = dir.join(WORKER_BIN_NAME);
            if worker.exists() {
                validate_binary_permissions(&worker)?;
                return Ok(worker);
            }
            if let Some(parent) = dir.parent() {
                let worker = parent.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Worker(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside the host"
    )))
}

/// Validate binary file permissions (Unix only).
///
/// Rejects world-writable binaries to prevent substitution attacks.
fn validate_binary_permissions(_path: &std::path::Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Worker(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Worker(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}
