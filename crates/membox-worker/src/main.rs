//! membox sandbox worker: an isolated child process for V8 execution.
//!
//! Spawned by the host with a cleared environment. Receives one Execute
//! message over stdin, runs the snippet in a fresh V8 isolate, and writes
//! the Complete frame to stdout. Diagnostics go to stderr, which the host
//! collects.

use anyhow::{Context, Result};
use membox_sandbox::ipc::{read_message, write_message, ChildMessage, ParentMessage};
use tokio::io::{self, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // The host spawns us with env_clear(); scrub again in case we were
    // launched by hand.
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending Execute")?;
    let ParentMessage::Execute {
        code,
        preludes,
        config,
    } = msg;

    let log = config.log;

    // V8 isolates are !Send; run on a dedicated thread with its own
    // single-threaded runtime.
    let (tx, rx) = tokio::sync::oneshot::channel();
    let exec_handle = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = tx.send(Err(anyhow::anyhow!("failed to create tokio runtime: {e}")));
                return;
            }
        };
        let result = rt.block_on(membox_sandbox::run_snippet(&config, &code, &preludes));
        let _ = tx.send(result.map_err(anyhow::Error::from));
    });

    let result = rx
        .await
        .map_err(|_| anyhow::anyhow!("execution thread exited without a result"))?;
    let _ = exec_handle.join();

    match result {
        Ok(outcome) => {
            if log {
                write_message(
                    &mut stdout,
                    &ChildMessage::Log {
                        message: format!(
                            "execution finished (locals: {}, error: {})",
                            outcome.locals.as_ref().map_or(0, |l| l.len()),
                            if outcome.error.is_empty() { "none" } else { "yes" }
                        ),
                    },
                )
                .await
                .context("failed to write log frame to parent")?;
            }
            write_message(
                &mut stdout,
                &ChildMessage::Complete {
                    locals: outcome.locals,
                    error: outcome.error,
                },
            )
            .await
            .context("failed to write result to parent")?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
